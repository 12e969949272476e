use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::scope::Scope;

/// A tracked source repository, shared by tasks and pull requests within
/// its scope triple.
///
/// Unique by (scope, remote URL) among non-archived rows; upserting a URL
/// that only exists archived restores the archived row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Repository {
    /// Unique identifier (`repository-<uuid>`).
    pub id: String,

    /// Owning scope triple.
    #[serde(flatten)]
    pub scope: Scope,

    /// Human-readable name.
    pub name: String,

    /// Remote URL (https or ssh form).
    pub remote_url: String,

    /// Default branch, `main` unless overridden.
    pub default_branch: String,

    /// Opaque metadata map.
    pub metadata: serde_json::Value,

    /// When the repository was registered.
    pub created_at: DateTime<Utc>,

    /// When the repository was archived, if it was.
    pub archived_at: Option<DateTime<Utc>>,
}

impl Repository {
    /// Default branch used when none is supplied.
    pub const DEFAULT_BRANCH: &'static str = "main";

    /// Whether the repository is still active.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.archived_at.is_none()
    }
}
