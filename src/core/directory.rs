use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::scope::Scope;

/// A workspace folder under automation (a.k.a. project).
///
/// Unique by (scope, path) among non-archived rows. The directory is the
/// unit for git status tracking, project settings, and project-level
/// automation policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Directory {
    /// Unique identifier (`directory-<uuid>`).
    pub id: String,

    /// Owning scope triple.
    #[serde(flatten)]
    pub scope: Scope,

    /// Absolute filesystem path.
    pub path: String,

    /// When the directory was registered.
    pub created_at: DateTime<Utc>,

    /// When the directory was archived, if it was.
    pub archived_at: Option<DateTime<Utc>>,
}

impl Directory {
    /// Create a new non-archived directory record.
    #[must_use]
    pub fn new(id: String, scope: Scope, path: String) -> Self {
        Self {
            id,
            scope,
            path,
            created_at: Utc::now(),
            archived_at: None,
        }
    }

    /// Whether the directory is still active.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.archived_at.is_none()
    }
}
