use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::ControlError;
use super::scope::Scope;

/// A unit of schedulable work.
///
/// Tasks live in one of three scopes derived from their links: project
/// (directory link wins), repository, or global. `order_index` is the
/// monotone per-scope ordering key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Unique identifier (`task-<uuid>`).
    pub id: String,

    /// Owning scope triple.
    #[serde(flatten)]
    pub scope: Scope,

    /// Linked repository, if any.
    pub repository_id: Option<String>,

    /// Linked project (directory), if any. Wins over the repository link
    /// for scope-kind derivation.
    pub project_id: Option<String>,

    /// Derived scope kind.
    pub scope_kind: TaskScopeKind,

    /// Short title.
    pub title: String,

    /// Longer body text.
    pub body: String,

    /// Lifecycle status.
    pub status: TaskStatus,

    /// Per-scope ordering key, unique within the scope.
    pub order_index: i64,

    /// Claim state; present exactly while the task is in progress.
    pub claim: Option<TaskClaim>,

    /// When the task was completed, if it was.
    pub completed_at: Option<DateTime<Utc>>,

    /// Linear import metadata, when the task came from Linear.
    pub linear: Option<LinearFields>,

    /// When the task was created.
    pub created_at: DateTime<Utc>,

    /// When the task was last updated.
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Derive the scope kind from the project/repository links.
    #[must_use]
    pub fn derive_scope_kind(
        project_id: Option<&str>,
        repository_id: Option<&str>,
    ) -> TaskScopeKind {
        if project_id.is_some() {
            TaskScopeKind::Project
        } else if repository_id.is_some() {
            TaskScopeKind::Repository
        } else {
            TaskScopeKind::Global
        }
    }
}

/// Exclusive claim on an in-progress task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskClaim {
    /// Controller holding the claim.
    pub controller_id: String,

    /// Directory the task is being worked in, when known.
    pub directory_id: Option<String>,

    /// Working branch.
    pub branch_name: Option<String>,

    /// Base branch the work forks from.
    pub base_branch: Option<String>,

    /// When the claim was taken.
    pub claimed_at: DateTime<Utc>,
}

/// Task lifecycle status.
///
/// ```text
/// draft -> ready -> in-progress -> completed
///   ^        ^          |             |
///   |        +----------+  (draft/ready clear the claim)
///   +---------------------------------+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    /// Not yet schedulable.
    #[default]
    Draft,

    /// Eligible for claiming.
    Ready,

    /// Exclusively claimed by a controller.
    InProgress,

    /// Finished.
    Completed,
}

impl TaskStatus {
    /// Stable storage representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Ready => "ready",
            Self::InProgress => "in-progress",
            Self::Completed => "completed",
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = ControlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "ready" => Ok(Self::Ready),
            // Legacy rows persisted before the rename.
            "queued" => Ok(Self::Ready),
            "in-progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            other => Err(ControlError::integrity(format!(
                "expected task status enum value, got '{other}'"
            ))),
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which scope a task is ordered and pulled within.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskScopeKind {
    /// No repository or project link.
    Global,

    /// Linked to a repository only.
    Repository,

    /// Linked to a project (directory).
    Project,
}

impl TaskScopeKind {
    /// Stable storage representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::Repository => "repository",
            Self::Project => "project",
        }
    }
}

impl std::str::FromStr for TaskScopeKind {
    type Err = ControlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "global" => Ok(Self::Global),
            "repository" => Ok(Self::Repository),
            "project" => Ok(Self::Project),
            other => Err(ControlError::integrity(format!(
                "expected task scope kind enum value, got '{other}'"
            ))),
        }
    }
}

/// Linear issue metadata attached to an imported task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct LinearFields {
    /// Linear issue id.
    pub issue_id: Option<String>,

    /// Human identifier like `ENG-123`, normalized uppercase.
    pub identifier: Option<String>,

    /// Team name.
    pub team: Option<String>,

    /// Project name.
    pub project: Option<String>,

    /// Workflow state name.
    pub state: Option<String>,

    /// Assignee display name.
    pub assignee: Option<String>,

    /// Priority 0 (none) through 4 (low).
    pub priority: Option<u8>,

    /// Point estimate, non-negative.
    pub estimate: Option<f64>,

    /// Due date as `YYYY-MM-DD`.
    pub due_date: Option<String>,

    /// Label ids.
    #[serde(default)]
    pub label_ids: Vec<String>,
}

impl LinearFields {
    /// Validate field constraints before persisting.
    ///
    /// # Errors
    ///
    /// Returns a validation error for an out-of-range priority, a negative
    /// estimate, or a malformed due date.
    pub fn validate(&self) -> Result<(), ControlError> {
        if let Some(priority) = self.priority {
            if priority > 4 {
                return Err(ControlError::validation(
                    "expected integer [0..4] for linear.priority",
                ));
            }
        }
        if let Some(estimate) = self.estimate {
            if estimate < 0.0 {
                return Err(ControlError::validation(
                    "expected non-negative number for linear.estimate",
                ));
            }
        }
        if let Some(ref due) = self.due_date {
            if !is_iso_date(due) {
                return Err(ControlError::validation(format!(
                    "expected YYYY-MM-DD for linear.dueDate, got '{due}'"
                )));
            }
        }
        Ok(())
    }
}

/// Check the `YYYY-MM-DD` shape without pulling in a date parser.
fn is_iso_date(s: &str) -> bool {
    let bytes = s.as_bytes();
    bytes.len() == 10
        && bytes[4] == b'-'
        && bytes[7] == b'-'
        && bytes
            .iter()
            .enumerate()
            .all(|(i, b)| matches!(i, 4 | 7) || b.is_ascii_digit())
        && chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn scope_kind_prefers_project() {
        assert_eq!(
            Task::derive_scope_kind(Some("dir-1"), Some("repo-1")),
            TaskScopeKind::Project
        );
        assert_eq!(
            Task::derive_scope_kind(None, Some("repo-1")),
            TaskScopeKind::Repository
        );
        assert_eq!(Task::derive_scope_kind(None, None), TaskScopeKind::Global);
    }

    #[test]
    fn legacy_queued_reads_as_ready() {
        assert_eq!(TaskStatus::from_str("queued").unwrap(), TaskStatus::Ready);
    }

    #[test]
    fn linear_validation_bounds() {
        let mut fields = LinearFields {
            priority: Some(5),
            ..LinearFields::default()
        };
        assert!(fields.validate().is_err());

        fields.priority = Some(4);
        fields.due_date = Some("2026-02-30".to_owned());
        assert!(fields.validate().is_err());

        fields.due_date = Some("2026-02-28".to_owned());
        assert!(fields.validate().is_ok());
    }
}
