use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::ControlError;
use super::scope::Scope;

/// A reconciled GitHub pull request.
///
/// Keyed by a stable record id, unique per (repository, number). Rows are
/// upserted by the sync loop and by the PR-create command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitHubPullRequest {
    /// Stable record id (`github-pr-<uuid>`).
    pub id: String,

    /// Owning scope triple.
    #[serde(flatten)]
    pub scope: Scope,

    /// Repository the PR belongs to.
    pub repository_id: String,

    /// Directory the branch was observed in, when known.
    pub directory_id: Option<String>,

    /// PR number.
    pub number: i64,

    /// PR title.
    pub title: String,

    /// Web URL.
    pub url: String,

    /// Author login.
    pub author: Option<String>,

    /// Head branch name.
    pub head_branch: String,

    /// Base branch name.
    pub base_branch: String,

    /// Head commit SHA at last observation.
    pub head_sha: String,

    /// Open/closed state.
    pub state: PullRequestState,

    /// Whether the PR is a draft.
    pub draft: bool,

    /// Aggregated CI state over the PR's jobs.
    pub ci_rollup: CiRollup,

    /// When the sync loop last observed the PR.
    pub observed_at: DateTime<Utc>,

    /// When the record was first written.
    pub created_at: DateTime<Utc>,
}

/// Open/closed state of a pull request record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PullRequestState {
    /// PR is open on GitHub.
    Open,

    /// PR was closed or merged, or vanished from the head branch.
    Closed,
}

impl PullRequestState {
    /// Stable storage representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closed => "closed",
        }
    }
}

impl std::str::FromStr for PullRequestState {
    type Err = ControlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(Self::Open),
            "closed" => Ok(Self::Closed),
            other => Err(ControlError::integrity(format!(
                "expected pull request state enum value, got '{other}'"
            ))),
        }
    }
}

/// One CI job observed on a PR's head commit.
///
/// The union of check runs and commit status contexts; replaced wholesale
/// per PR on every sync. Unique per (pr, provider, external id).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitHubPrJob {
    /// Stable record id (`github-job-<uuid>`).
    pub id: String,

    /// Owning PR record.
    pub pr_record_id: String,

    /// Where the job came from (`check-run` or `status-context`).
    pub provider: String,

    /// Provider-side id.
    pub external_id: String,

    /// Job name.
    pub name: String,

    /// Raw provider status (`queued`, `in_progress`, `completed`, ...).
    pub status: String,

    /// Raw provider conclusion when completed.
    pub conclusion: Option<String>,

    /// Job detail URL.
    pub url: Option<String>,

    /// When the job started.
    pub started_at: Option<DateTime<Utc>>,

    /// When the job completed.
    pub completed_at: Option<DateTime<Utc>>,
}

/// Per-(repository, directory, branch) reconciliation bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitHubSyncState {
    /// Owning scope triple.
    #[serde(flatten)]
    pub scope: Scope,

    /// Repository being reconciled.
    pub repository_id: String,

    /// Directory whose checkout tracks the branch, when known.
    pub directory_id: Option<String>,

    /// Branch being reconciled.
    pub branch: String,

    /// When the last sync attempt ran.
    pub last_sync_at: Option<DateTime<Utc>>,

    /// When the last sync attempt succeeded.
    pub last_success_at: Option<DateTime<Utc>>,

    /// Message of the last failure, cleared on success.
    pub last_error: Option<String>,

    /// When the last failure occurred.
    pub last_error_at: Option<DateTime<Utc>>,
}

/// Single-value aggregate over a PR's jobs, used for display and gating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CiRollup {
    /// No jobs observed.
    #[default]
    None,

    /// At least one job has not completed.
    Pending,

    /// At least one job failed, timed out, or requires action.
    Failure,

    /// No failures, but at least one job was cancelled.
    Cancelled,

    /// At least one success and nothing pending, failed, or cancelled.
    Success,

    /// Jobs completed without any of the above conclusions.
    Neutral,
}

impl CiRollup {
    /// Stable storage representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Pending => "pending",
            Self::Failure => "failure",
            Self::Cancelled => "cancelled",
            Self::Success => "success",
            Self::Neutral => "neutral",
        }
    }
}

impl std::str::FromStr for CiRollup {
    type Err = ControlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "pending" => Ok(Self::Pending),
            "failure" => Ok(Self::Failure),
            "cancelled" => Ok(Self::Cancelled),
            "success" => Ok(Self::Success),
            "neutral" => Ok(Self::Neutral),
            other => Err(ControlError::integrity(format!(
                "expected ci rollup enum value, got '{other}'"
            ))),
        }
    }
}

/// Derive the CI rollup from a PR's jobs.
///
/// Priority: failure, then pending, then cancelled, then success, then
/// neutral. An empty job list is `none`.
#[must_use]
pub fn derive_ci_rollup(jobs: &[GitHubPrJob]) -> CiRollup {
    if jobs.is_empty() {
        return CiRollup::None;
    }

    let mut has_pending = false;
    let mut has_failure = false;
    let mut has_cancelled = false;
    let mut has_success = false;

    for job in jobs {
        if job.status != "completed" {
            has_pending = true;
        }
        match job.conclusion.as_deref() {
            Some("failure" | "timed_out" | "action_required") => has_failure = true,
            Some("cancelled") => has_cancelled = true,
            Some("success") => has_success = true,
            _ => {}
        }
    }

    if has_failure {
        CiRollup::Failure
    } else if has_pending {
        CiRollup::Pending
    } else if has_cancelled {
        CiRollup::Cancelled
    } else if has_success {
        CiRollup::Success
    } else {
        CiRollup::Neutral
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(status: &str, conclusion: Option<&str>) -> GitHubPrJob {
        GitHubPrJob {
            id: "github-job-test".to_owned(),
            pr_record_id: "github-pr-test".to_owned(),
            provider: "check-run".to_owned(),
            external_id: "1".to_owned(),
            name: "build".to_owned(),
            status: status.to_owned(),
            conclusion: conclusion.map(str::to_owned),
            url: None,
            started_at: None,
            completed_at: None,
        }
    }

    #[test]
    fn empty_jobs_roll_up_to_none() {
        assert_eq!(derive_ci_rollup(&[]), CiRollup::None);
    }

    #[test]
    fn failure_beats_pending() {
        let jobs = vec![
            job("in_progress", None),
            job("completed", Some("failure")),
            job("completed", Some("success")),
        ];
        assert_eq!(derive_ci_rollup(&jobs), CiRollup::Failure);
    }

    #[test]
    fn pending_beats_cancelled_and_success() {
        let jobs = vec![
            job("queued", None),
            job("completed", Some("cancelled")),
            job("completed", Some("success")),
        ];
        assert_eq!(derive_ci_rollup(&jobs), CiRollup::Pending);
    }

    #[test]
    fn cancelled_beats_success() {
        let jobs = vec![
            job("completed", Some("cancelled")),
            job("completed", Some("success")),
        ];
        assert_eq!(derive_ci_rollup(&jobs), CiRollup::Cancelled);
    }

    #[test]
    fn all_skipped_is_neutral() {
        let jobs = vec![job("completed", Some("skipped"))];
        assert_eq!(derive_ci_rollup(&jobs), CiRollup::Neutral);
    }

    #[test]
    fn timed_out_and_action_required_are_failures() {
        assert_eq!(
            derive_ci_rollup(&[job("completed", Some("timed_out"))]),
            CiRollup::Failure
        );
        assert_eq!(
            derive_ci_rollup(&[job("completed", Some("action_required"))]),
            CiRollup::Failure
        );
    }
}
