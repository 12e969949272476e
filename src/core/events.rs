use serde::{Deserialize, Serialize};

use super::conversation::{Conversation, RuntimeStatus};
use super::directory::Directory;
use super::github::{CiRollup, GitHubPullRequest};
use super::repository::Repository;
use super::scope::Scope;
use super::settings::{AutomationPolicy, ProjectSettings};
use super::task::Task;
use super::telemetry::TelemetryRecord;

/// Scope attached to a journal entry: the smallest enclosing scope of the
/// mutation the event describes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventScope {
    /// Tenant identifier.
    pub tenant_id: String,

    /// User identifier.
    pub user_id: String,

    /// Workspace identifier.
    pub workspace_id: String,

    /// Enclosing directory, when the mutation is directory-rooted.
    pub directory_id: Option<String>,

    /// Enclosing conversation, when the mutation is conversation-rooted.
    pub conversation_id: Option<String>,
}

impl EventScope {
    /// Scope an event at the workspace level.
    #[must_use]
    pub fn workspace(scope: &Scope) -> Self {
        Self {
            tenant_id: scope.tenant_id.clone(),
            user_id: scope.user_id.clone(),
            workspace_id: scope.workspace_id.clone(),
            directory_id: None,
            conversation_id: None,
        }
    }

    /// Scope an event at the directory level.
    #[must_use]
    pub fn directory(scope: &Scope, directory_id: &str) -> Self {
        Self {
            directory_id: Some(directory_id.to_owned()),
            ..Self::workspace(scope)
        }
    }

    /// Scope an event at the conversation level.
    #[must_use]
    pub fn conversation(
        scope: &Scope,
        directory_id: Option<&str>,
        conversation_id: &str,
    ) -> Self {
        Self {
            directory_id: directory_id.map(str::to_owned),
            conversation_id: Some(conversation_id.to_owned()),
            ..Self::workspace(scope)
        }
    }
}

/// Who controls a session, as carried on session-control events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerInfo {
    /// Controller identifier.
    pub controller_id: String,

    /// What kind of actor the controller is.
    pub controller_type: ControllerType,

    /// Display name shown in conflict messages, when provided.
    pub display: Option<String>,
}

impl ControllerInfo {
    /// Name used in `session is already claimed by <display>` messages.
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.display.as_deref().unwrap_or(&self.controller_id)
    }
}

/// Kind of actor holding a session claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControllerType {
    /// A person at a client.
    Human,

    /// An automated agent.
    Agent,

    /// The system itself (e.g. the scheduler).
    System,
}

/// How a session-control event changed the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionControlAction {
    /// An unclaimed session was claimed, or a claim was renewed.
    Claimed,

    /// A different connection's claim was forcibly replaced.
    TakenOver,

    /// The controller released the session.
    Released,
}

/// The observed-event union published to the journal.
///
/// Every state-changing command emits exactly one of these; the pollers
/// emit the session and github variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ObservedEvent {
    /// A directory was created or updated.
    DirectoryUpserted {
        /// The resulting record.
        directory: Directory,
    },

    /// A directory was archived.
    DirectoryArchived {
        /// The archived directory id.
        directory_id: String,
    },

    /// A conversation was created.
    ConversationCreated {
        /// The new record.
        conversation: Conversation,
    },

    /// A conversation's title or runtime projection changed.
    ConversationUpdated {
        /// The resulting record.
        conversation: Conversation,
    },

    /// A conversation was archived.
    ConversationArchived {
        /// The archived conversation id.
        conversation_id: String,
    },

    /// A conversation was deleted (and any live session destroyed).
    ConversationDeleted {
        /// The deleted conversation id.
        conversation_id: String,
    },

    /// A repository was created or restored.
    RepositoryUpserted {
        /// The resulting record.
        repository: Repository,
    },

    /// A repository's fields changed.
    RepositoryUpdated {
        /// The resulting record.
        repository: Repository,
    },

    /// A repository was archived.
    RepositoryArchived {
        /// The archived repository id.
        repository_id: String,
    },

    /// A task was created.
    TaskCreated {
        /// The new record.
        task: Task,
    },

    /// A task changed (fields, status, claim, or order).
    TaskUpdated {
        /// The resulting record.
        task: Task,
    },

    /// A task was deleted.
    TaskDeleted {
        /// The deleted task id.
        task_id: String,
    },

    /// Tasks in one ordering scope were reordered.
    TasksReordered {
        /// The resulting full order of the scope.
        task_ids: Vec<String>,
    },

    /// Project settings were written.
    ProjectSettingsUpdated {
        /// The resulting settings row.
        settings: ProjectSettings,
    },

    /// An automation policy was written.
    AutomationPolicyUpdated {
        /// The resulting policy row.
        policy: AutomationPolicy,
    },

    /// A live session's runtime status changed.
    SessionStatus {
        /// Session (= conversation) id.
        session_id: String,
        /// New status.
        status: RuntimeStatus,
        /// Attention reason, when the session needs input.
        attention_reason: Option<String>,
    },

    /// A session's controller changed.
    SessionControl {
        /// Session (= conversation) id.
        session_id: String,
        /// What happened.
        action: SessionControlAction,
        /// The controller after the change, absent on release.
        controller: Option<ControllerInfo>,
        /// The controller before the change, when there was one.
        previous_controller: Option<ControllerInfo>,
    },

    /// A chunk of PTY output was observed.
    SessionOutput {
        /// Session (= conversation) id.
        session_id: String,
        /// Monotone per-session output cursor.
        cursor: u64,
        /// Base64-encoded raw bytes.
        chunk_base64: String,
    },

    /// A pull request was created or updated by reconciliation.
    GithubPrUpserted {
        /// The resulting record.
        pr: GitHubPullRequest,
    },

    /// A PR's job list was replaced and its rollup recomputed.
    GithubPrJobsUpdated {
        /// PR record id.
        pr_record_id: String,
        /// Repository the PR belongs to.
        repository_id: String,
        /// Recomputed rollup.
        ci_rollup: CiRollup,
    },

    /// A previously open PR vanished from its head branch.
    GithubPrClosed {
        /// PR record id.
        pr_record_id: String,
        /// Repository the PR belonged to.
        repository_id: String,
        /// PR number.
        number: i64,
    },

    /// A telemetry datum was recorded.
    TelemetryRecorded {
        /// The new record.
        record: TelemetryRecord,
    },
}

impl ObservedEvent {
    /// Whether this is raw session output (excluded by subscriptions that
    /// opt out of output).
    #[must_use]
    pub fn is_output(&self) -> bool {
        matches!(self, Self::SessionOutput { .. })
    }

    /// Repository id derivable from the payload, for filter matching.
    #[must_use]
    pub fn repository_id(&self) -> Option<&str> {
        match self {
            Self::RepositoryUpserted { repository } | Self::RepositoryUpdated { repository } => {
                Some(&repository.id)
            }
            Self::RepositoryArchived { repository_id }
            | Self::GithubPrJobsUpdated { repository_id, .. }
            | Self::GithubPrClosed { repository_id, .. } => Some(repository_id),
            Self::TaskCreated { task } | Self::TaskUpdated { task } => {
                task.repository_id.as_deref()
            }
            Self::GithubPrUpserted { pr } => Some(&pr.repository_id),
            _ => None,
        }
    }

    /// Task id derivable from the payload, for filter matching.
    #[must_use]
    pub fn task_id(&self) -> Option<&str> {
        match self {
            Self::TaskCreated { task } | Self::TaskUpdated { task } => Some(&task.id),
            Self::TaskDeleted { task_id } => Some(task_id),
            _ => None,
        }
    }
}
