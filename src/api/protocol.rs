//! Wire shapes: the tagged command union, plain-record responses, and
//! outbound envelopes.
//!
//! Inbound frames are `{type: <kind>, ...fields}` JSON objects; unknown
//! kinds fail with `unsupported command type: <kind>`. Success responses
//! are plain records with no wrapper; errors carry a stable code and the
//! taxonomy message.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{
    AgentKind, ControlError, ControlResult, ControllerInfo, ControllerType, Conversation,
    Directory, EffectiveAutomation, ExitStatus, GitHubPrJob, GitHubPullRequest, LinearFields,
    ObservedEvent, ProjectSettings, PolicyScopeLevel, Repository, RuntimeStatus, Scope,
    SessionControlAction, Task, TaskScopeKind, TaskStatus, TelemetryRecord, TelemetrySource,
};
use crate::gitstatus::GitStatusEntry;
use crate::journal::ObservedFilter;
use crate::scheduler::{Availability, PullOutcome};
use crate::sessions::SnapshotRecord;

/// Optional scope fields carried by most commands; missing parts default
/// to the local triple.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScopeParams {
    /// Tenant id, `tenant-local` when absent.
    pub tenant_id: Option<String>,

    /// User id, `user-local` when absent.
    pub user_id: Option<String>,

    /// Workspace id, `workspace-local` when absent.
    pub workspace_id: Option<String>,
}

impl ScopeParams {
    /// Resolve to a concrete scope, substituting local defaults.
    #[must_use]
    pub fn resolve(&self) -> Scope {
        Scope::from_parts(
            self.tenant_id.clone(),
            self.user_id.clone(),
            self.workspace_id.clone(),
        )
    }
}

/// `directory.upsert` parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryUpsertParams {
    /// Scope fields.
    #[serde(flatten)]
    pub scope: ScopeParams,

    /// Explicit id, generated when absent.
    #[serde(default)]
    pub id: Option<String>,

    /// Filesystem path.
    pub path: String,
}

/// `directory.list` parameters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DirectoryListParams {
    /// Scope fields.
    #[serde(flatten)]
    pub scope: ScopeParams,

    /// Include archived rows.
    pub include_archived: bool,
}

/// Parameters naming one directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryIdParams {
    /// Scope fields.
    #[serde(flatten)]
    pub scope: ScopeParams,

    /// Directory id.
    pub id: String,
}

/// `project.settings-get` / `project.status` parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectParams {
    /// Scope fields.
    #[serde(flatten)]
    pub scope: ScopeParams,

    /// Directory id.
    pub directory_id: String,
}

/// `project.settings-update` parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectSettingsUpdateParams {
    /// Scope fields.
    #[serde(flatten)]
    pub scope: ScopeParams,

    /// Directory id.
    pub directory_id: String,

    /// New pinned branch.
    #[serde(default)]
    pub pinned_branch: Option<String>,

    /// Clear the pinned branch.
    #[serde(default)]
    pub clear_pinned_branch: bool,

    /// New task focus mode.
    #[serde(default)]
    pub task_focus_mode: Option<crate::core::TaskFocusMode>,

    /// New thread spawn mode.
    #[serde(default)]
    pub thread_spawn_mode: Option<crate::core::ThreadSpawnMode>,
}

/// `automation.policy-get` parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomationPolicyGetParams {
    /// Scope fields.
    #[serde(flatten)]
    pub scope: ScopeParams,

    /// Policy level.
    pub scope_level: PolicyScopeLevel,

    /// Directory or repository id for non-global levels.
    #[serde(default)]
    pub scope_id: Option<String>,
}

/// `automation.policy-set` parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomationPolicySetParams {
    /// Scope fields.
    #[serde(flatten)]
    pub scope: ScopeParams,

    /// Policy level.
    pub scope_level: PolicyScopeLevel,

    /// Directory or repository id for non-global levels.
    #[serde(default)]
    pub scope_id: Option<String>,

    /// Whether automation may claim work.
    pub automation_enabled: bool,

    /// Whether automation is frozen.
    #[serde(default)]
    pub frozen: bool,
}

/// `conversation.create` parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationCreateParams {
    /// Scope fields.
    #[serde(flatten)]
    pub scope: ScopeParams,

    /// Explicit id, generated when absent.
    #[serde(default)]
    pub id: Option<String>,

    /// Owning directory.
    pub directory_id: String,

    /// Display title.
    pub title: String,

    /// Driving agent.
    pub agent: AgentKind,
}

/// `conversation.list` parameters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConversationListParams {
    /// Scope fields.
    #[serde(flatten)]
    pub scope: ScopeParams,

    /// Restrict to one directory.
    pub directory_id: Option<String>,

    /// Include archived rows.
    pub include_archived: bool,
}

/// Parameters naming one conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationIdParams {
    /// Scope fields.
    #[serde(flatten)]
    pub scope: ScopeParams,

    /// Conversation id.
    pub id: String,
}

/// `conversation.update` parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationUpdateParams {
    /// Scope fields.
    #[serde(flatten)]
    pub scope: ScopeParams,

    /// Conversation id.
    pub id: String,

    /// New title.
    pub title: String,
}

/// `repository.upsert` parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryUpsertParams {
    /// Scope fields.
    #[serde(flatten)]
    pub scope: ScopeParams,

    /// Explicit id, generated when absent.
    #[serde(default)]
    pub id: Option<String>,

    /// Human-readable name.
    pub name: String,

    /// Remote URL.
    pub remote_url: String,

    /// Default branch, `main` when absent.
    #[serde(default)]
    pub default_branch: Option<String>,

    /// Metadata map.
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

/// Parameters naming one repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryIdParams {
    /// Scope fields.
    #[serde(flatten)]
    pub scope: ScopeParams,

    /// Repository id.
    pub id: String,
}

/// `repository.list` parameters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RepositoryListParams {
    /// Scope fields.
    #[serde(flatten)]
    pub scope: ScopeParams,

    /// Include archived rows.
    pub include_archived: bool,
}

/// `repository.update` parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryUpdateParams {
    /// Scope fields.
    #[serde(flatten)]
    pub scope: ScopeParams,

    /// Repository id.
    pub id: String,

    /// New name.
    #[serde(default)]
    pub name: Option<String>,

    /// New default branch.
    #[serde(default)]
    pub default_branch: Option<String>,

    /// New metadata map.
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

/// `task.create` parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskCreateParams {
    /// Scope fields.
    #[serde(flatten)]
    pub scope: ScopeParams,

    /// Explicit id, generated when absent.
    #[serde(default)]
    pub id: Option<String>,

    /// Repository link.
    #[serde(default)]
    pub repository_id: Option<String>,

    /// Project (directory) link.
    #[serde(default)]
    pub project_id: Option<String>,

    /// Short title.
    pub title: String,

    /// Body text.
    #[serde(default)]
    pub body: String,

    /// Initial status, `draft` when absent.
    #[serde(default)]
    pub status: Option<TaskStatus>,

    /// Linear metadata.
    #[serde(default)]
    pub linear: Option<LinearFields>,
}

/// Parameters naming one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskIdParams {
    /// Scope fields.
    #[serde(flatten)]
    pub scope: ScopeParams,

    /// Task id.
    pub id: String,
}

/// `task.list` parameters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TaskListParams {
    /// Scope fields.
    #[serde(flatten)]
    pub scope: ScopeParams,

    /// Restrict to one status.
    pub status: Option<TaskStatus>,

    /// Restrict to one scope kind.
    pub scope_kind: Option<TaskScopeKind>,

    /// Restrict to one repository.
    pub repository_id: Option<String>,

    /// Restrict to one project.
    pub project_id: Option<String>,
}

/// `task.update` parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskUpdateCmdParams {
    /// Scope fields.
    #[serde(flatten)]
    pub scope: ScopeParams,

    /// Task id.
    pub id: String,

    /// New title.
    #[serde(default)]
    pub title: Option<String>,

    /// New body.
    #[serde(default)]
    pub body: Option<String>,

    /// New Linear metadata.
    #[serde(default)]
    pub linear: Option<LinearFields>,
}

/// `task.claim` parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskClaimParams {
    /// Scope fields.
    #[serde(flatten)]
    pub scope: ScopeParams,

    /// Task id.
    pub id: String,

    /// Claiming controller.
    pub controller_id: String,

    /// Directory the work happens in.
    #[serde(default)]
    pub directory_id: Option<String>,

    /// Working branch.
    #[serde(default)]
    pub branch_name: Option<String>,

    /// Base branch.
    #[serde(default)]
    pub base_branch: Option<String>,
}

/// `task.reorder` parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskReorderParams {
    /// Scope fields.
    #[serde(flatten)]
    pub scope: ScopeParams,

    /// Project defining the ordering scope, when project-scoped.
    #[serde(default)]
    pub project_id: Option<String>,

    /// Repository defining the ordering scope, when repository-scoped.
    #[serde(default)]
    pub repository_id: Option<String>,

    /// Leading order; remaining scope tasks keep their relative order.
    pub ordered_task_ids: Vec<String>,
}

/// `task.pull` parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskPullParams {
    /// Scope fields.
    #[serde(flatten)]
    pub scope: ScopeParams,

    /// Controller the claim goes to.
    pub controller_id: String,

    /// Pull for this project.
    #[serde(default)]
    pub directory_id: Option<String>,

    /// Pull across projects tracking this repository.
    #[serde(default)]
    pub repository_id: Option<String>,

    /// Working branch override.
    #[serde(default)]
    pub branch_name: Option<String>,

    /// Base branch override.
    #[serde(default)]
    pub base_branch: Option<String>,
}

/// `stream.subscribe` parameters: the filter plus a replay cursor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StreamSubscribeParams {
    /// Required tenant id.
    pub tenant_id: Option<String>,

    /// Required user id.
    pub user_id: Option<String>,

    /// Required workspace id.
    pub workspace_id: Option<String>,

    /// Required repository id.
    pub repository_id: Option<String>,

    /// Required task id.
    pub task_id: Option<String>,

    /// Required directory id.
    pub directory_id: Option<String>,

    /// Required conversation id.
    pub conversation_id: Option<String>,

    /// Deliver raw session output.
    pub include_output: bool,

    /// Replay entries with cursor greater than this.
    pub after_cursor: u64,
}

impl StreamSubscribeParams {
    /// The filter half of the parameters.
    #[must_use]
    pub fn filter(&self) -> ObservedFilter {
        ObservedFilter {
            tenant_id: self.tenant_id.clone(),
            user_id: self.user_id.clone(),
            workspace_id: self.workspace_id.clone(),
            repository_id: self.repository_id.clone(),
            task_id: self.task_id.clone(),
            directory_id: self.directory_id.clone(),
            conversation_id: self.conversation_id.clone(),
            include_output: self.include_output,
        }
    }
}

/// `stream.unsubscribe` parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamUnsubscribeParams {
    /// Subscription to remove.
    pub subscription_id: String,
}

/// Parameters naming one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionIdParams {
    /// Scope fields.
    #[serde(flatten)]
    pub scope: ScopeParams,

    /// Session (= conversation) id.
    pub session_id: String,
}

/// `session.snapshot` parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshotParams {
    /// Scope fields.
    #[serde(flatten)]
    pub scope: ScopeParams,

    /// Session id.
    pub session_id: String,

    /// Reduce the buffer to the last N visible rows.
    #[serde(default)]
    pub tail_lines: Option<usize>,
}

/// `session.claim` parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionClaimParams {
    /// Scope fields.
    #[serde(flatten)]
    pub scope: ScopeParams,

    /// Session id.
    pub session_id: String,

    /// Claiming controller.
    pub controller_id: String,

    /// Kind of actor, `human` when absent.
    #[serde(default = "default_controller_type")]
    pub controller_type: ControllerType,

    /// Display name for conflict messages.
    #[serde(default)]
    pub display: Option<String>,

    /// Forcibly replace another connection's claim.
    #[serde(default)]
    pub takeover: bool,
}

fn default_controller_type() -> ControllerType {
    ControllerType::Human
}

/// `session.respond` parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRespondParams {
    /// Scope fields.
    #[serde(flatten)]
    pub scope: ScopeParams,

    /// Session id.
    pub session_id: String,

    /// Text written to the PTY.
    pub text: String,
}

/// `pty.start` parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PtyStartParams {
    /// Scope fields.
    #[serde(flatten)]
    pub scope: ScopeParams,

    /// Conversation to start a live session for.
    pub conversation_id: String,

    /// Command argv; the agent default when absent.
    #[serde(default)]
    pub command: Option<Vec<String>>,

    /// Working directory; the conversation's directory path when absent.
    #[serde(default)]
    pub cwd: Option<String>,
}

/// `pty.attach` parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PtyAttachParams {
    /// Scope fields.
    #[serde(flatten)]
    pub scope: ScopeParams,

    /// Session id.
    pub session_id: String,

    /// Replay output with cursor greater than this.
    #[serde(default)]
    pub since_cursor: Option<u64>,
}

/// `github.pr-create` parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GithubPrCreateParams {
    /// Scope fields.
    #[serde(flatten)]
    pub scope: ScopeParams,

    /// Project to open the PR for.
    pub directory_id: String,

    /// Head branch; the tracked branch when absent.
    #[serde(default)]
    pub head_branch: Option<String>,

    /// Base branch; the repository default when absent.
    #[serde(default)]
    pub base_branch: Option<String>,

    /// PR title; derived from the branch when absent.
    #[serde(default)]
    pub title: Option<String>,

    /// PR body.
    #[serde(default)]
    pub body: Option<String>,

    /// Open as a draft.
    #[serde(default)]
    pub draft: bool,
}

/// `github.pr-list` parameters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GithubPrListParams {
    /// Scope fields.
    #[serde(flatten)]
    pub scope: ScopeParams,

    /// Restrict to one repository.
    pub repository_id: Option<String>,
}

/// `github.pr-jobs-list` parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GithubPrJobsListParams {
    /// PR record id.
    pub pr_record_id: String,
}

/// `linear.issue.import` parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinearIssueImportParams {
    /// Scope fields.
    #[serde(flatten)]
    pub scope: ScopeParams,

    /// Issue URL; mutually exclusive with `identifier`.
    #[serde(default)]
    pub url: Option<String>,

    /// Issue identifier like `ENG-123`.
    #[serde(default)]
    pub identifier: Option<String>,

    /// Repository the task lands in.
    #[serde(default)]
    pub repository_id: Option<String>,

    /// Project the task lands in.
    #[serde(default)]
    pub project_id: Option<String>,

    /// Initial status, `draft` when absent.
    #[serde(default)]
    pub status: Option<TaskStatus>,
}

/// `telemetry.record` parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryRecordParams {
    /// Scope fields.
    #[serde(flatten)]
    pub scope: ScopeParams,

    /// Conversation the datum belongs to.
    pub conversation_id: String,

    /// Datum origin.
    pub source: TelemetrySource,

    /// Kind tag.
    pub kind: String,

    /// Opaque payload.
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
}

/// `telemetry.list` parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryListParams {
    /// Scope fields.
    #[serde(flatten)]
    pub scope: ScopeParams,

    /// Conversation to list for.
    pub conversation_id: String,
}

/// Scope-only parameters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScopeOnlyParams {
    /// Scope fields.
    #[serde(flatten)]
    pub scope: ScopeParams,
}

/// The tagged command union.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Command {
    /// Create or update a directory.
    #[serde(rename = "directory.upsert")]
    DirectoryUpsert(DirectoryUpsertParams),

    /// List directories.
    #[serde(rename = "directory.list")]
    DirectoryList(DirectoryListParams),

    /// Archive a directory.
    #[serde(rename = "directory.archive")]
    DirectoryArchive(DirectoryIdParams),

    /// Read a directory's cached git status.
    #[serde(rename = "directory.git-status")]
    DirectoryGitStatus(DirectoryIdParams),

    /// Read project settings.
    #[serde(rename = "project.settings-get")]
    ProjectSettingsGet(ProjectParams),

    /// Write project settings.
    #[serde(rename = "project.settings-update")]
    ProjectSettingsUpdate(ProjectSettingsUpdateParams),

    /// Read an automation policy.
    #[serde(rename = "automation.policy-get")]
    AutomationPolicyGet(AutomationPolicyGetParams),

    /// Write an automation policy.
    #[serde(rename = "automation.policy-set")]
    AutomationPolicySet(AutomationPolicySetParams),

    /// Create a conversation.
    #[serde(rename = "conversation.create")]
    ConversationCreate(ConversationCreateParams),

    /// List conversations.
    #[serde(rename = "conversation.list")]
    ConversationList(ConversationListParams),

    /// Update a conversation's title.
    #[serde(rename = "conversation.update")]
    ConversationUpdate(ConversationUpdateParams),

    /// Archive a conversation.
    #[serde(rename = "conversation.archive")]
    ConversationArchive(ConversationIdParams),

    /// Delete a conversation and destroy its live session.
    #[serde(rename = "conversation.delete")]
    ConversationDelete(ConversationIdParams),

    /// Re-derive a conversation's title.
    #[serde(rename = "conversation.title.refresh")]
    ConversationTitleRefresh(ConversationIdParams),

    /// Create, update, or restore a repository.
    #[serde(rename = "repository.upsert")]
    RepositoryUpsert(RepositoryUpsertParams),

    /// Read a repository.
    #[serde(rename = "repository.get")]
    RepositoryGet(RepositoryIdParams),

    /// List repositories.
    #[serde(rename = "repository.list")]
    RepositoryList(RepositoryListParams),

    /// Update a repository.
    #[serde(rename = "repository.update")]
    RepositoryUpdate(RepositoryUpdateParams),

    /// Archive a repository.
    #[serde(rename = "repository.archive")]
    RepositoryArchive(RepositoryIdParams),

    /// Create a task.
    #[serde(rename = "task.create")]
    TaskCreate(TaskCreateParams),

    /// Read a task.
    #[serde(rename = "task.get")]
    TaskGet(TaskIdParams),

    /// List tasks.
    #[serde(rename = "task.list")]
    TaskList(TaskListParams),

    /// Update a task.
    #[serde(rename = "task.update")]
    TaskUpdate(TaskUpdateCmdParams),

    /// Delete a task.
    #[serde(rename = "task.delete")]
    TaskDelete(TaskIdParams),

    /// Claim a task for a controller.
    #[serde(rename = "task.claim")]
    TaskClaim(TaskClaimParams),

    /// Complete a task.
    #[serde(rename = "task.complete")]
    TaskComplete(TaskIdParams),

    /// Mark a task ready.
    #[serde(rename = "task.ready")]
    TaskReady(TaskIdParams),

    /// Mark a task ready (legacy alias).
    #[serde(rename = "task.queue")]
    TaskQueue(TaskIdParams),

    /// Mark a task draft.
    #[serde(rename = "task.draft")]
    TaskDraft(TaskIdParams),

    /// Reorder tasks within one ordering scope.
    #[serde(rename = "task.reorder")]
    TaskReorder(TaskReorderParams),

    /// Claim one ready task for a context.
    #[serde(rename = "task.pull")]
    TaskPull(TaskPullParams),

    /// Aggregate project status.
    #[serde(rename = "project.status")]
    ProjectStatus(ProjectParams),

    /// Register a stream subscription and replay the journal.
    #[serde(rename = "stream.subscribe")]
    StreamSubscribe(StreamSubscribeParams),

    /// Remove a stream subscription.
    #[serde(rename = "stream.unsubscribe")]
    StreamUnsubscribe(StreamUnsubscribeParams),

    /// List in-memory sessions.
    #[serde(rename = "session.list")]
    SessionList(ScopeOnlyParams),

    /// Read one session's status.
    #[serde(rename = "session.status")]
    SessionStatus(SessionIdParams),

    /// Capture or read back a session snapshot.
    #[serde(rename = "session.snapshot")]
    SessionSnapshot(SessionSnapshotParams),

    /// Claim or take over a session.
    #[serde(rename = "session.claim")]
    SessionClaim(SessionClaimParams),

    /// Release a session claim.
    #[serde(rename = "session.release")]
    SessionRelease(SessionIdParams),

    /// Write text to a session and mark it running.
    #[serde(rename = "session.respond")]
    SessionRespond(SessionRespondParams),

    /// Interrupt a session (ETX) and mark it completed.
    #[serde(rename = "session.interrupt")]
    SessionInterrupt(SessionIdParams),

    /// Destroy a session's in-memory state.
    #[serde(rename = "session.remove")]
    SessionRemove(SessionIdParams),

    /// Start a live PTY for a conversation.
    #[serde(rename = "pty.start")]
    PtyStart(PtyStartParams),

    /// Attach this connection to a session's output.
    #[serde(rename = "pty.attach")]
    PtyAttach(PtyAttachParams),

    /// Detach this connection from a session's output.
    #[serde(rename = "pty.detach")]
    PtyDetach(SessionIdParams),

    /// Subscribe this connection to session exit events.
    #[serde(rename = "pty.subscribe-events")]
    PtySubscribeEvents(SessionIdParams),

    /// Unsubscribe this connection from session exit events.
    #[serde(rename = "pty.unsubscribe-events")]
    PtyUnsubscribeEvents(SessionIdParams),

    /// Close a session's PTY and destroy its in-memory state.
    #[serde(rename = "pty.close")]
    PtyClose(SessionIdParams),

    /// Sessions needing input.
    #[serde(rename = "attention.list")]
    AttentionList(ScopeOnlyParams),

    /// Agent CLI availability.
    #[serde(rename = "agent.tools.status")]
    AgentToolsStatus(ScopeOnlyParams),

    /// The open PR for a project's tracked branch.
    #[serde(rename = "github.project-pr")]
    GithubProjectPr(ProjectParams),

    /// List reconciled PRs.
    #[serde(rename = "github.pr-list")]
    GithubPrList(GithubPrListParams),

    /// Create a PR for a project's tracked branch.
    #[serde(rename = "github.pr-create")]
    GithubPrCreate(GithubPrCreateParams),

    /// List a PR's jobs.
    #[serde(rename = "github.pr-jobs-list")]
    GithubPrJobsList(GithubPrJobsListParams),

    /// URL listing the viewer's open PRs.
    #[serde(rename = "github.repo-my-prs-url")]
    GithubRepoMyPrsUrl(RepositoryIdParams),

    /// Import a Linear issue as a task.
    #[serde(rename = "linear.issue.import")]
    LinearIssueImport(LinearIssueImportParams),

    /// Record a telemetry datum.
    #[serde(rename = "telemetry.record")]
    TelemetryRecord(TelemetryRecordParams),

    /// List telemetry for a conversation.
    #[serde(rename = "telemetry.list")]
    TelemetryList(TelemetryListParams),
}

impl Command {
    /// Parse a command from a JSON object, failing unknown kinds with
    /// `unsupported command type: <kind>`.
    ///
    /// # Errors
    ///
    /// Fails on missing/unknown `type` or malformed fields.
    pub fn parse(value: serde_json::Value) -> ControlResult<Self> {
        let kind = value
            .get("type")
            .and_then(serde_json::Value::as_str)
            .map(str::to_owned);

        serde_json::from_value(value).map_err(|err| match kind {
            Some(kind) if err.to_string().contains("unknown variant") => {
                ControlError::validation(format!("unsupported command type: {kind}"))
            }
            Some(kind) => {
                ControlError::validation(format!("invalid {kind} command: {err}"))
            }
            None => ControlError::validation("expected non-empty type"),
        })
    }
}

/// A directory's cached git status.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GitStatusResponse {
    /// Directory id.
    pub directory_id: String,

    /// Whether the cache has an entry for the directory.
    pub tracked: bool,

    /// The entry, when tracked.
    pub status: Option<GitStatusEntry>,
}

/// Wrapper for directory listings.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoriesResponse {
    /// The directories, in creation order.
    pub directories: Vec<Directory>,
}

/// Wrapper for conversation listings.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationsResponse {
    /// The conversations, in creation order.
    pub conversations: Vec<Conversation>,
}

/// Wrapper for repository listings.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoriesResponse {
    /// The repositories, in creation order.
    pub repositories: Vec<Repository>,
}

/// Wrapper for task listings.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TasksResponse {
    /// The tasks, in ordering-scope order.
    pub tasks: Vec<Task>,
}

/// Deletion acknowledgement.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletedResponse {
    /// The deleted record id.
    pub id: String,

    /// Always true.
    pub deleted: bool,
}

/// Aggregate project status.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectStatusResponse {
    /// The directory record.
    pub directory: Directory,

    /// Scheduler availability.
    pub availability: Availability,

    /// Availability reason.
    pub reason: String,

    /// Cached git status, when tracked.
    pub git: Option<GitStatusEntry>,

    /// Project settings.
    pub settings: ProjectSettings,

    /// Effective automation switches.
    pub automation: EffectiveAutomation,

    /// Live thread count for the directory.
    pub live_thread_count: usize,
}

/// Subscription acknowledgement with the current journal cursor.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeResponse {
    /// The new subscription id.
    pub subscription_id: String,

    /// The journal cursor after replay.
    pub cursor: u64,
}

/// Unsubscription acknowledgement.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnsubscribeResponse {
    /// The removed subscription id.
    pub subscription_id: String,

    /// Whether a subscription was actually removed.
    pub unsubscribed: bool,
}

/// Client-facing view of one in-memory session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    /// Session (= conversation) id.
    pub session_id: String,

    /// Directory the session runs in, when known.
    pub directory_id: Option<String>,

    /// Runtime status.
    pub status: RuntimeStatus,

    /// Whether a live handle backs the session.
    pub live: bool,

    /// Attention reason, when needing input.
    pub attention_reason: Option<String>,

    /// Current controller, when claimed.
    pub controller: Option<ControllerInfo>,

    /// When the session entry was created.
    pub created_at: DateTime<Utc>,

    /// When the last runtime event was observed.
    pub last_event_at: Option<DateTime<Utc>>,

    /// Cursor of the last journal-observed output chunk.
    pub last_output_cursor: u64,
}

/// Wrapper for session listings.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionsResponse {
    /// The sessions.
    pub sessions: Vec<SessionSummary>,
}

/// Result of a claim/release operation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionControlResponse {
    /// Session id.
    pub session_id: String,

    /// What happened.
    pub action: SessionControlAction,

    /// Controller after the operation.
    pub controller: Option<ControllerInfo>,

    /// Controller before the operation.
    pub previous_controller: Option<ControllerInfo>,
}

/// Snapshot response.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotResponse {
    /// Session id.
    pub session_id: String,

    /// The (possibly tail-reduced) snapshot.
    pub snapshot: SnapshotRecord,
}

/// Attachment acknowledgement.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachResponse {
    /// Session id.
    pub session_id: String,

    /// The new attachment id.
    pub attachment_id: String,

    /// The session's latest output cursor at attach time.
    pub cursor: u64,
}

/// Detachment / event-subscription acknowledgement.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionAckResponse {
    /// Session id.
    pub session_id: String,

    /// Whether the operation changed anything.
    pub changed: bool,
}

/// One agent CLI's availability.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentToolStatus {
    /// Agent kind.
    pub agent: AgentKind,

    /// Whether the binary resolves on PATH.
    pub available: bool,

    /// Resolved path, when available.
    pub path: Option<String>,
}

/// Wrapper for agent tool probes.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentToolsResponse {
    /// One entry per probeable agent kind.
    pub tools: Vec<AgentToolStatus>,
}

/// The open PR for a project's tracked branch.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectPrResponse {
    /// Directory id.
    pub directory_id: String,

    /// Tracked repository, when resolved.
    pub repository_id: Option<String>,

    /// Tracked branch, when resolved.
    pub branch: Option<String>,

    /// The open PR record, when one exists.
    pub pr: Option<GitHubPullRequest>,
}

/// Wrapper for PR listings.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequestsResponse {
    /// The PR records.
    pub pull_requests: Vec<GitHubPullRequest>,
}

/// Result of `github.pr-create`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrCreateResponse {
    /// Whether a PR was created by this command.
    pub created: bool,

    /// Whether an existing open PR was returned instead.
    pub existing: bool,

    /// The PR record.
    pub pr: GitHubPullRequest,
}

/// Wrapper for PR job listings.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrJobsResponse {
    /// PR record id.
    pub pr_record_id: String,

    /// The jobs.
    pub jobs: Vec<GitHubPrJob>,
}

/// My-PRs URL response.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MyPrsUrlResponse {
    /// Repository id.
    pub repository_id: String,

    /// The URL.
    pub url: String,
}

/// Wrapper for telemetry listings.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryResponse {
    /// The records, oldest first.
    pub records: Vec<TelemetryRecord>,
}

/// Plain-record command responses (no wrapper on the wire).
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Response {
    /// A directory record.
    Directory(Directory),
    /// A directory listing.
    Directories(DirectoriesResponse),
    /// A git status read.
    GitStatus(GitStatusResponse),
    /// A settings record.
    Settings(ProjectSettings),
    /// An automation policy record.
    Policy(Box<crate::core::AutomationPolicy>),
    /// A conversation record.
    Conversation(Box<Conversation>),
    /// A conversation listing.
    Conversations(ConversationsResponse),
    /// A repository record.
    Repository(Repository),
    /// A repository listing.
    Repositories(RepositoriesResponse),
    /// A task record.
    Task(Box<Task>),
    /// A task listing.
    Tasks(TasksResponse),
    /// A pull outcome.
    Pull(Box<PullOutcome>),
    /// A deletion acknowledgement.
    Deleted(DeletedResponse),
    /// A project status aggregate.
    ProjectStatus(Box<ProjectStatusResponse>),
    /// A subscription acknowledgement.
    Subscribed(SubscribeResponse),
    /// An unsubscription acknowledgement.
    Unsubscribed(UnsubscribeResponse),
    /// A session listing.
    Sessions(SessionsResponse),
    /// A session summary.
    Session(SessionSummary),
    /// A session control result.
    SessionControl(SessionControlResponse),
    /// A snapshot.
    Snapshot(SnapshotResponse),
    /// An attachment acknowledgement.
    Attach(AttachResponse),
    /// A session acknowledgement.
    SessionAck(SessionAckResponse),
    /// Agent tool availability.
    AgentTools(AgentToolsResponse),
    /// A project PR read.
    ProjectPr(Box<ProjectPrResponse>),
    /// A PR listing.
    PullRequests(PullRequestsResponse),
    /// A PR creation result.
    PrCreate(Box<PrCreateResponse>),
    /// A PR job listing.
    PrJobs(PrJobsResponse),
    /// A my-PRs URL.
    MyPrsUrl(MyPrsUrlResponse),
    /// A telemetry record.
    Telemetry(Box<TelemetryRecord>),
    /// A telemetry listing.
    TelemetryList(TelemetryResponse),
}

/// Outbound envelopes pushed to connections.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum Envelope {
    /// A journal entry delivered to a subscription.
    #[serde(rename = "stream.event")]
    StreamEvent {
        /// The subscription that matched.
        subscription_id: String,
        /// Journal cursor.
        cursor: u64,
        /// The event payload.
        event: ObservedEvent,
    },

    /// Raw PTY output for an attached connection.
    #[serde(rename = "pty.output")]
    PtyOutput {
        /// Session id.
        session_id: String,
        /// Per-session output cursor.
        cursor: u64,
        /// Base64-encoded bytes.
        chunk_base64: String,
    },

    /// Session process exit for attached and event-subscribed
    /// connections.
    #[serde(rename = "pty.exit")]
    PtyExit {
        /// Session id.
        session_id: String,
        /// Exit details.
        exit: ExitStatus,
    },

    /// A command response.
    #[serde(rename = "response")]
    CommandResponse {
        /// Echoed request id, when the client sent one.
        request_id: Option<serde_json::Value>,
        /// The plain response record.
        result: serde_json::Value,
    },

    /// A command failure.
    #[serde(rename = "error")]
    CommandError {
        /// Echoed request id, when the client sent one.
        request_id: Option<serde_json::Value>,
        /// Stable error code.
        code: String,
        /// Taxonomy message.
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_parse_with_defaulted_scope() {
        let command = Command::parse(serde_json::json!({
            "type": "directory.upsert",
            "path": "/tmp/project",
        }))
        .unwrap();

        match command {
            Command::DirectoryUpsert(params) => {
                assert_eq!(params.scope.resolve().tenant_id, "tenant-local");
                assert_eq!(params.path, "/tmp/project");
                assert!(params.id.is_none());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn unknown_command_kind_fails_with_taxonomy_message() {
        let err = Command::parse(serde_json::json!({"type": "directory.rename"})).unwrap_err();
        assert_eq!(
            err.to_string(),
            "unsupported command type: directory.rename"
        );
    }

    #[test]
    fn subscribe_params_build_a_filter() {
        let command = Command::parse(serde_json::json!({
            "type": "stream.subscribe",
            "tenantId": "tenant-a",
            "includeOutput": false,
            "afterCursor": 5,
        }))
        .unwrap();

        match command {
            Command::StreamSubscribe(params) => {
                assert_eq!(params.after_cursor, 5);
                let filter = params.filter();
                assert_eq!(filter.tenant_id.as_deref(), Some("tenant-a"));
                assert!(!filter.include_output);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn envelopes_serialize_with_wire_kinds() {
        let envelope = Envelope::PtyOutput {
            session_id: "conversation-1".to_owned(),
            cursor: 3,
            chunk_base64: "aGk=".to_owned(),
        };
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["type"], "pty.output");
        assert_eq!(value["chunkBase64"], "aGk=");
    }
}
