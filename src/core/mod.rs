/// Multi-tenant scope triple.
pub mod scope;

/// Structured error taxonomy surfaced to clients.
pub mod errors;

/// Directory (project) records.
pub mod directory;

/// Conversation records and their runtime projection.
pub mod conversation;

/// Repository records.
pub mod repository;

/// Task records and the task state machine types.
pub mod task;

/// Project settings and automation policies.
pub mod settings;

/// GitHub pull-request, job, and sync-state records plus CI rollup.
pub mod github;

/// Session telemetry records.
pub mod telemetry;

/// Observed events and their scopes.
pub mod events;

pub use conversation::{AgentKind, Conversation, ExitStatus, RuntimeProjection, RuntimeStatus};
pub use directory::Directory;
pub use errors::{ControlError, ControlResult};
pub use events::{
    ControllerInfo, ControllerType, EventScope, ObservedEvent, SessionControlAction,
};
pub use github::{
    CiRollup, GitHubPrJob, GitHubPullRequest, GitHubSyncState, PullRequestState, derive_ci_rollup,
};
pub use repository::Repository;
pub use scope::Scope;
pub use settings::{
    AutomationPolicy, EffectiveAutomation, PolicyScopeLevel, ProjectSettings, TaskFocusMode,
    ThreadSpawnMode,
};
pub use task::{LinearFields, Task, TaskClaim, TaskScopeKind, TaskStatus};
pub use telemetry::{TelemetryRecord, TelemetrySource};
