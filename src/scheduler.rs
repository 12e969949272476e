//! Task scheduler: project availability gates and the pull procedure.
//!
//! `task.pull` claims one ready task for a context. A project must pass
//! the gate ladder (automation enabled, not frozen, tracked, repository
//! match, pinned branch, clean tree, unoccupied) before candidates are
//! tried in project, repository, global order. Lost claim races surface
//! as `task already claimed:` from the store and are treated as another
//! worker winning, not as failures.

use serde::{Deserialize, Serialize};

use crate::core::{
    ControlError, ControlResult, Directory, EffectiveAutomation, ProjectSettings, Task,
    TaskFocusMode,
};
use crate::gitstatus::GitStatusEntry;
use crate::store::{ClaimTaskParams, SqliteStore};

/// Result of the project-readiness predicate, in gate priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Availability {
    /// Effective automation is disabled.
    BlockedDisabled,

    /// Effective automation is frozen.
    BlockedFrozen,

    /// No git status, no repository id, or no branch.
    BlockedUntracked,

    /// The required repository differs from the tracked one.
    BlockedRepositoryMismatch,

    /// A pinned branch is set and the checkout is elsewhere.
    BlockedPinnedBranch,

    /// The working tree has pending changes.
    BlockedDirty,

    /// The project already has a live thread.
    BlockedOccupied,

    /// All gates passed.
    Ready,
}

impl Availability {
    /// Stable wire representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BlockedDisabled => "blocked-disabled",
            Self::BlockedFrozen => "blocked-frozen",
            Self::BlockedUntracked => "blocked-untracked",
            Self::BlockedRepositoryMismatch => "blocked-repository-mismatch",
            Self::BlockedPinnedBranch => "blocked-pinned-branch",
            Self::BlockedDirty => "blocked-dirty",
            Self::BlockedOccupied => "blocked-occupied",
            Self::Ready => "ready",
        }
    }

    /// Human-readable reason shown to callers.
    #[must_use]
    pub fn reason(self) -> &'static str {
        match self {
            Self::BlockedDisabled => "automation is disabled for this project",
            Self::BlockedFrozen => "automation is frozen for this project",
            Self::BlockedUntracked => "project has no tracked git repository",
            Self::BlockedRepositoryMismatch => "project tracks a different repository",
            Self::BlockedPinnedBranch => "project is pinned to a different branch",
            Self::BlockedDirty => "project has pending git changes",
            Self::BlockedOccupied => "project already has a live thread",
            Self::Ready => "ready",
        }
    }
}

/// Everything the availability predicate needs about one project.
#[derive(Debug, Clone)]
pub struct ProjectPullContext {
    /// The directory record.
    pub directory: Directory,

    /// Its settings (possibly the synthesized default).
    pub settings: ProjectSettings,

    /// Its effective automation switches.
    pub automation: EffectiveAutomation,

    /// Its git status cache entry, when tracked.
    pub git: Option<GitStatusEntry>,

    /// Number of live threads rooted at the directory.
    pub live_threads: usize,

    /// Number of in-progress tasks claimed against the directory.
    pub claimed_tasks: usize,
}

/// Evaluate the gate ladder for one project.
#[must_use]
pub fn evaluate_project_availability(
    ctx: &ProjectPullContext,
    required_repository_id: Option<&str>,
) -> Availability {
    if !ctx.automation.enabled {
        return Availability::BlockedDisabled;
    }
    if ctx.automation.frozen {
        return Availability::BlockedFrozen;
    }

    let Some(git) = ctx.git.as_ref() else {
        return Availability::BlockedUntracked;
    };
    let Some(tracked_repository) = git.repository_id.as_deref() else {
        return Availability::BlockedUntracked;
    };
    let Some(current_branch) = git.branch.as_deref() else {
        return Availability::BlockedUntracked;
    };

    if let Some(required) = required_repository_id {
        if required != tracked_repository {
            return Availability::BlockedRepositoryMismatch;
        }
    }

    if let Some(pinned) = ctx.settings.pinned_branch.as_deref() {
        if pinned != current_branch {
            return Availability::BlockedPinnedBranch;
        }
    }

    if git.changed_files > 0 {
        return Availability::BlockedDirty;
    }

    // A live thread or an already-claimed task both occupy the project.
    if ctx.live_threads > 0 || ctx.claimed_tasks > 0 {
        return Availability::BlockedOccupied;
    }

    Availability::Ready
}

/// Branch overrides a pull carries from the command.
#[derive(Debug, Clone, Default)]
pub struct PullOverrides {
    /// Working branch override.
    pub branch_name: Option<String>,

    /// Base branch override.
    pub base_branch: Option<String>,
}

/// Outcome of a pull attempt.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PullOutcome {
    /// The claimed task, when one was won.
    pub task: Option<Task>,

    /// Directory the pull was evaluated against.
    pub directory_id: Option<String>,

    /// Availability of that directory.
    pub availability: Availability,

    /// Why nothing was claimed, when nothing was.
    pub reason: Option<String>,

    /// The directory's settings, when a directory was evaluated.
    pub settings: Option<ProjectSettings>,

    /// The effective repository, when one was involved.
    pub repository_id: Option<String>,
}

impl PullOutcome {
    fn blocked(ctx: &ProjectPullContext, availability: Availability) -> Self {
        Self {
            task: None,
            directory_id: Some(ctx.directory.id.clone()),
            availability,
            reason: Some(availability.reason().to_owned()),
            settings: Some(ctx.settings.clone()),
            repository_id: ctx.git.as_ref().and_then(|g| g.repository_id.clone()),
        }
    }
}

/// Attempt to claim one task, treating a lost race as `None`.
///
/// # Errors
///
/// Propagates every store failure except the claim conflict.
pub async fn try_claim_task(
    store: &SqliteStore,
    params: ClaimTaskParams,
) -> ControlResult<Option<Task>> {
    match store.claim_task(params).await {
        Ok(task) => Ok(Some(task)),
        Err(ControlError::Conflict { ref message }) if message.starts_with("task already claimed:") => {
            Ok(None)
        }
        Err(err) => Err(err),
    }
}

/// Pull one ready task for a project.
///
/// Candidate order: project-scoped tasks, then (unless the project is in
/// own-only focus) repository-scoped tasks for the effective repository,
/// then global tasks. The first successful claim wins.
///
/// # Errors
///
/// Propagates store failures other than lost claim races.
pub async fn pull_for_directory(
    store: &SqliteStore,
    ctx: &ProjectPullContext,
    required_repository_id: Option<&str>,
    controller_id: &str,
    overrides: &PullOverrides,
) -> ControlResult<PullOutcome> {
    let availability = evaluate_project_availability(ctx, required_repository_id);
    if availability != Availability::Ready {
        return Ok(PullOutcome::blocked(ctx, availability));
    }

    let scope = &ctx.directory.scope;
    let effective_repository = required_repository_id
        .map(str::to_owned)
        .or_else(|| ctx.git.as_ref().and_then(|g| g.repository_id.clone()));

    let mut candidates: Vec<Task> = store
        .list_ready_project_tasks(scope, &ctx.directory.id)
        .await?;

    if ctx.settings.task_focus_mode != TaskFocusMode::OwnOnly {
        if let Some(ref repository_id) = effective_repository {
            candidates.extend(
                store
                    .list_ready_repository_tasks(scope, repository_id)
                    .await?,
            );
        }
        candidates.extend(store.list_ready_global_tasks(scope).await?);
    }

    let branch_name = overrides
        .branch_name
        .clone()
        .or_else(|| ctx.settings.pinned_branch.clone());
    let base_branch = overrides
        .base_branch
        .clone()
        .or_else(|| ctx.settings.pinned_branch.clone());

    for candidate in candidates {
        let claimed = try_claim_task(
            store,
            ClaimTaskParams {
                scope: scope.clone(),
                task_id: candidate.id.clone(),
                controller_id: controller_id.to_owned(),
                directory_id: Some(ctx.directory.id.clone()),
                branch_name: branch_name.clone(),
                base_branch: base_branch.clone(),
            },
        )
        .await?;

        if let Some(task) = claimed {
            return Ok(PullOutcome {
                task: Some(task),
                directory_id: Some(ctx.directory.id.clone()),
                availability: Availability::Ready,
                reason: None,
                settings: Some(ctx.settings.clone()),
                repository_id: effective_repository,
            });
        }
    }

    Ok(PullOutcome {
        task: None,
        directory_id: Some(ctx.directory.id.clone()),
        availability: Availability::Ready,
        reason: Some("no ready tasks for project".to_owned()),
        settings: Some(ctx.settings.clone()),
        repository_id: effective_repository,
    })
}

/// Pull one ready task across every project tracking a repository.
///
/// Directories are tried in `created_at, id` order; the first successful
/// claim wins. When nothing claims, the first directory's outcome is
/// returned so callers see why the leading candidate was blocked.
///
/// # Errors
///
/// Propagates store failures other than lost claim races.
pub async fn pull_for_repository(
    store: &SqliteStore,
    contexts: &[ProjectPullContext],
    repository_id: &str,
    controller_id: &str,
    overrides: &PullOverrides,
) -> ControlResult<PullOutcome> {
    let mut first_outcome: Option<PullOutcome> = None;

    for ctx in contexts {
        let outcome =
            pull_for_directory(store, ctx, Some(repository_id), controller_id, overrides).await?;

        if outcome.task.is_some() {
            return Ok(outcome);
        }
        if first_outcome.is_none() {
            first_outcome = Some(outcome);
        }
    }

    Ok(first_outcome.unwrap_or(PullOutcome {
        task: None,
        directory_id: None,
        availability: Availability::BlockedUntracked,
        reason: Some("no active directories track this repository".to_owned()),
        settings: None,
        repository_id: Some(repository_id.to_owned()),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Scope;
    use chrono::Utc;

    fn context(git: Option<GitStatusEntry>) -> ProjectPullContext {
        let scope = Scope::local();
        let directory = Directory::new("directory-1".to_owned(), scope.clone(), "/tmp/p".to_owned());
        ProjectPullContext {
            settings: ProjectSettings::default_for(&directory.id, &scope),
            directory,
            automation: EffectiveAutomation::default(),
            git,
            live_threads: 0,
            claimed_tasks: 0,
        }
    }

    fn tracked_git() -> GitStatusEntry {
        GitStatusEntry {
            branch: Some("main".to_owned()),
            changed_files: 0,
            repository_id: Some("repository-1".to_owned()),
            remote_url: Some("https://github.com/acme/h.git".to_owned()),
            refreshed_at: Utc::now(),
        }
    }

    #[test]
    fn gates_fire_in_priority_order() {
        let mut ctx = context(Some(tracked_git()));

        ctx.automation.enabled = false;
        ctx.automation.frozen = true;
        assert_eq!(
            evaluate_project_availability(&ctx, None),
            Availability::BlockedDisabled
        );

        ctx.automation.enabled = true;
        assert_eq!(
            evaluate_project_availability(&ctx, None),
            Availability::BlockedFrozen
        );

        ctx.automation.frozen = false;
        ctx.git = None;
        assert_eq!(
            evaluate_project_availability(&ctx, None),
            Availability::BlockedUntracked
        );
    }

    #[test]
    fn repository_mismatch_beats_pinned_branch() {
        let mut ctx = context(Some(tracked_git()));
        ctx.settings.pinned_branch = Some("release".to_owned());

        assert_eq!(
            evaluate_project_availability(&ctx, Some("repository-other")),
            Availability::BlockedRepositoryMismatch
        );
        assert_eq!(
            evaluate_project_availability(&ctx, Some("repository-1")),
            Availability::BlockedPinnedBranch
        );
    }

    #[test]
    fn dirty_then_occupied_then_ready() {
        let mut ctx = context(Some(tracked_git()));

        if let Some(ref mut git) = ctx.git {
            git.changed_files = 3;
        }
        assert_eq!(
            evaluate_project_availability(&ctx, None),
            Availability::BlockedDirty
        );

        if let Some(ref mut git) = ctx.git {
            git.changed_files = 0;
        }
        ctx.live_threads = 1;
        assert_eq!(
            evaluate_project_availability(&ctx, None),
            Availability::BlockedOccupied
        );

        ctx.live_threads = 0;
        ctx.claimed_tasks = 1;
        assert_eq!(
            evaluate_project_availability(&ctx, None),
            Availability::BlockedOccupied
        );

        ctx.claimed_tasks = 0;
        assert_eq!(evaluate_project_availability(&ctx, None), Availability::Ready);
    }

    #[test]
    fn missing_branch_is_untracked() {
        let mut git = tracked_git();
        git.branch = None;
        let ctx = context(Some(git));
        assert_eq!(
            evaluate_project_availability(&ctx, None),
            Availability::BlockedUntracked
        );
    }
}
