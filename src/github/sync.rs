//! Periodic per-branch reconciliation of pull requests and CI jobs.
//!
//! Each tick enumerates active directories, derives the tracked branch
//! per the configured strategy, dedupes (repository, branch) pairs,
//! filters to GitHub remotes, and reconciles each: the open PR for the
//! head branch is upserted with its jobs and rollup, or a previously open
//! record is marked closed. Failures are recorded into sync state and
//! never tear the loop down.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;

use crate::config::BranchStrategy;
use crate::core::{
    ControlResult, Directory, EventScope, ObservedEvent, PullRequestState, Repository,
    derive_ci_rollup,
};
use crate::dispatcher::Dispatcher;
use crate::store::{NewPrJob, UpsertPullRequestParams};

use super::client::GitHubApi;
use super::parse_github_remote;

/// One reconciliation target.
#[derive(Debug, Clone)]
struct SyncTarget {
    directory: Directory,
    repository: Repository,
    branch: String,
}

/// The GitHub sync loop.
pub struct GitHubSync {
    dispatcher: Arc<Dispatcher>,
    api: Arc<dyn GitHubApi>,
    interval: Duration,
    strategy: BranchStrategy,
    poll_in_flight: AtomicBool,
}

impl std::fmt::Debug for GitHubSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitHubSync")
            .field("interval", &self.interval)
            .field("strategy", &self.strategy)
            .finish_non_exhaustive()
    }
}

impl GitHubSync {
    /// Build a sync loop over the dispatcher's store and cache.
    #[must_use]
    pub fn new(dispatcher: Arc<Dispatcher>, api: Arc<dyn GitHubApi>) -> Self {
        let config = dispatcher.config().github.clone();
        Self {
            dispatcher,
            api,
            interval: Duration::from_secs(config.poll_interval_secs.max(1)),
            strategy: config.branch_strategy,
            poll_in_flight: AtomicBool::new(false),
        }
    }

    /// Run until the process exits.
    pub async fn start(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            ticker.tick().await;
            self.poll().await;
        }
    }

    /// One reconciliation pass. A tick arriving while a poll is still in
    /// flight is dropped.
    pub async fn poll(&self) {
        if self
            .poll_in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("github poll already in flight, dropping tick");
            return;
        }

        if let Err(err) = self.poll_inner().await {
            tracing::warn!(error = %err, "github poll failed");
        }

        self.poll_in_flight.store(false, Ordering::SeqCst);
    }

    async fn poll_inner(&self) -> ControlResult<()> {
        let store = self.dispatcher.store();
        let directories = store.list_all_active_directories().await?;
        let git_status = self.dispatcher.git_status_snapshot().await;

        let mut seen: HashSet<(String, String)> = HashSet::new();
        let mut targets = Vec::new();

        for directory in directories {
            let entry = git_status.get(&directory.id);
            let settings = store
                .get_project_settings(&directory.scope, &directory.id)
                .await?;

            let branch = match self.strategy {
                BranchStrategy::PinnedOnly => settings.pinned_branch,
                BranchStrategy::CurrentOnly => entry.and_then(|e| e.branch.clone()),
                BranchStrategy::PinnedThenCurrent => settings
                    .pinned_branch
                    .or_else(|| entry.and_then(|e| e.branch.clone())),
            };

            let (Some(branch), Some(repository_id)) =
                (branch, entry.and_then(|e| e.repository_id.clone()))
            else {
                continue;
            };

            if !seen.insert((repository_id.clone(), branch.clone())) {
                continue;
            }

            let Some(repository) = store
                .get_repository(&directory.scope, &repository_id)
                .await?
            else {
                continue;
            };
            if parse_github_remote(&repository.remote_url).is_none() {
                continue;
            }

            targets.push(SyncTarget {
                directory,
                repository,
                branch,
            });
        }

        for target in targets {
            self.sync_branch(&target).await;
        }

        Ok(())
    }

    /// Reconcile one (repository, branch): never raises; failures land in
    /// the sync-state row.
    async fn sync_branch(&self, target: &SyncTarget) {
        let now = Utc::now();
        let store = self.dispatcher.store();
        let scope = &target.repository.scope;

        let result = self.sync_branch_inner(target).await;
        match result {
            Ok(()) => {
                if let Err(err) = store
                    .record_github_sync_success(
                        scope,
                        &target.repository.id,
                        Some(&target.directory.id),
                        &target.branch,
                        now,
                    )
                    .await
                {
                    tracing::warn!(error = %err, "recording sync success failed");
                }
            }
            Err(err) => {
                tracing::debug!(
                    repository_id = %target.repository.id,
                    branch = %target.branch,
                    error = %err,
                    "github branch sync failed"
                );
                if let Err(record_err) = store
                    .record_github_sync_failure(
                        scope,
                        &target.repository.id,
                        Some(&target.directory.id),
                        &target.branch,
                        &err.to_string(),
                        now,
                    )
                    .await
                {
                    tracing::warn!(error = %record_err, "recording sync failure failed");
                }
            }
        }
    }

    async fn sync_branch_inner(&self, target: &SyncTarget) -> ControlResult<()> {
        let store = self.dispatcher.store();
        let scope = &target.repository.scope;
        let remote = parse_github_remote(&target.repository.remote_url)
            .ok_or_else(|| crate::core::ControlError::validation("not a github remote"))?;

        let open_pr = self
            .api
            .open_pull_request_for_branch(&remote.owner, &remote.repo, &target.branch)
            .await?;

        let Some(remote_pr) = open_pr else {
            // No open PR upstream: close our record if we had one open.
            if let Some(prior) = store
                .find_open_pr_for_branch(scope, &target.repository.id, &target.branch)
                .await?
            {
                let closed = store.mark_github_pr_closed(&prior.id, Utc::now()).await?;
                self.dispatcher
                    .publish_event(
                        EventScope::directory(scope, &target.directory.id),
                        ObservedEvent::GithubPrClosed {
                            pr_record_id: closed.id,
                            repository_id: target.repository.id.clone(),
                            number: closed.number,
                        },
                    )
                    .await;
            }
            return Ok(());
        };

        let pr = store
            .upsert_github_pull_request(UpsertPullRequestParams {
                scope: scope.clone(),
                repository_id: target.repository.id.clone(),
                directory_id: Some(target.directory.id.clone()),
                number: remote_pr.number,
                title: remote_pr.title.clone(),
                url: remote_pr.url.clone(),
                author: remote_pr.author.clone(),
                head_branch: remote_pr.head_branch.clone(),
                base_branch: remote_pr.base_branch.clone(),
                head_sha: remote_pr.head_sha.clone(),
                state: if remote_pr.open {
                    PullRequestState::Open
                } else {
                    PullRequestState::Closed
                },
                draft: remote_pr.draft,
            })
            .await?;

        let remote_jobs = self
            .api
            .list_pr_jobs_for_commit(&remote.owner, &remote.repo, &remote_pr.head_sha)
            .await?;

        let new_jobs: Vec<NewPrJob> = remote_jobs
            .into_iter()
            .map(|job| NewPrJob {
                provider: job.provider,
                external_id: job.external_id,
                name: job.name,
                status: job.status,
                conclusion: job.conclusion,
                url: job.url,
                started_at: job.started_at,
                completed_at: job.completed_at,
            })
            .collect();

        let jobs = store.replace_github_pr_jobs(&pr.id, &new_jobs).await?;
        let rollup = derive_ci_rollup(&jobs);
        let pr = store.update_github_pr_ci_rollup(&pr.id, rollup).await?;

        self.dispatcher
            .publish_event(
                EventScope::directory(scope, &target.directory.id),
                ObservedEvent::GithubPrUpserted { pr: pr.clone() },
            )
            .await;
        self.dispatcher
            .publish_event(
                EventScope::directory(scope, &target.directory.id),
                ObservedEvent::GithubPrJobsUpdated {
                    pr_record_id: pr.id.clone(),
                    repository_id: target.repository.id.clone(),
                    ci_rollup: rollup,
                },
            )
            .await;

        Ok(())
    }
}
