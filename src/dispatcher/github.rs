//! GitHub commands: project PR lookup, PR listing/creation, job listing,
//! and the my-PRs URL.

use std::sync::Arc;

use tracing::instrument;

use crate::api::protocol::{
    GithubPrCreateParams, GithubPrJobsListParams, GithubPrListParams, MyPrsUrlResponse,
    PrCreateResponse, PrJobsResponse, ProjectParams, ProjectPrResponse, PullRequestsResponse,
    RepositoryIdParams, Response,
};
use crate::core::{
    ControlError, ControlResult, Directory, EventScope, ObservedEvent, PullRequestState,
    Repository, Scope,
};
use crate::github::client::{CreatePrParams, GitHubApi};
use crate::github::{GitHubRepoRef, my_prs_url, parse_github_remote};
use crate::store::UpsertPullRequestParams;

use super::Dispatcher;

/// A project resolved for GitHub work: its repository, parsed remote, and
/// tracked branch.
struct ProjectGitHubContext {
    directory: Directory,
    repository: Repository,
    remote: GitHubRepoRef,
    branch: Option<String>,
}

impl Dispatcher {
    fn require_github_enabled(&self) -> ControlResult<()> {
        if self.config().github.enabled {
            Ok(())
        } else {
            Err(ControlError::validation("github integration is disabled"))
        }
    }

    fn github_api(&self) -> ControlResult<Arc<dyn GitHubApi>> {
        self.github
            .clone()
            .ok_or_else(|| ControlError::validation("github integration is disabled"))
    }

    /// Resolve a directory's tracked GitHub repository and branch from
    /// the git-status cache and project settings.
    async fn project_github_context(
        &self,
        scope: &Scope,
        directory_id: &str,
    ) -> ControlResult<ProjectGitHubContext> {
        let directory = self.store().require_directory(scope, directory_id).await?;
        let settings = self.store().get_project_settings(scope, directory_id).await?;

        let state = self.state().await;
        let git = state.git_status.get(directory_id).cloned();
        drop(state);

        let repository_id = git
            .as_ref()
            .and_then(|g| g.repository_id.clone())
            .ok_or_else(|| {
                ControlError::validation("project has no tracked github repository")
            })?;
        let repository = self.store().require_repository(scope, &repository_id).await?;

        let remote = parse_github_remote(&repository.remote_url).ok_or_else(|| {
            ControlError::validation("project has no tracked github repository")
        })?;

        let branch = settings
            .pinned_branch
            .clone()
            .or_else(|| git.as_ref().and_then(|g| g.branch.clone()));

        Ok(ProjectGitHubContext {
            directory,
            repository,
            remote,
            branch,
        })
    }

    /// The open PR record for a project's tracked branch.
    #[instrument(skip(self, params), fields(directory_id = %params.directory_id))]
    pub(super) async fn github_project_pr(
        &self,
        params: ProjectParams,
    ) -> ControlResult<Response> {
        self.require_github_enabled()?;
        let scope = params.scope.resolve();
        let ctx = self
            .project_github_context(&scope, &params.directory_id)
            .await?;

        let pr = match ctx.branch.as_deref() {
            Some(branch) => {
                self.store()
                    .find_open_pr_for_branch(&scope, &ctx.repository.id, branch)
                    .await?
            }
            None => None,
        };

        Ok(Response::ProjectPr(Box::new(ProjectPrResponse {
            directory_id: ctx.directory.id,
            repository_id: Some(ctx.repository.id),
            branch: ctx.branch,
            pr,
        })))
    }

    pub(super) async fn github_pr_list(
        &self,
        params: GithubPrListParams,
    ) -> ControlResult<Response> {
        self.require_github_enabled()?;
        let scope = params.scope.resolve();
        let pull_requests = self
            .store()
            .list_github_pull_requests(&scope, params.repository_id.as_deref())
            .await?;
        Ok(Response::PullRequests(PullRequestsResponse {
            pull_requests,
        }))
    }

    /// Create a PR for the project's tracked branch unless an open one
    /// already exists: check, then create, then re-check before
    /// persisting (the external await makes earlier reads stale).
    #[instrument(skip(self, params), fields(directory_id = %params.directory_id))]
    pub(super) async fn github_pr_create(
        &self,
        params: GithubPrCreateParams,
    ) -> ControlResult<Response> {
        self.require_github_enabled()?;
        let scope = params.scope.resolve();
        let ctx = self
            .project_github_context(&scope, &params.directory_id)
            .await?;

        let head_branch = params
            .head_branch
            .clone()
            .or(ctx.branch.clone())
            .ok_or_else(|| {
                ControlError::validation("project has no tracked branch for github pr")
            })?;

        // Idempotence: a preexisting open PR short-circuits before any
        // external call.
        if let Some(existing) = self
            .store()
            .find_open_pr_for_branch(&scope, &ctx.repository.id, &head_branch)
            .await?
        {
            return Ok(Response::PrCreate(Box::new(PrCreateResponse {
                created: false,
                existing: true,
                pr: existing,
            })));
        }

        let api = self.github_api()?;
        let base_branch = params
            .base_branch
            .clone()
            .unwrap_or_else(|| ctx.repository.default_branch.clone());
        let created = api
            .create_pull_request(
                &ctx.remote.owner,
                &ctx.remote.repo,
                CreatePrParams {
                    head: head_branch.clone(),
                    base: base_branch,
                    title: params.title.clone().unwrap_or_else(|| head_branch.clone()),
                    body: params.body.clone().unwrap_or_default(),
                    draft: params.draft,
                },
            )
            .await?;

        // Re-check after the await: another worker may have recorded an
        // open PR for this head in the meantime.
        if let Some(existing) = self
            .store()
            .find_open_pr_for_branch(&scope, &ctx.repository.id, &head_branch)
            .await?
        {
            return Ok(Response::PrCreate(Box::new(PrCreateResponse {
                created: false,
                existing: true,
                pr: existing,
            })));
        }

        let pr = self
            .store()
            .upsert_github_pull_request(UpsertPullRequestParams {
                scope: scope.clone(),
                repository_id: ctx.repository.id.clone(),
                directory_id: Some(ctx.directory.id.clone()),
                number: created.number,
                title: created.title,
                url: created.url,
                author: created.author,
                head_branch: created.head_branch,
                base_branch: created.base_branch,
                head_sha: created.head_sha,
                state: if created.open {
                    PullRequestState::Open
                } else {
                    PullRequestState::Closed
                },
                draft: created.draft,
            })
            .await?;

        let mut state = self.state().await;
        state.publish(
            EventScope::directory(&scope, &ctx.directory.id),
            ObservedEvent::GithubPrUpserted { pr: pr.clone() },
        );
        drop(state);

        Ok(Response::PrCreate(Box::new(PrCreateResponse {
            created: true,
            existing: false,
            pr,
        })))
    }

    pub(super) async fn github_pr_jobs_list(
        &self,
        params: GithubPrJobsListParams,
    ) -> ControlResult<Response> {
        self.require_github_enabled()?;
        let jobs = self
            .store()
            .list_github_pr_jobs(&params.pr_record_id)
            .await?;
        Ok(Response::PrJobs(PrJobsResponse {
            pr_record_id: params.pr_record_id,
            jobs,
        }))
    }

    #[instrument(skip(self, params), fields(repository_id = %params.id))]
    pub(super) async fn github_repo_my_prs_url(
        &self,
        params: RepositoryIdParams,
    ) -> ControlResult<Response> {
        self.require_github_enabled()?;
        let scope = params.scope.resolve();
        let repository = self.store().require_repository(&scope, &params.id).await?;
        let remote = parse_github_remote(&repository.remote_url).ok_or_else(|| {
            ControlError::validation("repository is not a github repository")
        })?;

        // Best effort: an unknown viewer falls back to @me.
        let viewer = match self.github.clone() {
            Some(api) => api.viewer_login().await.unwrap_or(None),
            None => None,
        };

        Ok(Response::MyPrsUrl(MyPrsUrlResponse {
            repository_id: repository.id,
            url: my_prs_url(&remote.owner, &remote.repo, viewer.as_deref()),
        }))
    }
}
