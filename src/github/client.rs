//! GitHub REST v3 client behind an object-safe trait.
//!
//! The dispatcher and the sync loop only see [`GitHubApi`]; tests script
//! [`MockGitHubApi`] instead of hitting the network.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::core::{ControlError, ControlResult};

/// A pull request as observed from the API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePullRequest {
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

    /// Head commit SHA.
    pub head_sha: String,

    /// Base branch name.
    pub base_branch: String,

    /// Whether the PR is a draft.
    pub draft: bool,

    /// Whether the PR is open.
    pub open: bool,
}

/// A CI job observed on a commit: a check run or a status context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteJob {
    /// `check-run` or `status-context`.
    pub provider: String,

    /// Provider-side id.
    pub external_id: String,

    /// Job name.
    pub name: String,

    /// Raw status (`queued`, `in_progress`, `completed`, `pending`).
    pub status: String,

    /// Raw conclusion when completed.
    pub conclusion: Option<String>,

    /// Detail URL.
    pub url: Option<String>,

    /// When the job started.
    pub started_at: Option<DateTime<Utc>>,

    /// When the job completed.
    pub completed_at: Option<DateTime<Utc>>,
}

/// Parameters for creating a pull request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatePrParams {
    /// Head branch.
    pub head: String,

    /// Base branch.
    pub base: String,

    /// PR title.
    pub title: String,

    /// PR body.
    pub body: String,

    /// Open as a draft.
    pub draft: bool,
}

/// Object-safe GitHub API surface.
#[async_trait]
pub trait GitHubApi: Send + Sync {
    /// The first open PR whose head is `branch`, if any.
    ///
    /// # Errors
    ///
    /// Fails when the API request fails.
    async fn open_pull_request_for_branch(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
    ) -> ControlResult<Option<RemotePullRequest>>;

    /// Check runs and status contexts for a commit.
    ///
    /// # Errors
    ///
    /// Fails when the API request fails.
    async fn list_pr_jobs_for_commit(
        &self,
        owner: &str,
        repo: &str,
        sha: &str,
    ) -> ControlResult<Vec<RemoteJob>>;

    /// Open a pull request.
    ///
    /// # Errors
    ///
    /// Fails when the API request fails.
    async fn create_pull_request(
        &self,
        owner: &str,
        repo: &str,
        params: CreatePrParams,
    ) -> ControlResult<RemotePullRequest>;

    /// The authenticated user's login, when resolvable.
    ///
    /// # Errors
    ///
    /// Fails when the API request fails.
    async fn viewer_login(&self) -> ControlResult<Option<String>>;
}

/// Resolve a GitHub token: configured value, then `GITHUB_TOKEN`, then
/// `gh auth token`.
pub async fn resolve_github_token(configured: Option<&str>) -> Option<String> {
    if let Some(token) = configured {
        if !token.trim().is_empty() {
            return Some(token.trim().to_owned());
        }
    }

    if let Ok(token) = std::env::var("GITHUB_TOKEN") {
        if !token.trim().is_empty() {
            return Some(token.trim().to_owned());
        }
    }

    let output = tokio::process::Command::new("gh")
        .args(["auth", "token"])
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let token = String::from_utf8_lossy(&output.stdout).trim().to_owned();
    if token.is_empty() { None } else { Some(token) }
}

const API_BASE: &str = "https://api.github.com";

/// reqwest-backed [`GitHubApi`].
#[derive(Debug)]
pub struct RestGitHubClient {
    http: reqwest::Client,
    token: String,
    api_base: String,
}

impl RestGitHubClient {
    /// Build a client for the public API.
    #[must_use]
    pub fn new(token: String) -> Self {
        Self::with_base(token, API_BASE.to_owned())
    }

    /// Build a client against a custom API base (for tests).
    #[must_use]
    pub fn with_base(token: String, api_base: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            token,
            api_base,
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, format!("{}{path}", self.api_base))
            .bearer_auth(&self.token)
            .header(reqwest::header::USER_AGENT, "conductor")
            .header(reqwest::header::ACCEPT, "application/vnd.github+json")
    }

    async fn check_status(response: reqwest::Response) -> ControlResult<reqwest::Response> {
        if response.status().is_success() {
            Ok(response)
        } else {
            Err(ControlError::external(format!(
                "github api request failed: {}",
                response.status().as_u16()
            )))
        }
    }
}

#[derive(Deserialize)]
struct PrDto {
    number: i64,
    title: String,
    html_url: String,
    state: String,
    #[serde(default)]
    draft: bool,
    user: Option<UserDto>,
    head: RefDto,
    base: BaseRefDto,
}

#[derive(Deserialize)]
struct UserDto {
    login: String,
}

#[derive(Deserialize)]
struct RefDto {
    #[serde(rename = "ref")]
    branch: String,
    sha: String,
}

#[derive(Deserialize)]
struct BaseRefDto {
    #[serde(rename = "ref")]
    branch: String,
}

impl From<PrDto> for RemotePullRequest {
    fn from(dto: PrDto) -> Self {
        Self {
            number: dto.number,
            title: dto.title,
            url: dto.html_url,
            author: dto.user.map(|u| u.login),
            head_branch: dto.head.branch,
            head_sha: dto.head.sha,
            base_branch: dto.base.branch,
            draft: dto.draft,
            open: dto.state == "open",
        }
    }
}

#[derive(Deserialize)]
struct CheckRunsDto {
    #[serde(default)]
    check_runs: Vec<CheckRunDto>,
}

#[derive(Deserialize)]
struct CheckRunDto {
    id: i64,
    name: String,
    status: String,
    conclusion: Option<String>,
    html_url: Option<String>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
struct CombinedStatusDto {
    #[serde(default)]
    statuses: Vec<StatusContextDto>,
}

#[derive(Deserialize)]
struct StatusContextDto {
    id: i64,
    context: String,
    state: String,
    target_url: Option<String>,
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
struct ViewerDto {
    login: String,
}

#[async_trait]
impl GitHubApi for RestGitHubClient {
    async fn open_pull_request_for_branch(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
    ) -> ControlResult<Option<RemotePullRequest>> {
        let response = self
            .request(
                reqwest::Method::GET,
                &format!("/repos/{owner}/{repo}/pulls"),
            )
            .query(&[
                ("state", "open"),
                ("head", &format!("{owner}:{branch}")),
                ("per_page", "1"),
            ])
            .send()
            .await
            .map_err(|e| ControlError::external(format!("github api request failed: {e}")))?;

        let response = Self::check_status(response).await?;
        let prs: Vec<PrDto> = response
            .json()
            .await
            .map_err(|e| ControlError::external(format!("github api request failed: {e}")))?;

        Ok(prs.into_iter().next().map(Into::into))
    }

    async fn list_pr_jobs_for_commit(
        &self,
        owner: &str,
        repo: &str,
        sha: &str,
    ) -> ControlResult<Vec<RemoteJob>> {
        let mut jobs = Vec::new();

        let response = self
            .request(
                reqwest::Method::GET,
                &format!("/repos/{owner}/{repo}/commits/{sha}/check-runs"),
            )
            .send()
            .await
            .map_err(|e| ControlError::external(format!("github api request failed: {e}")))?;
        let response = Self::check_status(response).await?;
        let check_runs: CheckRunsDto = response
            .json()
            .await
            .map_err(|e| ControlError::external(format!("github api request failed: {e}")))?;

        for run in check_runs.check_runs {
            jobs.push(RemoteJob {
                provider: "check-run".to_owned(),
                external_id: run.id.to_string(),
                name: run.name,
                status: run.status,
                conclusion: run.conclusion,
                url: run.html_url,
                started_at: run.started_at,
                completed_at: run.completed_at,
            });
        }

        let response = self
            .request(
                reqwest::Method::GET,
                &format!("/repos/{owner}/{repo}/commits/{sha}/status"),
            )
            .send()
            .await
            .map_err(|e| ControlError::external(format!("github api request failed: {e}")))?;
        let response = Self::check_status(response).await?;
        let combined: CombinedStatusDto = response
            .json()
            .await
            .map_err(|e| ControlError::external(format!("github api request failed: {e}")))?;

        for status in combined.statuses {
            // Status contexts collapse into the check-run status model.
            let (job_status, conclusion) = match status.state.as_str() {
                "success" => ("completed", Some("success".to_owned())),
                "failure" | "error" => ("completed", Some("failure".to_owned())),
                _ => ("pending", None),
            };
            jobs.push(RemoteJob {
                provider: "status-context".to_owned(),
                external_id: status.id.to_string(),
                name: status.context,
                status: job_status.to_owned(),
                conclusion,
                url: status.target_url,
                started_at: status.created_at,
                completed_at: status.updated_at,
            });
        }

        Ok(jobs)
    }

    async fn create_pull_request(
        &self,
        owner: &str,
        repo: &str,
        params: CreatePrParams,
    ) -> ControlResult<RemotePullRequest> {
        let response = self
            .request(
                reqwest::Method::POST,
                &format!("/repos/{owner}/{repo}/pulls"),
            )
            .json(&serde_json::json!({
                "title": params.title,
                "head": params.head,
                "base": params.base,
                "body": params.body,
                "draft": params.draft,
            }))
            .send()
            .await
            .map_err(|e| ControlError::external(format!("github api request failed: {e}")))?;

        let response = Self::check_status(response).await?;
        let pr: PrDto = response
            .json()
            .await
            .map_err(|e| ControlError::external(format!("github api request failed: {e}")))?;

        Ok(pr.into())
    }

    async fn viewer_login(&self) -> ControlResult<Option<String>> {
        let response = self
            .request(reqwest::Method::GET, "/user")
            .send()
            .await
            .map_err(|e| ControlError::external(format!("github api request failed: {e}")))?;

        if !response.status().is_success() {
            return Ok(None);
        }

        let viewer: ViewerDto = response
            .json()
            .await
            .map_err(|e| ControlError::external(format!("github api request failed: {e}")))?;
        Ok(Some(viewer.login))
    }
}

/// Scripted [`GitHubApi`] for tests.
#[derive(Debug, Default)]
pub struct MockGitHubApi {
    inner: Mutex<MockGitHubState>,
}

#[derive(Debug, Default)]
struct MockGitHubState {
    open_prs: std::collections::HashMap<String, RemotePullRequest>,
    jobs: std::collections::HashMap<String, Vec<RemoteJob>>,
    viewer: Option<String>,
    created: Vec<CreatePrParams>,
    next_number: i64,
    open_pr_calls: usize,
    create_calls: usize,
}

impl MockGitHubApi {
    /// A mock with no PRs and no viewer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the open PR returned for `owner/repo` + `branch`.
    pub async fn set_open_pr(&self, owner: &str, repo: &str, branch: &str, pr: RemotePullRequest) {
        self.inner
            .lock()
            .await
            .open_prs
            .insert(format!("{owner}/{repo}#{branch}"), pr);
    }

    /// Clear the open PR for a branch (branch merged or closed).
    pub async fn clear_open_pr(&self, owner: &str, repo: &str, branch: &str) {
        self.inner
            .lock()
            .await
            .open_prs
            .remove(&format!("{owner}/{repo}#{branch}"));
    }

    /// Script the jobs returned for a commit SHA.
    pub async fn set_jobs(&self, sha: &str, jobs: Vec<RemoteJob>) {
        self.inner.lock().await.jobs.insert(sha.to_owned(), jobs);
    }

    /// Script the viewer login.
    pub async fn set_viewer(&self, login: &str) {
        self.inner.lock().await.viewer = Some(login.to_owned());
    }

    /// PRs created through the mock, in order.
    pub async fn created(&self) -> Vec<CreatePrParams> {
        self.inner.lock().await.created.clone()
    }

    /// How many times `open_pull_request_for_branch` was called.
    pub async fn open_pr_calls(&self) -> usize {
        self.inner.lock().await.open_pr_calls
    }

    /// How many times `create_pull_request` was called.
    pub async fn create_calls(&self) -> usize {
        self.inner.lock().await.create_calls
    }
}

#[async_trait]
impl GitHubApi for MockGitHubApi {
    async fn open_pull_request_for_branch(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
    ) -> ControlResult<Option<RemotePullRequest>> {
        let mut state = self.inner.lock().await;
        state.open_pr_calls += 1;
        Ok(state.open_prs.get(&format!("{owner}/{repo}#{branch}")).cloned())
    }

    async fn list_pr_jobs_for_commit(
        &self,
        _owner: &str,
        _repo: &str,
        sha: &str,
    ) -> ControlResult<Vec<RemoteJob>> {
        Ok(self
            .inner
            .lock()
            .await
            .jobs
            .get(sha)
            .cloned()
            .unwrap_or_default())
    }

    async fn create_pull_request(
        &self,
        owner: &str,
        repo: &str,
        params: CreatePrParams,
    ) -> ControlResult<RemotePullRequest> {
        let mut state = self.inner.lock().await;
        state.create_calls += 1;
        state.next_number += 1;
        let number = state.next_number;
        state.created.push(params.clone());

        let pr = RemotePullRequest {
            number,
            title: params.title,
            url: format!("https://github.com/{owner}/{repo}/pull/{number}"),
            author: state.viewer.clone(),
            head_branch: params.head,
            head_sha: format!("sha-{number}"),
            base_branch: params.base,
            draft: params.draft,
            open: true,
        };
        state
            .open_prs
            .insert(format!("{owner}/{repo}#{}", pr.head_branch), pr.clone());
        Ok(pr)
    }

    async fn viewer_login(&self) -> ControlResult<Option<String>> {
        Ok(self.inner.lock().await.viewer.clone())
    }
}
