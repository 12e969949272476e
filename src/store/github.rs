use chrono::{DateTime, Utc};
use tracing::instrument;

use crate::core::{
    CiRollup, ControlError, ControlResult, GitHubPrJob, GitHubPullRequest, GitHubSyncState,
    PullRequestState, Scope,
};
use crate::utils::ids::prefixed_id;

use super::{SqliteStore, parse_opt_ts, parse_ts};

/// Parameters for [`SqliteStore::upsert_github_pull_request`].
#[derive(Debug, Clone)]
pub struct UpsertPullRequestParams {
    /// Scope triple; must match the repository.
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

    /// Head branch.
    pub head_branch: String,

    /// Base branch.
    pub base_branch: String,

    /// Head commit SHA.
    pub head_sha: String,

    /// Open/closed state.
    pub state: PullRequestState,

    /// Whether the PR is a draft.
    pub draft: bool,
}

/// One job to write in [`SqliteStore::replace_github_pr_jobs`].
#[derive(Debug, Clone)]
pub struct NewPrJob {
    /// `check-run` or `status-context`.
    pub provider: String,

    /// Provider-side id.
    pub external_id: String,

    /// Job name.
    pub name: String,

    /// Raw provider status.
    pub status: String,

    /// Raw provider conclusion.
    pub conclusion: Option<String>,

    /// Job detail URL.
    pub url: Option<String>,

    /// When the job started.
    pub started_at: Option<DateTime<Utc>>,

    /// When the job completed.
    pub completed_at: Option<DateTime<Utc>>,
}

impl SqliteStore {
    /// Create or update a PR record, keyed by (repository, number).
    ///
    /// # Errors
    ///
    /// Fails when the repository is missing, on a scope mismatch between
    /// the PR and its repository or directory, or on storage errors.
    #[instrument(skip(self, params), fields(repository_id = %params.repository_id, number = params.number))]
    pub async fn upsert_github_pull_request(
        &self,
        params: UpsertPullRequestParams,
    ) -> ControlResult<GitHubPullRequest> {
        let mut tx = self.pool.begin().await?;

        let repo = sqlx::query_as::<_, RefScopeRow>(
            r"
            SELECT tenant_id, user_id, workspace_id, archived_at
            FROM repositories WHERE repository_id = ?
            ",
        )
        .bind(&params.repository_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| ControlError::not_found("repository"))?;

        if repo.tenant_id != params.scope.tenant_id
            || repo.user_id != params.scope.user_id
            || repo.workspace_id != params.scope.workspace_id
        {
            return Err(ControlError::scope_mismatch("pull request repository"));
        }

        if let Some(ref directory_id) = params.directory_id {
            let dir = sqlx::query_as::<_, RefScopeRow>(
                r"
                SELECT tenant_id, user_id, workspace_id, archived_at
                FROM directories WHERE directory_id = ?
                ",
            )
            .bind(directory_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| ControlError::not_found("directory"))?;

            if dir.tenant_id != params.scope.tenant_id
                || dir.user_id != params.scope.user_id
                || dir.workspace_id != params.scope.workspace_id
            {
                return Err(ControlError::scope_mismatch("pull request directory"));
            }
        }

        let now = Utc::now();

        let existing = sqlx::query_scalar::<_, String>(
            "SELECT pr_record_id FROM github_pull_requests WHERE repository_id = ? AND number = ?",
        )
        .bind(&params.repository_id)
        .bind(params.number)
        .fetch_optional(&mut *tx)
        .await?;

        let record_id = match existing {
            Some(record_id) => {
                sqlx::query(
                    r"
                    UPDATE github_pull_requests SET
                        directory_id = ?, title = ?, url = ?, author = ?,
                        head_branch = ?, base_branch = ?, head_sha = ?,
                        state = ?, draft = ?, observed_at = ?
                    WHERE pr_record_id = ?
                    ",
                )
                .bind(&params.directory_id)
                .bind(&params.title)
                .bind(&params.url)
                .bind(&params.author)
                .bind(&params.head_branch)
                .bind(&params.base_branch)
                .bind(&params.head_sha)
                .bind(params.state.as_str())
                .bind(i64::from(params.draft))
                .bind(now.to_rfc3339())
                .bind(&record_id)
                .execute(&mut *tx)
                .await?;
                record_id
            }
            None => {
                let record_id = prefixed_id("github-pr");
                sqlx::query(
                    r"
                    INSERT INTO github_pull_requests (
                        pr_record_id, tenant_id, user_id, workspace_id,
                        repository_id, directory_id, number, title, url, author,
                        head_branch, base_branch, head_sha, state, draft,
                        ci_rollup, observed_at, created_at
                    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'none', ?, ?)
                    ",
                )
                .bind(&record_id)
                .bind(&params.scope.tenant_id)
                .bind(&params.scope.user_id)
                .bind(&params.scope.workspace_id)
                .bind(&params.repository_id)
                .bind(&params.directory_id)
                .bind(params.number)
                .bind(&params.title)
                .bind(&params.url)
                .bind(&params.author)
                .bind(&params.head_branch)
                .bind(&params.base_branch)
                .bind(&params.head_sha)
                .bind(params.state.as_str())
                .bind(i64::from(params.draft))
                .bind(now.to_rfc3339())
                .bind(now.to_rfc3339())
                .execute(&mut *tx)
                .await?;
                record_id
            }
        };

        let pr = Self::reread_pr(&mut tx, &record_id, "upsert").await?;
        tx.commit().await?;
        Ok(pr)
    }

    /// Fetch a PR record by id.
    ///
    /// # Errors
    ///
    /// Fails only on storage errors; an absent row returns `Ok(None)`.
    pub async fn get_github_pull_request(
        &self,
        pr_record_id: &str,
    ) -> ControlResult<Option<GitHubPullRequest>> {
        let row = sqlx::query_as::<_, PrRow>(
            "SELECT * FROM github_pull_requests WHERE pr_record_id = ?",
        )
        .bind(pr_record_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TryInto::try_into).transpose()
    }

    /// The open PR record for (repository, head branch), if any.
    ///
    /// # Errors
    ///
    /// Fails only on storage errors.
    pub async fn find_open_pr_for_branch(
        &self,
        scope: &Scope,
        repository_id: &str,
        head_branch: &str,
    ) -> ControlResult<Option<GitHubPullRequest>> {
        let row = sqlx::query_as::<_, PrRow>(
            r"
            SELECT * FROM github_pull_requests
            WHERE tenant_id = ? AND user_id = ? AND workspace_id = ?
              AND repository_id = ? AND head_branch = ? AND state = 'open'
            ORDER BY observed_at DESC
            LIMIT 1
            ",
        )
        .bind(&scope.tenant_id)
        .bind(&scope.user_id)
        .bind(&scope.workspace_id)
        .bind(repository_id)
        .bind(head_branch)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TryInto::try_into).transpose()
    }

    /// List PR records, optionally filtered to a repository.
    ///
    /// # Errors
    ///
    /// Fails only on storage errors.
    pub async fn list_github_pull_requests(
        &self,
        scope: &Scope,
        repository_id: Option<&str>,
    ) -> ControlResult<Vec<GitHubPullRequest>> {
        let mut sql = String::from(
            r"
            SELECT * FROM github_pull_requests
            WHERE tenant_id = ? AND user_id = ? AND workspace_id = ?
            ",
        );
        if repository_id.is_some() {
            sql.push_str(" AND repository_id = ?");
        }
        sql.push_str(" ORDER BY observed_at DESC, pr_record_id ASC");

        let mut query = sqlx::query_as::<_, PrRow>(&sql)
            .bind(&scope.tenant_id)
            .bind(&scope.user_id)
            .bind(&scope.workspace_id);
        if let Some(repo) = repository_id {
            query = query.bind(repo);
        }

        let rows = query.fetch_all(&self.pool).await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    /// Mark a previously open PR record closed.
    ///
    /// # Errors
    ///
    /// Fails when the record does not exist.
    #[instrument(skip(self))]
    pub async fn mark_github_pr_closed(
        &self,
        pr_record_id: &str,
        observed_at: DateTime<Utc>,
    ) -> ControlResult<GitHubPullRequest> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE github_pull_requests SET state = 'closed', observed_at = ? WHERE pr_record_id = ?",
        )
        .bind(observed_at.to_rfc3339())
        .bind(pr_record_id)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(ControlError::not_found("pull request"));
        }

        let pr = Self::reread_pr(&mut tx, pr_record_id, "close").await?;
        tx.commit().await?;
        Ok(pr)
    }

    /// Replace a PR's job list wholesale.
    ///
    /// # Errors
    ///
    /// Fails when the PR record does not exist.
    #[instrument(skip(self, jobs), fields(count = jobs.len()))]
    pub async fn replace_github_pr_jobs(
        &self,
        pr_record_id: &str,
        jobs: &[NewPrJob],
    ) -> ControlResult<Vec<GitHubPrJob>> {
        let mut tx = self.pool.begin().await?;

        let exists: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM github_pull_requests WHERE pr_record_id = ?",
        )
        .bind(pr_record_id)
        .fetch_one(&mut *tx)
        .await?;
        if exists == 0 {
            return Err(ControlError::not_found("pull request"));
        }

        sqlx::query("DELETE FROM github_pr_jobs WHERE pr_record_id = ?")
            .bind(pr_record_id)
            .execute(&mut *tx)
            .await?;

        for job in jobs {
            sqlx::query(
                r"
                INSERT INTO github_pr_jobs (
                    job_id, pr_record_id, provider, external_id,
                    name, status, conclusion, url, started_at, completed_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ",
            )
            .bind(prefixed_id("github-job"))
            .bind(pr_record_id)
            .bind(&job.provider)
            .bind(&job.external_id)
            .bind(&job.name)
            .bind(&job.status)
            .bind(&job.conclusion)
            .bind(&job.url)
            .bind(job.started_at.map(|t| t.to_rfc3339()))
            .bind(job.completed_at.map(|t| t.to_rfc3339()))
            .execute(&mut *tx)
            .await?;
        }

        let rows = sqlx::query_as::<_, PrJobRow>(
            "SELECT * FROM github_pr_jobs WHERE pr_record_id = ? ORDER BY name ASC, job_id ASC",
        )
        .bind(pr_record_id)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    /// List a PR's jobs.
    ///
    /// # Errors
    ///
    /// Fails only on storage errors.
    pub async fn list_github_pr_jobs(
        &self,
        pr_record_id: &str,
    ) -> ControlResult<Vec<GitHubPrJob>> {
        let rows = sqlx::query_as::<_, PrJobRow>(
            "SELECT * FROM github_pr_jobs WHERE pr_record_id = ? ORDER BY name ASC, job_id ASC",
        )
        .bind(pr_record_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    /// Store a recomputed CI rollup on a PR record.
    ///
    /// # Errors
    ///
    /// Fails when the record does not exist.
    pub async fn update_github_pr_ci_rollup(
        &self,
        pr_record_id: &str,
        rollup: CiRollup,
    ) -> ControlResult<GitHubPullRequest> {
        let mut tx = self.pool.begin().await?;

        let updated =
            sqlx::query("UPDATE github_pull_requests SET ci_rollup = ? WHERE pr_record_id = ?")
                .bind(rollup.as_str())
                .bind(pr_record_id)
                .execute(&mut *tx)
                .await?;

        if updated.rows_affected() == 0 {
            return Err(ControlError::not_found("pull request"));
        }

        let pr = Self::reread_pr(&mut tx, pr_record_id, "rollup update").await?;
        tx.commit().await?;
        Ok(pr)
    }

    /// Record a successful sync for (repository, directory, branch).
    ///
    /// # Errors
    ///
    /// Fails only on storage errors.
    pub async fn record_github_sync_success(
        &self,
        scope: &Scope,
        repository_id: &str,
        directory_id: Option<&str>,
        branch: &str,
        at: DateTime<Utc>,
    ) -> ControlResult<()> {
        sqlx::query(
            r"
            INSERT INTO github_sync_state (
                tenant_id, user_id, workspace_id, repository_id, directory_id, branch,
                last_sync_at, last_success_at, last_error, last_error_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, NULL, NULL)
            ON CONFLICT (tenant_id, user_id, workspace_id, repository_id, directory_id, branch)
            DO UPDATE SET
                last_sync_at = excluded.last_sync_at,
                last_success_at = excluded.last_success_at,
                last_error = NULL,
                last_error_at = NULL
            ",
        )
        .bind(&scope.tenant_id)
        .bind(&scope.user_id)
        .bind(&scope.workspace_id)
        .bind(repository_id)
        .bind(directory_id.unwrap_or(""))
        .bind(branch)
        .bind(at.to_rfc3339())
        .bind(at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Record a failed sync for (repository, directory, branch).
    ///
    /// # Errors
    ///
    /// Fails only on storage errors.
    pub async fn record_github_sync_failure(
        &self,
        scope: &Scope,
        repository_id: &str,
        directory_id: Option<&str>,
        branch: &str,
        error: &str,
        at: DateTime<Utc>,
    ) -> ControlResult<()> {
        sqlx::query(
            r"
            INSERT INTO github_sync_state (
                tenant_id, user_id, workspace_id, repository_id, directory_id, branch,
                last_sync_at, last_success_at, last_error, last_error_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, NULL, ?, ?)
            ON CONFLICT (tenant_id, user_id, workspace_id, repository_id, directory_id, branch)
            DO UPDATE SET
                last_sync_at = excluded.last_sync_at,
                last_error = excluded.last_error,
                last_error_at = excluded.last_error_at
            ",
        )
        .bind(&scope.tenant_id)
        .bind(&scope.user_id)
        .bind(&scope.workspace_id)
        .bind(repository_id)
        .bind(directory_id.unwrap_or(""))
        .bind(branch)
        .bind(at.to_rfc3339())
        .bind(error)
        .bind(at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// The sync state row for (repository, directory, branch), if any.
    ///
    /// # Errors
    ///
    /// Fails only on storage errors.
    pub async fn get_github_sync_state(
        &self,
        scope: &Scope,
        repository_id: &str,
        directory_id: Option<&str>,
        branch: &str,
    ) -> ControlResult<Option<GitHubSyncState>> {
        let row = sqlx::query_as::<_, SyncStateRow>(
            r"
            SELECT * FROM github_sync_state
            WHERE tenant_id = ? AND user_id = ? AND workspace_id = ?
              AND repository_id = ? AND directory_id = ? AND branch = ?
            ",
        )
        .bind(&scope.tenant_id)
        .bind(&scope.user_id)
        .bind(&scope.workspace_id)
        .bind(repository_id)
        .bind(directory_id.unwrap_or(""))
        .bind(branch)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TryInto::try_into).transpose()
    }

    async fn reread_pr(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        pr_record_id: &str,
        op: &'static str,
    ) -> ControlResult<GitHubPullRequest> {
        let row = sqlx::query_as::<_, PrRow>(
            "SELECT * FROM github_pull_requests WHERE pr_record_id = ?",
        )
        .bind(pr_record_id)
        .fetch_optional(&mut **tx)
        .await?;

        row.ok_or_else(|| ControlError::missing_after("pull request", op))?
            .try_into()
    }
}

#[derive(sqlx::FromRow)]
struct RefScopeRow {
    tenant_id: String,
    user_id: String,
    workspace_id: String,
    #[allow(dead_code)]
    archived_at: Option<String>,
}

#[derive(sqlx::FromRow)]
struct PrRow {
    pr_record_id: String,
    tenant_id: String,
    user_id: String,
    workspace_id: String,
    repository_id: String,
    directory_id: Option<String>,
    number: i64,
    title: String,
    url: String,
    author: Option<String>,
    head_branch: String,
    base_branch: String,
    head_sha: String,
    state: String,
    draft: i64,
    ci_rollup: String,
    observed_at: String,
    created_at: String,
}

impl TryFrom<PrRow> for GitHubPullRequest {
    type Error = ControlError;

    fn try_from(row: PrRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.pr_record_id,
            scope: Scope::new(row.tenant_id, row.user_id, row.workspace_id),
            repository_id: row.repository_id,
            directory_id: row.directory_id,
            number: row.number,
            title: row.title,
            url: row.url,
            author: row.author,
            head_branch: row.head_branch,
            base_branch: row.base_branch,
            head_sha: row.head_sha,
            state: row.state.parse()?,
            draft: row.draft != 0,
            ci_rollup: row.ci_rollup.parse()?,
            observed_at: parse_ts(&row.observed_at, "pull request observed_at")?,
            created_at: parse_ts(&row.created_at, "pull request created_at")?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct PrJobRow {
    job_id: String,
    pr_record_id: String,
    provider: String,
    external_id: String,
    name: String,
    status: String,
    conclusion: Option<String>,
    url: Option<String>,
    started_at: Option<String>,
    completed_at: Option<String>,
}

impl TryFrom<PrJobRow> for GitHubPrJob {
    type Error = ControlError;

    fn try_from(row: PrJobRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.job_id,
            pr_record_id: row.pr_record_id,
            provider: row.provider,
            external_id: row.external_id,
            name: row.name,
            status: row.status,
            conclusion: row.conclusion,
            url: row.url,
            started_at: parse_opt_ts(row.started_at.as_deref(), "pr job started_at")?,
            completed_at: parse_opt_ts(row.completed_at.as_deref(), "pr job completed_at")?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct SyncStateRow {
    tenant_id: String,
    user_id: String,
    workspace_id: String,
    repository_id: String,
    directory_id: String,
    branch: String,
    last_sync_at: Option<String>,
    last_success_at: Option<String>,
    last_error: Option<String>,
    last_error_at: Option<String>,
}

impl TryFrom<SyncStateRow> for GitHubSyncState {
    type Error = ControlError;

    fn try_from(row: SyncStateRow) -> Result<Self, Self::Error> {
        Ok(Self {
            scope: Scope::new(row.tenant_id, row.user_id, row.workspace_id),
            repository_id: row.repository_id,
            directory_id: if row.directory_id.is_empty() {
                None
            } else {
                Some(row.directory_id)
            },
            branch: row.branch,
            last_sync_at: parse_opt_ts(row.last_sync_at.as_deref(), "sync last_sync_at")?,
            last_success_at: parse_opt_ts(row.last_success_at.as_deref(), "sync last_success_at")?,
            last_error: row.last_error,
            last_error_at: parse_opt_ts(row.last_error_at.as_deref(), "sync last_error_at")?,
        })
    }
}
