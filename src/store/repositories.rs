use tracing::instrument;

use crate::core::{ControlError, ControlResult, Repository, Scope};
use crate::utils::ids::prefixed_id;

use super::{SqliteStore, lenient_json_object, parse_opt_ts, parse_ts};

/// Parameters for [`SqliteStore::upsert_repository`].
#[derive(Debug, Clone)]
pub struct UpsertRepositoryParams {
    /// Existing id to upsert, or `None` to resolve by (scope, remote URL).
    pub id: Option<String>,

    /// Scope triple of the caller.
    pub scope: Scope,

    /// Human-readable name.
    pub name: String,

    /// Remote URL.
    pub remote_url: String,

    /// Default branch; `main` when absent.
    pub default_branch: Option<String>,

    /// Metadata map; merged over nothing (replaces) when present.
    pub metadata: Option<serde_json::Value>,
}

/// Parameters for [`SqliteStore::update_repository`].
#[derive(Debug, Clone, Default)]
pub struct UpdateRepositoryParams {
    /// New name, when changing.
    pub name: Option<String>,

    /// New default branch, when changing.
    pub default_branch: Option<String>,

    /// New metadata map, when changing.
    pub metadata: Option<serde_json::Value>,
}

impl SqliteStore {
    /// Create, update, or restore a repository.
    ///
    /// Unique by (scope, remote URL) among non-archived rows; an archived
    /// row with the same URL is restored rather than duplicated.
    ///
    /// # Errors
    ///
    /// Fails on scope mismatch, on validation failures, or when the
    /// written row cannot be reread.
    #[instrument(skip(self, params), fields(remote_url = %params.remote_url))]
    pub async fn upsert_repository(
        &self,
        params: UpsertRepositoryParams,
    ) -> ControlResult<Repository> {
        if params.remote_url.trim().is_empty() {
            return Err(ControlError::validation("expected non-empty remoteUrl"));
        }
        if params.name.trim().is_empty() {
            return Err(ControlError::validation("expected non-empty name"));
        }

        let mut tx = self.pool.begin().await?;
        let now = chrono::Utc::now();

        if let Some(ref id) = params.id {
            let existing = sqlx::query_as::<_, RepositoryRow>(
                "SELECT * FROM repositories WHERE repository_id = ?",
            )
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;

            if let Some(row) = existing {
                if row.tenant_id != params.scope.tenant_id
                    || row.user_id != params.scope.user_id
                    || row.workspace_id != params.scope.workspace_id
                {
                    return Err(ControlError::scope_mismatch("repository"));
                }

                sqlx::query(
                    r"
                    UPDATE repositories
                    SET name = ?, remote_url = ?, default_branch = ?, metadata = ?
                    WHERE repository_id = ?
                    ",
                )
                .bind(&params.name)
                .bind(&params.remote_url)
                .bind(
                    params
                        .default_branch
                        .as_deref()
                        .unwrap_or(&row.default_branch),
                )
                .bind(
                    params
                        .metadata
                        .as_ref()
                        .map_or_else(|| row.metadata.clone(), serde_json::Value::to_string),
                )
                .bind(id)
                .execute(&mut *tx)
                .await?;

                let repository = Self::reread_repository(&mut tx, id, "upsert").await?;
                tx.commit().await?;
                return Ok(repository);
            }
        }

        // Resolve by (scope, remote URL): prefer the active row, then an
        // archived one to restore.
        let by_url = sqlx::query_as::<_, RepositoryRow>(
            r"
            SELECT * FROM repositories
            WHERE tenant_id = ? AND user_id = ? AND workspace_id = ? AND remote_url = ?
            ORDER BY archived_at IS NOT NULL, created_at ASC
            LIMIT 1
            ",
        )
        .bind(&params.scope.tenant_id)
        .bind(&params.scope.user_id)
        .bind(&params.scope.workspace_id)
        .bind(&params.remote_url)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(row) = by_url {
            sqlx::query(
                r"
                UPDATE repositories
                SET name = ?, default_branch = ?, metadata = ?, archived_at = NULL
                WHERE repository_id = ?
                ",
            )
            .bind(&params.name)
            .bind(
                params
                    .default_branch
                    .as_deref()
                    .unwrap_or(&row.default_branch),
            )
            .bind(
                params
                    .metadata
                    .as_ref()
                    .map_or_else(|| row.metadata.clone(), serde_json::Value::to_string),
            )
            .bind(&row.repository_id)
            .execute(&mut *tx)
            .await?;

            let repository = Self::reread_repository(&mut tx, &row.repository_id, "upsert").await?;
            tx.commit().await?;
            return Ok(repository);
        }

        let id = params.id.unwrap_or_else(|| prefixed_id("repository"));
        let metadata = params
            .metadata
            .unwrap_or_else(|| serde_json::json!({}))
            .to_string();

        sqlx::query(
            r"
            INSERT INTO repositories (
                repository_id, tenant_id, user_id, workspace_id,
                name, remote_url, default_branch, metadata, created_at, archived_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, NULL)
            ",
        )
        .bind(&id)
        .bind(&params.scope.tenant_id)
        .bind(&params.scope.user_id)
        .bind(&params.scope.workspace_id)
        .bind(&params.name)
        .bind(&params.remote_url)
        .bind(
            params
                .default_branch
                .as_deref()
                .unwrap_or(Repository::DEFAULT_BRANCH),
        )
        .bind(metadata)
        .bind(now.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        let repository = Self::reread_repository(&mut tx, &id, "upsert").await?;
        tx.commit().await?;
        Ok(repository)
    }

    /// Fetch a repository by id within a scope.
    ///
    /// # Errors
    ///
    /// Fails only on storage errors; an absent row returns `Ok(None)`.
    pub async fn get_repository(
        &self,
        scope: &Scope,
        repository_id: &str,
    ) -> ControlResult<Option<Repository>> {
        let row = sqlx::query_as::<_, RepositoryRow>(
            r"
            SELECT * FROM repositories
            WHERE repository_id = ? AND tenant_id = ? AND user_id = ? AND workspace_id = ?
            ",
        )
        .bind(repository_id)
        .bind(&scope.tenant_id)
        .bind(&scope.user_id)
        .bind(&scope.workspace_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TryInto::try_into).transpose()
    }

    /// Fetch a repository by id, failing with `repository not found` when
    /// absent.
    ///
    /// # Errors
    ///
    /// Fails when the repository does not exist in this scope.
    pub async fn require_repository(
        &self,
        scope: &Scope,
        repository_id: &str,
    ) -> ControlResult<Repository> {
        self.get_repository(scope, repository_id)
            .await?
            .ok_or_else(|| ControlError::not_found("repository"))
    }

    /// Find the non-archived repository tracking a remote URL.
    ///
    /// # Errors
    ///
    /// Fails only on storage errors.
    pub async fn find_repository_by_remote_url(
        &self,
        scope: &Scope,
        remote_url: &str,
    ) -> ControlResult<Option<Repository>> {
        let row = sqlx::query_as::<_, RepositoryRow>(
            r"
            SELECT * FROM repositories
            WHERE tenant_id = ? AND user_id = ? AND workspace_id = ?
              AND remote_url = ? AND archived_at IS NULL
            ",
        )
        .bind(&scope.tenant_id)
        .bind(&scope.user_id)
        .bind(&scope.workspace_id)
        .bind(remote_url)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TryInto::try_into).transpose()
    }

    /// List repositories in a scope ordered by creation time.
    ///
    /// # Errors
    ///
    /// Fails only on storage errors.
    pub async fn list_repositories(
        &self,
        scope: &Scope,
        include_archived: bool,
    ) -> ControlResult<Vec<Repository>> {
        let sql = if include_archived {
            r"
            SELECT * FROM repositories
            WHERE tenant_id = ? AND user_id = ? AND workspace_id = ?
            ORDER BY created_at ASC, repository_id ASC
            "
        } else {
            r"
            SELECT * FROM repositories
            WHERE tenant_id = ? AND user_id = ? AND workspace_id = ? AND archived_at IS NULL
            ORDER BY created_at ASC, repository_id ASC
            "
        };

        let rows = sqlx::query_as::<_, RepositoryRow>(sql)
            .bind(&scope.tenant_id)
            .bind(&scope.user_id)
            .bind(&scope.workspace_id)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    /// Update mutable repository fields.
    ///
    /// # Errors
    ///
    /// Fails when the repository does not exist in this scope.
    #[instrument(skip(self, params))]
    pub async fn update_repository(
        &self,
        scope: &Scope,
        repository_id: &str,
        params: UpdateRepositoryParams,
    ) -> ControlResult<Repository> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, RepositoryRow>(
            r"
            SELECT * FROM repositories
            WHERE repository_id = ? AND tenant_id = ? AND user_id = ? AND workspace_id = ?
            ",
        )
        .bind(repository_id)
        .bind(&scope.tenant_id)
        .bind(&scope.user_id)
        .bind(&scope.workspace_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| ControlError::not_found("repository"))?;

        if let Some(ref name) = params.name {
            if name.trim().is_empty() {
                return Err(ControlError::validation("expected non-empty name"));
            }
        }

        sqlx::query(
            r"
            UPDATE repositories SET name = ?, default_branch = ?, metadata = ?
            WHERE repository_id = ?
            ",
        )
        .bind(params.name.as_deref().unwrap_or(&row.name))
        .bind(
            params
                .default_branch
                .as_deref()
                .unwrap_or(&row.default_branch),
        )
        .bind(
            params
                .metadata
                .as_ref()
                .map_or_else(|| row.metadata.clone(), serde_json::Value::to_string),
        )
        .bind(repository_id)
        .execute(&mut *tx)
        .await?;

        let repository = Self::reread_repository(&mut tx, repository_id, "update").await?;
        tx.commit().await?;
        Ok(repository)
    }

    /// Archive a repository.
    ///
    /// # Errors
    ///
    /// Fails when the repository does not exist in this scope.
    #[instrument(skip(self))]
    pub async fn archive_repository(
        &self,
        scope: &Scope,
        repository_id: &str,
    ) -> ControlResult<Repository> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r"
            UPDATE repositories SET archived_at = ?
            WHERE repository_id = ? AND tenant_id = ? AND user_id = ? AND workspace_id = ?
            ",
        )
        .bind(chrono::Utc::now().to_rfc3339())
        .bind(repository_id)
        .bind(&scope.tenant_id)
        .bind(&scope.user_id)
        .bind(&scope.workspace_id)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(ControlError::not_found("repository"));
        }

        let repository = Self::reread_repository(&mut tx, repository_id, "archive").await?;
        tx.commit().await?;
        Ok(repository)
    }

    async fn reread_repository(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        repository_id: &str,
        op: &'static str,
    ) -> ControlResult<Repository> {
        let row =
            sqlx::query_as::<_, RepositoryRow>("SELECT * FROM repositories WHERE repository_id = ?")
                .bind(repository_id)
                .fetch_optional(&mut **tx)
                .await?;

        row.ok_or_else(|| ControlError::missing_after("repository", op))?
            .try_into()
    }
}

#[derive(sqlx::FromRow)]
struct RepositoryRow {
    repository_id: String,
    tenant_id: String,
    user_id: String,
    workspace_id: String,
    name: String,
    remote_url: String,
    default_branch: String,
    metadata: String,
    created_at: String,
    archived_at: Option<String>,
}

impl TryFrom<RepositoryRow> for Repository {
    type Error = ControlError;

    fn try_from(row: RepositoryRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.repository_id,
            scope: Scope::new(row.tenant_id, row.user_id, row.workspace_id),
            name: row.name,
            remote_url: row.remote_url,
            default_branch: row.default_branch,
            metadata: lenient_json_object(Some(&row.metadata)),
            created_at: parse_ts(&row.created_at, "repository created_at")?,
            archived_at: parse_opt_ts(row.archived_at.as_deref(), "repository archived_at")?,
        })
    }
}
