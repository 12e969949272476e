use tracing::instrument;

use crate::core::{ControlError, ControlResult, Directory, Scope};
use crate::utils::ids::prefixed_id;

use super::{SqliteStore, parse_opt_ts, parse_ts};

/// Parameters for [`SqliteStore::upsert_directory`].
#[derive(Debug, Clone)]
pub struct UpsertDirectoryParams {
    /// Existing id to upsert, or `None` to resolve by (scope, path).
    pub id: Option<String>,

    /// Scope triple of the caller.
    pub scope: Scope,

    /// Filesystem path.
    pub path: String,
}

impl SqliteStore {
    /// Create or update a directory.
    ///
    /// Upsert by id enforces scope stability; upsert by path returns the
    /// existing non-archived row for (scope, path) when there is one.
    ///
    /// # Errors
    ///
    /// Fails on scope mismatch, on a path conflict with a different
    /// non-archived row, or when the written row cannot be reread.
    #[instrument(skip(self, params), fields(path = %params.path))]
    pub async fn upsert_directory(
        &self,
        params: UpsertDirectoryParams,
    ) -> ControlResult<Directory> {
        if params.path.trim().is_empty() {
            return Err(ControlError::validation("expected non-empty path"));
        }

        let mut tx = self.pool.begin().await?;

        if let Some(ref id) = params.id {
            let existing = sqlx::query_as::<_, DirectoryRow>(
                "SELECT * FROM directories WHERE directory_id = ?",
            )
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;

            if let Some(row) = existing {
                if row.tenant_id != params.scope.tenant_id
                    || row.user_id != params.scope.user_id
                    || row.workspace_id != params.scope.workspace_id
                {
                    return Err(ControlError::scope_mismatch("directory"));
                }

                sqlx::query("UPDATE directories SET path = ? WHERE directory_id = ?")
                    .bind(&params.path)
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;

                let directory = Self::reread_directory(&mut tx, id, "upsert").await?;
                tx.commit().await?;
                return Ok(directory);
            }
        }

        // Resolve by (scope, path) among non-archived rows.
        let by_path = sqlx::query_as::<_, DirectoryRow>(
            r"
            SELECT * FROM directories
            WHERE tenant_id = ? AND user_id = ? AND workspace_id = ?
              AND path = ? AND archived_at IS NULL
            ",
        )
        .bind(&params.scope.tenant_id)
        .bind(&params.scope.user_id)
        .bind(&params.scope.workspace_id)
        .bind(&params.path)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(row) = by_path {
            match params.id {
                Some(ref requested) if *requested != row.directory_id => {
                    return Err(ControlError::conflict("directory already exists"));
                }
                _ => {
                    let directory = row.try_into()?;
                    tx.commit().await?;
                    return Ok(directory);
                }
            }
        }

        let id = params.id.unwrap_or_else(|| prefixed_id("directory"));
        let now = chrono::Utc::now();

        sqlx::query(
            r"
            INSERT INTO directories (
                directory_id, tenant_id, user_id, workspace_id, path, created_at, archived_at
            ) VALUES (?, ?, ?, ?, ?, ?, NULL)
            ",
        )
        .bind(&id)
        .bind(&params.scope.tenant_id)
        .bind(&params.scope.user_id)
        .bind(&params.scope.workspace_id)
        .bind(&params.path)
        .bind(now.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        let directory = Self::reread_directory(&mut tx, &id, "upsert").await?;
        tx.commit().await?;
        Ok(directory)
    }

    /// Fetch a directory by id within a scope.
    ///
    /// # Errors
    ///
    /// Fails only on storage errors; an absent row returns `Ok(None)`.
    pub async fn get_directory(
        &self,
        scope: &Scope,
        directory_id: &str,
    ) -> ControlResult<Option<Directory>> {
        let row = sqlx::query_as::<_, DirectoryRow>(
            r"
            SELECT * FROM directories
            WHERE directory_id = ? AND tenant_id = ? AND user_id = ? AND workspace_id = ?
            ",
        )
        .bind(directory_id)
        .bind(&scope.tenant_id)
        .bind(&scope.user_id)
        .bind(&scope.workspace_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TryInto::try_into).transpose()
    }

    /// Fetch a directory by id, failing with `directory not found` when it
    /// is absent.
    ///
    /// # Errors
    ///
    /// Fails when the directory does not exist in this scope.
    pub async fn require_directory(
        &self,
        scope: &Scope,
        directory_id: &str,
    ) -> ControlResult<Directory> {
        self.get_directory(scope, directory_id)
            .await?
            .ok_or_else(|| ControlError::not_found("directory"))
    }

    /// List directories in a scope ordered by creation time.
    ///
    /// # Errors
    ///
    /// Fails only on storage errors.
    pub async fn list_directories(
        &self,
        scope: &Scope,
        include_archived: bool,
    ) -> ControlResult<Vec<Directory>> {
        let sql = if include_archived {
            r"
            SELECT * FROM directories
            WHERE tenant_id = ? AND user_id = ? AND workspace_id = ?
            ORDER BY created_at ASC, directory_id ASC
            "
        } else {
            r"
            SELECT * FROM directories
            WHERE tenant_id = ? AND user_id = ? AND workspace_id = ? AND archived_at IS NULL
            ORDER BY created_at ASC, directory_id ASC
            "
        };

        let rows = sqlx::query_as::<_, DirectoryRow>(sql)
            .bind(&scope.tenant_id)
            .bind(&scope.user_id)
            .bind(&scope.workspace_id)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    /// List active directories across every scope, for the background
    /// reconciliation loops.
    ///
    /// # Errors
    ///
    /// Fails only on storage errors.
    pub async fn list_all_active_directories(&self) -> ControlResult<Vec<Directory>> {
        let rows = sqlx::query_as::<_, DirectoryRow>(
            r"
            SELECT * FROM directories
            WHERE archived_at IS NULL
            ORDER BY created_at ASC, directory_id ASC
            ",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    /// Archive a directory.
    ///
    /// # Errors
    ///
    /// Fails when the directory does not exist in this scope.
    #[instrument(skip(self))]
    pub async fn archive_directory(
        &self,
        scope: &Scope,
        directory_id: &str,
    ) -> ControlResult<Directory> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r"
            UPDATE directories SET archived_at = ?
            WHERE directory_id = ? AND tenant_id = ? AND user_id = ? AND workspace_id = ?
            ",
        )
        .bind(chrono::Utc::now().to_rfc3339())
        .bind(directory_id)
        .bind(&scope.tenant_id)
        .bind(&scope.user_id)
        .bind(&scope.workspace_id)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(ControlError::not_found("directory"));
        }

        let directory = Self::reread_directory(&mut tx, directory_id, "archive").await?;
        tx.commit().await?;
        Ok(directory)
    }

    async fn reread_directory(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        directory_id: &str,
        op: &'static str,
    ) -> ControlResult<Directory> {
        let row =
            sqlx::query_as::<_, DirectoryRow>("SELECT * FROM directories WHERE directory_id = ?")
                .bind(directory_id)
                .fetch_optional(&mut **tx)
                .await?;

        row.ok_or_else(|| ControlError::missing_after("directory", op))?
            .try_into()
    }
}

#[derive(sqlx::FromRow)]
struct DirectoryRow {
    directory_id: String,
    tenant_id: String,
    user_id: String,
    workspace_id: String,
    path: String,
    created_at: String,
    archived_at: Option<String>,
}

impl TryFrom<DirectoryRow> for Directory {
    type Error = ControlError;

    fn try_from(row: DirectoryRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.directory_id,
            scope: Scope::new(row.tenant_id, row.user_id, row.workspace_id),
            path: row.path,
            created_at: parse_ts(&row.created_at, "directory created_at")?,
            archived_at: parse_opt_ts(row.archived_at.as_deref(), "directory archived_at")?,
        })
    }
}
