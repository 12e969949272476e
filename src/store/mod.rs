//! Transactional persistence for all durable records.
//!
//! The store is the sole writer of durable state. Every multi-statement
//! mutation runs inside a transaction that either commits or rolls back;
//! handlers never observe partial writes. Scope checks, uniqueness rules,
//! and the task state machine are enforced here.

mod conversations;
mod directories;
mod github;
mod repositories;
mod settings;
mod tasks;
mod telemetry;

pub use conversations::CreateConversationParams;
pub use directories::UpsertDirectoryParams;
pub use github::{NewPrJob, UpsertPullRequestParams};
pub use repositories::{UpdateRepositoryParams, UpsertRepositoryParams};
pub use settings::UpdateProjectSettingsParams;
pub use tasks::{ClaimTaskParams, CreateTaskParams, UpdateTaskParams};

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};

use crate::core::{ControlError, ControlResult};

/// Schema version this binary reads and writes.
const SCHEMA_VERSION: i64 = 1;

/// SQLite-backed store for the control plane.
#[derive(Debug)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if missing) the database at the given path and run
    /// migrations.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened, the on-disk
    /// schema version is newer than this binary supports, or migrations
    /// fail.
    pub async fn open(db_path: &Path) -> ControlResult<Self> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ControlError::internal(format!("create database dir: {e}")))?;
        }

        let options = SqliteConnectOptions::from_str(&format!(
            "sqlite:{display}",
            display = db_path.display()
        ))
        .map_err(|e| ControlError::internal(format!("database url: {e}")))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        Self::run_migrations(&pool).await?;

        Ok(Self { pool })
    }

    /// Open an in-memory database, for tests.
    ///
    /// # Errors
    ///
    /// Returns an error if migrations fail.
    pub async fn open_in_memory() -> ControlResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| ControlError::internal(format!("database url: {e}")))?;

        // A single connection keeps the in-memory database alive and shared.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        Self::run_migrations(&pool).await?;

        Ok(Self { pool })
    }

    /// Clone of the underlying pool.
    #[must_use]
    pub fn pool(&self) -> SqlitePool {
        self.pool.clone()
    }

    async fn run_migrations(pool: &SqlitePool) -> ControlResult<()> {
        let on_disk: i64 = sqlx::query_scalar("PRAGMA user_version")
            .fetch_one(pool)
            .await?;

        if on_disk > SCHEMA_VERSION {
            return Err(ControlError::internal(format!(
                "database schema version {on_disk} is newer than supported {SCHEMA_VERSION}"
            )));
        }

        if on_disk < 1 {
            Self::migrate_to_v1(pool).await?;
        }

        // Legacy value rewrites are idempotent and run on every open.
        Self::apply_legacy_backfills(pool).await?;

        Ok(())
    }

    /// Migration v1: full schema.
    async fn migrate_to_v1(pool: &SqlitePool) -> ControlResult<()> {
        tracing::info!("Applying migration v1: initial schema");

        let mut tx = pool.begin().await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS directories (
                directory_id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                workspace_id TEXT NOT NULL,
                path TEXT NOT NULL,
                created_at TEXT NOT NULL,
                archived_at TEXT
            )
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
            CREATE INDEX IF NOT EXISTS idx_directories_scope_created
            ON directories(tenant_id, user_id, workspace_id, created_at)
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS conversations (
                conversation_id TEXT PRIMARY KEY,
                directory_id TEXT NOT NULL,
                tenant_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                workspace_id TEXT NOT NULL,
                title TEXT NOT NULL,
                agent_kind TEXT NOT NULL,
                created_at TEXT NOT NULL,
                archived_at TEXT,
                runtime_status TEXT NOT NULL DEFAULT 'exited',
                live INTEGER NOT NULL DEFAULT 0,
                attention_reason TEXT,
                process_id INTEGER,
                last_event_at TEXT,
                last_exit_code INTEGER,
                last_exit_signal TEXT,
                adapter_state TEXT NOT NULL DEFAULT '{}'
            )
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
            CREATE INDEX IF NOT EXISTS idx_conversations_scope_created
            ON conversations(tenant_id, user_id, workspace_id, created_at)
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
            CREATE INDEX IF NOT EXISTS idx_conversations_directory
            ON conversations(directory_id)
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS session_telemetry (
                telemetry_id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                workspace_id TEXT NOT NULL,
                conversation_id TEXT NOT NULL,
                source TEXT NOT NULL,
                kind TEXT NOT NULL,
                payload TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL
            )
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
            CREATE INDEX IF NOT EXISTS idx_session_telemetry_conversation
            ON session_telemetry(conversation_id, created_at)
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS repositories (
                repository_id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                workspace_id TEXT NOT NULL,
                name TEXT NOT NULL,
                remote_url TEXT NOT NULL,
                default_branch TEXT NOT NULL DEFAULT 'main',
                metadata TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                archived_at TEXT
            )
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
            CREATE INDEX IF NOT EXISTS idx_repositories_scope_created
            ON repositories(tenant_id, user_id, workspace_id, created_at)
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS tasks (
                task_id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                workspace_id TEXT NOT NULL,
                repository_id TEXT,
                project_id TEXT,
                scope_kind TEXT,
                title TEXT NOT NULL,
                body TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL DEFAULT 'draft',
                order_index INTEGER NOT NULL DEFAULT 0,
                claimed_by_controller_id TEXT,
                claimed_by_directory_id TEXT,
                branch_name TEXT,
                base_branch TEXT,
                claimed_at TEXT,
                completed_at TEXT,
                linear_json TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
            CREATE INDEX IF NOT EXISTS idx_tasks_status_updated
            ON tasks(status, updated_at, task_id)
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
            CREATE INDEX IF NOT EXISTS idx_tasks_scope_created
            ON tasks(tenant_id, user_id, workspace_id, created_at)
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS project_settings (
                directory_id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                workspace_id TEXT NOT NULL,
                pinned_branch TEXT,
                task_focus_mode TEXT NOT NULL DEFAULT 'balanced',
                thread_spawn_mode TEXT NOT NULL DEFAULT 'new-thread',
                updated_at TEXT NOT NULL
            )
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS automation_policies (
                policy_id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                workspace_id TEXT NOT NULL,
                scope_level TEXT NOT NULL,
                scope_ref TEXT NOT NULL DEFAULT '',
                automation_enabled INTEGER NOT NULL DEFAULT 1,
                frozen INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL,
                UNIQUE (tenant_id, user_id, workspace_id, scope_level, scope_ref)
            )
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS github_pull_requests (
                pr_record_id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                workspace_id TEXT NOT NULL,
                repository_id TEXT NOT NULL,
                directory_id TEXT,
                number INTEGER NOT NULL,
                title TEXT NOT NULL,
                url TEXT NOT NULL,
                author TEXT,
                head_branch TEXT NOT NULL,
                base_branch TEXT NOT NULL,
                head_sha TEXT NOT NULL,
                state TEXT NOT NULL DEFAULT 'open',
                draft INTEGER NOT NULL DEFAULT 0,
                ci_rollup TEXT NOT NULL DEFAULT 'none',
                observed_at TEXT NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE (repository_id, number)
            )
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
            CREATE INDEX IF NOT EXISTS idx_github_prs_branch
            ON github_pull_requests(tenant_id, repository_id, head_branch, observed_at)
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS github_pr_jobs (
                job_id TEXT PRIMARY KEY,
                pr_record_id TEXT NOT NULL,
                provider TEXT NOT NULL,
                external_id TEXT NOT NULL,
                name TEXT NOT NULL,
                status TEXT NOT NULL,
                conclusion TEXT,
                url TEXT,
                started_at TEXT,
                completed_at TEXT,
                UNIQUE (pr_record_id, provider, external_id)
            )
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS github_sync_state (
                tenant_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                workspace_id TEXT NOT NULL,
                repository_id TEXT NOT NULL,
                directory_id TEXT NOT NULL DEFAULT '',
                branch TEXT NOT NULL,
                last_sync_at TEXT,
                last_success_at TEXT,
                last_error TEXT,
                last_error_at TEXT,
                PRIMARY KEY (tenant_id, user_id, workspace_id, repository_id, directory_id, branch)
            )
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(&format!("PRAGMA user_version = {SCHEMA_VERSION}"))
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        tracing::info!("Migration v1 complete");
        Ok(())
    }

    /// Idempotent column additions and value rewrites for databases
    /// written by earlier builds.
    async fn apply_legacy_backfills(pool: &SqlitePool) -> ControlResult<()> {
        let mut tx = pool.begin().await?;

        for column in ["scope_kind", "project_id", "body"] {
            let exists: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM pragma_table_info('tasks') WHERE name = ?",
            )
            .bind(column)
            .fetch_one(&mut *tx)
            .await?;

            if exists == 0 {
                tracing::info!(column, "Adding missing tasks column");
                let ddl = match column {
                    "body" => "ALTER TABLE tasks ADD COLUMN body TEXT NOT NULL DEFAULT ''",
                    "scope_kind" => "ALTER TABLE tasks ADD COLUMN scope_kind TEXT",
                    _ => "ALTER TABLE tasks ADD COLUMN project_id TEXT",
                };
                sqlx::query(ddl).execute(&mut *tx).await?;
            }
        }

        // Rows persisted before the rename read back as ready.
        sqlx::query("UPDATE tasks SET status = 'ready' WHERE status = 'queued'")
            .execute(&mut *tx)
            .await?;

        // Recompute scope_kind where it is missing or unrecognized.
        sqlx::query(
            r"
            UPDATE tasks SET scope_kind =
                CASE
                    WHEN project_id IS NOT NULL THEN 'project'
                    WHEN repository_id IS NOT NULL THEN 'repository'
                    ELSE 'global'
                END
            WHERE scope_kind IS NULL
               OR scope_kind NOT IN ('global', 'repository', 'project')
            ",
        )
        .execute(&mut *tx)
        .await?;

        // Copy legacy description text into body where body is still empty.
        let has_description: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM pragma_table_info('tasks') WHERE name = 'description'",
        )
        .fetch_one(&mut *tx)
        .await?;
        if has_description > 0 {
            sqlx::query(
                "UPDATE tasks SET body = COALESCE(description, '') WHERE body = ''",
            )
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

/// Parse a required RFC 3339 timestamp column.
pub(crate) fn parse_ts(value: &str, context: &str) -> ControlResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(Into::into)
        .map_err(|e| ControlError::integrity(format!("invalid {context} timestamp '{value}': {e}")))
}

/// Parse an optional RFC 3339 timestamp column.
pub(crate) fn parse_opt_ts(
    value: Option<&str>,
    context: &str,
) -> ControlResult<Option<DateTime<Utc>>> {
    value.map(|v| parse_ts(v, context)).transpose()
}

/// Read a stored JSON object leniently: parse failures and non-object
/// values degrade to an empty object.
pub(crate) fn lenient_json_object(raw: Option<&str>) -> serde_json::Value {
    match raw {
        Some(text) => match serde_json::from_str::<serde_json::Value>(text) {
            Ok(value) if value.is_object() => value,
            _ => serde_json::json!({}),
        },
        None => serde_json::json!({}),
    }
}
