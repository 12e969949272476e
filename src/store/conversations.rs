use tracing::instrument;

use crate::core::{
    AgentKind, ControlError, ControlResult, Conversation, ExitStatus, RuntimeProjection,
    RuntimeStatus, Scope,
};
use crate::utils::ids::prefixed_id;

use super::{SqliteStore, lenient_json_object, parse_opt_ts, parse_ts};

/// Parameters for [`SqliteStore::create_conversation`].
#[derive(Debug, Clone)]
pub struct CreateConversationParams {
    /// Explicit id, or `None` to generate one.
    pub id: Option<String>,

    /// Scope triple of the caller; must match the directory.
    pub scope: Scope,

    /// Owning directory; must be non-archived.
    pub directory_id: String,

    /// Display title.
    pub title: String,

    /// Driving agent.
    pub agent: AgentKind,
}

impl SqliteStore {
    /// Create a conversation under a non-archived directory.
    ///
    /// # Errors
    ///
    /// Fails when the directory is missing or archived, on scope
    /// mismatch, or when the id is already taken.
    #[instrument(skip(self, params), fields(directory_id = %params.directory_id))]
    pub async fn create_conversation(
        &self,
        params: CreateConversationParams,
    ) -> ControlResult<Conversation> {
        if params.title.trim().is_empty() {
            return Err(ControlError::validation("expected non-empty title"));
        }

        let mut tx = self.pool.begin().await?;

        let directory = sqlx::query_as::<_, DirScopeRow>(
            r"
            SELECT tenant_id, user_id, workspace_id, archived_at
            FROM directories WHERE directory_id = ?
            ",
        )
        .bind(&params.directory_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| ControlError::not_found("directory"))?;

        if directory.archived_at.is_some() {
            return Err(ControlError::not_found("directory"));
        }
        if directory.tenant_id != params.scope.tenant_id
            || directory.user_id != params.scope.user_id
            || directory.workspace_id != params.scope.workspace_id
        {
            return Err(ControlError::scope_mismatch("conversation directory"));
        }

        let id = params.id.unwrap_or_else(|| prefixed_id("conversation"));

        let taken: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM conversations WHERE conversation_id = ?")
                .bind(&id)
                .fetch_one(&mut *tx)
                .await?;
        if taken > 0 {
            return Err(ControlError::conflict("conversation already exists"));
        }

        let now = chrono::Utc::now();
        sqlx::query(
            r"
            INSERT INTO conversations (
                conversation_id, directory_id, tenant_id, user_id, workspace_id,
                title, agent_kind, created_at, archived_at,
                runtime_status, live, adapter_state
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, NULL, 'exited', 0, '{}')
            ",
        )
        .bind(&id)
        .bind(&params.directory_id)
        .bind(&params.scope.tenant_id)
        .bind(&params.scope.user_id)
        .bind(&params.scope.workspace_id)
        .bind(&params.title)
        .bind(params.agent.as_str())
        .bind(now.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        let conversation = Self::reread_conversation(&mut tx, &id, "create").await?;
        tx.commit().await?;
        Ok(conversation)
    }

    /// Fetch a conversation by id within a scope.
    ///
    /// # Errors
    ///
    /// Fails only on storage errors; an absent row returns `Ok(None)`.
    pub async fn get_conversation(
        &self,
        scope: &Scope,
        conversation_id: &str,
    ) -> ControlResult<Option<Conversation>> {
        let row = sqlx::query_as::<_, ConversationRow>(
            r"
            SELECT * FROM conversations
            WHERE conversation_id = ? AND tenant_id = ? AND user_id = ? AND workspace_id = ?
            ",
        )
        .bind(conversation_id)
        .bind(&scope.tenant_id)
        .bind(&scope.user_id)
        .bind(&scope.workspace_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TryInto::try_into).transpose()
    }

    /// Fetch a conversation by id, failing with `conversation not found`
    /// when absent.
    ///
    /// # Errors
    ///
    /// Fails when the conversation does not exist in this scope.
    pub async fn require_conversation(
        &self,
        scope: &Scope,
        conversation_id: &str,
    ) -> ControlResult<Conversation> {
        self.get_conversation(scope, conversation_id)
            .await?
            .ok_or_else(|| ControlError::not_found("conversation"))
    }

    /// List conversations, optionally filtered to a directory.
    ///
    /// # Errors
    ///
    /// Fails only on storage errors.
    pub async fn list_conversations(
        &self,
        scope: &Scope,
        directory_id: Option<&str>,
        include_archived: bool,
    ) -> ControlResult<Vec<Conversation>> {
        let mut sql = String::from(
            "SELECT * FROM conversations WHERE tenant_id = ? AND user_id = ? AND workspace_id = ?",
        );
        if directory_id.is_some() {
            sql.push_str(" AND directory_id = ?");
        }
        if !include_archived {
            sql.push_str(" AND archived_at IS NULL");
        }
        sql.push_str(" ORDER BY created_at ASC, conversation_id ASC");

        let mut query = sqlx::query_as::<_, ConversationRow>(&sql)
            .bind(&scope.tenant_id)
            .bind(&scope.user_id)
            .bind(&scope.workspace_id);
        if let Some(dir) = directory_id {
            query = query.bind(dir);
        }

        let rows = query.fetch_all(&self.pool).await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    /// Update a conversation's title.
    ///
    /// # Errors
    ///
    /// Fails when the conversation does not exist in this scope.
    #[instrument(skip(self, title))]
    pub async fn update_conversation_title(
        &self,
        scope: &Scope,
        conversation_id: &str,
        title: &str,
    ) -> ControlResult<Conversation> {
        if title.trim().is_empty() {
            return Err(ControlError::validation("expected non-empty title"));
        }

        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r"
            UPDATE conversations SET title = ?
            WHERE conversation_id = ? AND tenant_id = ? AND user_id = ? AND workspace_id = ?
            ",
        )
        .bind(title)
        .bind(conversation_id)
        .bind(&scope.tenant_id)
        .bind(&scope.user_id)
        .bind(&scope.workspace_id)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(ControlError::not_found("conversation"));
        }

        let conversation = Self::reread_conversation(&mut tx, conversation_id, "update").await?;
        tx.commit().await?;
        Ok(conversation)
    }

    /// Replace a conversation's runtime projection.
    ///
    /// # Errors
    ///
    /// Fails when the conversation does not exist.
    pub async fn update_conversation_runtime(
        &self,
        conversation_id: &str,
        runtime: &RuntimeProjection,
    ) -> ControlResult<Conversation> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r"
            UPDATE conversations SET
                runtime_status = ?, live = ?, attention_reason = ?,
                process_id = ?, last_event_at = ?, last_exit_code = ?, last_exit_signal = ?
            WHERE conversation_id = ?
            ",
        )
        .bind(runtime.status.as_str())
        .bind(i64::from(runtime.live))
        .bind(&runtime.attention_reason)
        .bind(runtime.process_id.map(i64::from))
        .bind(runtime.last_event_at.map(|t| t.to_rfc3339()))
        .bind(runtime.last_exit.as_ref().and_then(|e| e.code))
        .bind(runtime.last_exit.as_ref().and_then(|e| e.signal.clone()))
        .bind(conversation_id)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(ControlError::not_found("conversation"));
        }

        let conversation = Self::reread_conversation(&mut tx, conversation_id, "update").await?;
        tx.commit().await?;
        Ok(conversation)
    }

    /// Replace a conversation's opaque adapter state.
    ///
    /// # Errors
    ///
    /// Fails when the conversation does not exist in this scope.
    pub async fn update_conversation_adapter_state(
        &self,
        scope: &Scope,
        conversation_id: &str,
        adapter_state: &serde_json::Value,
    ) -> ControlResult<Conversation> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r"
            UPDATE conversations SET adapter_state = ?
            WHERE conversation_id = ? AND tenant_id = ? AND user_id = ? AND workspace_id = ?
            ",
        )
        .bind(adapter_state.to_string())
        .bind(conversation_id)
        .bind(&scope.tenant_id)
        .bind(&scope.user_id)
        .bind(&scope.workspace_id)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(ControlError::not_found("conversation"));
        }

        let conversation = Self::reread_conversation(&mut tx, conversation_id, "update").await?;
        tx.commit().await?;
        Ok(conversation)
    }

    /// Archive a conversation.
    ///
    /// # Errors
    ///
    /// Fails when the conversation does not exist in this scope.
    #[instrument(skip(self))]
    pub async fn archive_conversation(
        &self,
        scope: &Scope,
        conversation_id: &str,
    ) -> ControlResult<Conversation> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r"
            UPDATE conversations SET archived_at = ?
            WHERE conversation_id = ? AND tenant_id = ? AND user_id = ? AND workspace_id = ?
            ",
        )
        .bind(chrono::Utc::now().to_rfc3339())
        .bind(conversation_id)
        .bind(&scope.tenant_id)
        .bind(&scope.user_id)
        .bind(&scope.workspace_id)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(ControlError::not_found("conversation"));
        }

        let conversation = Self::reread_conversation(&mut tx, conversation_id, "archive").await?;
        tx.commit().await?;
        Ok(conversation)
    }

    /// Delete a conversation row.
    ///
    /// # Errors
    ///
    /// Fails when the conversation does not exist in this scope.
    #[instrument(skip(self))]
    pub async fn delete_conversation(
        &self,
        scope: &Scope,
        conversation_id: &str,
    ) -> ControlResult<()> {
        let deleted = sqlx::query(
            r"
            DELETE FROM conversations
            WHERE conversation_id = ? AND tenant_id = ? AND user_id = ? AND workspace_id = ?
            ",
        )
        .bind(conversation_id)
        .bind(&scope.tenant_id)
        .bind(&scope.user_id)
        .bind(&scope.workspace_id)
        .execute(&self.pool)
        .await?;

        if deleted.rows_affected() == 0 {
            return Err(ControlError::not_found("conversation"));
        }
        Ok(())
    }

    async fn reread_conversation(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        conversation_id: &str,
        op: &'static str,
    ) -> ControlResult<Conversation> {
        let row = sqlx::query_as::<_, ConversationRow>(
            "SELECT * FROM conversations WHERE conversation_id = ?",
        )
        .bind(conversation_id)
        .fetch_optional(&mut **tx)
        .await?;

        row.ok_or_else(|| ControlError::missing_after("conversation", op))?
            .try_into()
    }
}

#[derive(sqlx::FromRow)]
struct DirScopeRow {
    tenant_id: String,
    user_id: String,
    workspace_id: String,
    archived_at: Option<String>,
}

#[derive(sqlx::FromRow)]
struct ConversationRow {
    conversation_id: String,
    directory_id: String,
    tenant_id: String,
    user_id: String,
    workspace_id: String,
    title: String,
    agent_kind: String,
    created_at: String,
    archived_at: Option<String>,
    runtime_status: String,
    live: i64,
    attention_reason: Option<String>,
    process_id: Option<i64>,
    last_event_at: Option<String>,
    last_exit_code: Option<i64>,
    last_exit_signal: Option<String>,
    adapter_state: Option<String>,
}

impl TryFrom<ConversationRow> for Conversation {
    type Error = ControlError;

    fn try_from(row: ConversationRow) -> Result<Self, Self::Error> {
        let last_exit = if row.last_exit_code.is_some() || row.last_exit_signal.is_some() {
            Some(ExitStatus {
                code: row.last_exit_code.map(|c| c as i32),
                signal: row.last_exit_signal,
            })
        } else {
            None
        };

        Ok(Self {
            id: row.conversation_id,
            directory_id: row.directory_id,
            scope: Scope::new(row.tenant_id, row.user_id, row.workspace_id),
            title: row.title,
            agent: row.agent_kind.parse()?,
            created_at: parse_ts(&row.created_at, "conversation created_at")?,
            archived_at: parse_opt_ts(row.archived_at.as_deref(), "conversation archived_at")?,
            runtime: RuntimeProjection {
                status: row.runtime_status.parse::<RuntimeStatus>()?,
                live: row.live != 0,
                attention_reason: row.attention_reason,
                process_id: row.process_id.and_then(|p| u32::try_from(p).ok()),
                last_event_at: parse_opt_ts(
                    row.last_event_at.as_deref(),
                    "conversation last_event_at",
                )?,
                last_exit,
            },
            adapter_state: lenient_json_object(row.adapter_state.as_deref()),
        })
    }
}
