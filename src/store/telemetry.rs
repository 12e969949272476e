use chrono::Utc;
use tracing::instrument;

use crate::core::{ControlError, ControlResult, Scope, TelemetryRecord, TelemetrySource};
use crate::utils::ids::prefixed_id;

use super::{SqliteStore, lenient_json_object, parse_ts};

impl SqliteStore {
    /// Record a telemetry datum for a conversation.
    ///
    /// # Errors
    ///
    /// Fails when the conversation does not exist in this scope.
    #[instrument(skip(self, payload), fields(conversation_id = %conversation_id, kind = %kind))]
    pub async fn record_telemetry(
        &self,
        scope: &Scope,
        conversation_id: &str,
        source: TelemetrySource,
        kind: &str,
        payload: serde_json::Value,
    ) -> ControlResult<TelemetryRecord> {
        if kind.trim().is_empty() {
            return Err(ControlError::validation("expected non-empty kind"));
        }

        let mut tx = self.pool.begin().await?;

        let exists: i64 = sqlx::query_scalar(
            r"
            SELECT COUNT(*) FROM conversations
            WHERE conversation_id = ? AND tenant_id = ? AND user_id = ? AND workspace_id = ?
            ",
        )
        .bind(conversation_id)
        .bind(&scope.tenant_id)
        .bind(&scope.user_id)
        .bind(&scope.workspace_id)
        .fetch_one(&mut *tx)
        .await?;
        if exists == 0 {
            return Err(ControlError::not_found("conversation"));
        }

        let id = prefixed_id("telemetry");
        let now = Utc::now();

        sqlx::query(
            r"
            INSERT INTO session_telemetry (
                telemetry_id, tenant_id, user_id, workspace_id,
                conversation_id, source, kind, payload, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(&id)
        .bind(&scope.tenant_id)
        .bind(&scope.user_id)
        .bind(&scope.workspace_id)
        .bind(conversation_id)
        .bind(source.as_str())
        .bind(kind)
        .bind(payload.to_string())
        .bind(now.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query_as::<_, TelemetryRow>(
            "SELECT * FROM session_telemetry WHERE telemetry_id = ?",
        )
        .bind(&id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| ControlError::missing_after("telemetry", "record"))?;

        let record = row.try_into()?;
        tx.commit().await?;
        Ok(record)
    }

    /// List telemetry for a conversation, oldest first.
    ///
    /// # Errors
    ///
    /// Fails only on storage errors.
    pub async fn list_telemetry(
        &self,
        scope: &Scope,
        conversation_id: &str,
    ) -> ControlResult<Vec<TelemetryRecord>> {
        let rows = sqlx::query_as::<_, TelemetryRow>(
            r"
            SELECT * FROM session_telemetry
            WHERE conversation_id = ? AND tenant_id = ? AND user_id = ? AND workspace_id = ?
            ORDER BY created_at ASC, telemetry_id ASC
            ",
        )
        .bind(conversation_id)
        .bind(&scope.tenant_id)
        .bind(&scope.user_id)
        .bind(&scope.workspace_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }
}

#[derive(sqlx::FromRow)]
struct TelemetryRow {
    telemetry_id: String,
    tenant_id: String,
    user_id: String,
    workspace_id: String,
    conversation_id: String,
    source: String,
    kind: String,
    payload: Option<String>,
    created_at: String,
}

impl TryFrom<TelemetryRow> for TelemetryRecord {
    type Error = ControlError;

    fn try_from(row: TelemetryRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.telemetry_id,
            scope: Scope::new(row.tenant_id, row.user_id, row.workspace_id),
            conversation_id: row.conversation_id,
            source: row.source.parse::<TelemetrySource>()?,
            kind: row.kind,
            payload: lenient_json_object(row.payload.as_deref()),
            created_at: parse_ts(&row.created_at, "telemetry created_at")?,
        })
    }
}
