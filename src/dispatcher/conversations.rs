//! Conversation and telemetry commands.


use tracing::instrument;

use crate::api::protocol::{
    ConversationCreateParams, ConversationIdParams, ConversationListParams,
    ConversationUpdateParams, ConversationsResponse, DeletedResponse, Response,
    TelemetryListParams, TelemetryRecordParams, TelemetryResponse,
};
use crate::core::{ControlResult, EventScope, ObservedEvent};
use crate::store::CreateConversationParams;

use super::Dispatcher;

impl Dispatcher {
    #[instrument(skip(self, params), fields(directory_id = %params.directory_id))]
    pub(super) async fn conversation_create(
        &self,
        params: ConversationCreateParams,
    ) -> ControlResult<Response> {
        let scope = params.scope.resolve();
        let conversation = self
            .store()
            .create_conversation(CreateConversationParams {
                id: params.id,
                scope: scope.clone(),
                directory_id: params.directory_id,
                title: params.title,
                agent: params.agent,
            })
            .await?;

        let mut state = self.state().await;
        state.publish(
            EventScope::conversation(&scope, Some(&conversation.directory_id), &conversation.id),
            ObservedEvent::ConversationCreated {
                conversation: conversation.clone(),
            },
        );
        drop(state);

        Ok(Response::Conversation(Box::new(conversation)))
    }

    pub(super) async fn conversation_list(
        &self,
        params: ConversationListParams,
    ) -> ControlResult<Response> {
        let scope = params.scope.resolve();
        let conversations = self
            .store()
            .list_conversations(
                &scope,
                params.directory_id.as_deref(),
                params.include_archived,
            )
            .await?;
        Ok(Response::Conversations(ConversationsResponse {
            conversations,
        }))
    }

    #[instrument(skip(self, params), fields(conversation_id = %params.id))]
    pub(super) async fn conversation_update(
        &self,
        params: ConversationUpdateParams,
    ) -> ControlResult<Response> {
        let scope = params.scope.resolve();
        let conversation = self
            .store()
            .update_conversation_title(&scope, &params.id, &params.title)
            .await?;

        let mut state = self.state().await;
        state.publish(
            EventScope::conversation(&scope, Some(&conversation.directory_id), &conversation.id),
            ObservedEvent::ConversationUpdated {
                conversation: conversation.clone(),
            },
        );
        drop(state);

        Ok(Response::Conversation(Box::new(conversation)))
    }

    #[instrument(skip(self, params), fields(conversation_id = %params.id))]
    pub(super) async fn conversation_archive(
        &self,
        params: ConversationIdParams,
    ) -> ControlResult<Response> {
        let scope = params.scope.resolve();
        let conversation = self
            .store()
            .archive_conversation(&scope, &params.id)
            .await?;

        let mut state = self.state().await;
        state.publish(
            EventScope::conversation(&scope, Some(&conversation.directory_id), &conversation.id),
            ObservedEvent::ConversationArchived {
                conversation_id: conversation.id.clone(),
            },
        );
        drop(state);

        Ok(Response::Conversation(Box::new(conversation)))
    }

    /// Delete the conversation row and destroy any live session sharing
    /// its id.
    #[instrument(skip(self, params), fields(conversation_id = %params.id))]
    pub(super) async fn conversation_delete(
        &self,
        params: ConversationIdParams,
    ) -> ControlResult<Response> {
        let scope = params.scope.resolve();
        let conversation = self.store().require_conversation(&scope, &params.id).await?;
        self.store().delete_conversation(&scope, &params.id).await?;

        let mut state = self.state().await;
        let removed = state.sessions.remove(&params.id);
        state.publish(
            EventScope::conversation(&scope, Some(&conversation.directory_id), &conversation.id),
            ObservedEvent::ConversationDeleted {
                conversation_id: params.id.clone(),
            },
        );
        drop(state);

        if let Some(session) = removed {
            if let Some(live) = session.live {
                live.close().await;
            }
        }

        Ok(Response::Deleted(DeletedResponse {
            id: params.id,
            deleted: true,
        }))
    }

    /// Re-derive the title through the external provider; a disabled
    /// provider leaves the conversation unchanged.
    #[instrument(skip(self, params), fields(conversation_id = %params.id))]
    pub(super) async fn conversation_title_refresh(
        &self,
        params: ConversationIdParams,
    ) -> ControlResult<Response> {
        let scope = params.scope.resolve();
        let conversation = self.store().require_conversation(&scope, &params.id).await?;

        // External await: nothing read before this point is trusted after.
        let derived = self.title_provider.derive_title(&conversation).await?;

        let Some(title) = derived else {
            return Ok(Response::Conversation(Box::new(conversation)));
        };

        let updated = self
            .store()
            .update_conversation_title(&scope, &params.id, &title)
            .await?;

        let mut state = self.state().await;
        state.publish(
            EventScope::conversation(&scope, Some(&updated.directory_id), &updated.id),
            ObservedEvent::ConversationUpdated {
                conversation: updated.clone(),
            },
        );
        drop(state);

        Ok(Response::Conversation(Box::new(updated)))
    }

    #[instrument(skip(self, params), fields(conversation_id = %params.conversation_id))]
    pub(super) async fn telemetry_record(
        &self,
        params: TelemetryRecordParams,
    ) -> ControlResult<Response> {
        let scope = params.scope.resolve();
        let record = self
            .store()
            .record_telemetry(
                &scope,
                &params.conversation_id,
                params.source,
                &params.kind,
                params.payload.unwrap_or_else(|| serde_json::json!({})),
            )
            .await?;

        let mut state = self.state().await;
        state.publish(
            EventScope::conversation(&scope, None, &params.conversation_id),
            ObservedEvent::TelemetryRecorded {
                record: record.clone(),
            },
        );
        drop(state);

        Ok(Response::Telemetry(Box::new(record)))
    }

    pub(super) async fn telemetry_list(
        &self,
        params: TelemetryListParams,
    ) -> ControlResult<Response> {
        let scope = params.scope.resolve();
        let records = self
            .store()
            .list_telemetry(&scope, &params.conversation_id)
            .await?;
        Ok(Response::TelemetryList(TelemetryResponse { records }))
    }
}
