//! Stream subscription commands: replay-then-subscribe under one lock.


use tracing::instrument;

use crate::api::protocol::{
    Envelope, Response, StreamSubscribeParams, StreamUnsubscribeParams, SubscribeResponse,
    UnsubscribeResponse,
};
use crate::core::ControlResult;
use crate::utils::ids::prefixed_id;

use super::{Dispatcher, StreamSubscription};

impl Dispatcher {
    /// Register a filter, replay matching journal entries newer than
    /// `after_cursor` to this connection, and return the current cursor.
    ///
    /// Replay and registration happen under the state lock, so no entry
    /// can slip between the replayed prefix and the live feed.
    #[instrument(skip(self, params), fields(after_cursor = params.after_cursor))]
    pub(super) async fn stream_subscribe(
        &self,
        connection_id: &str,
        params: StreamSubscribeParams,
    ) -> ControlResult<Response> {
        let filter = params.filter();
        let subscription_id = prefixed_id("subscription");

        let mut state = self.state().await;

        for entry in state.journal.replay(&filter, params.after_cursor) {
            state.send_to(
                connection_id,
                Envelope::StreamEvent {
                    subscription_id: subscription_id.clone(),
                    cursor: entry.cursor,
                    event: entry.event.clone(),
                },
            );
        }

        let cursor = state.journal.cursor();
        state.subscriptions.insert(
            subscription_id.clone(),
            StreamSubscription {
                id: subscription_id.clone(),
                connection_id: connection_id.to_owned(),
                filter,
            },
        );
        drop(state);

        Ok(Response::Subscribed(SubscribeResponse {
            subscription_id,
            cursor,
        }))
    }

    pub(super) async fn stream_unsubscribe(
        &self,
        connection_id: &str,
        params: StreamUnsubscribeParams,
    ) -> ControlResult<Response> {
        let mut state = self.state().await;

        let owned = state
            .subscriptions
            .get(&params.subscription_id)
            .is_some_and(|sub| sub.connection_id == connection_id);
        let unsubscribed = if owned {
            state.subscriptions.remove(&params.subscription_id).is_some()
        } else {
            false
        };
        drop(state);

        Ok(Response::Unsubscribed(UnsubscribeResponse {
            subscription_id: params.subscription_id,
            unsubscribed,
        }))
    }
}
