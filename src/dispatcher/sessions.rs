//! Live-session commands: lifecycle, controller arbitration, attachment
//! fan-out, snapshots, and the PTY signal handlers.

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::instrument;

use crate::api::protocol::{
    AgentToolStatus, AgentToolsResponse, AttachResponse, Envelope, PtyAttachParams, PtyStartParams,
    Response, ScopeOnlyParams, SessionAckResponse, SessionClaimParams, SessionControlResponse,
    SessionIdParams, SessionRespondParams, SessionSnapshotParams, SessionSummary,
    SessionsResponse, SnapshotResponse,
};
use crate::core::{
    AgentKind, ControlError, ControlResult, Conversation, EventScope, ExitStatus, ObservedEvent,
    RuntimeProjection, RuntimeStatus, Scope, SessionControlAction,
};
use crate::sessions::live::{AttachHandlers, LiveSession, MockLiveSession, PtyLiveSession};
use crate::sessions::{INTERRUPT_BYTE, SessionState, SnapshotRecord};
use crate::utils::tools::resolve_binary;

use super::{Dispatcher, SessionSignal};

/// Spawns live sessions; the PTY subsystem sits behind this seam.
#[async_trait]
pub trait SessionLauncher: Send + Sync {
    /// Launch a live session for a conversation.
    ///
    /// # Errors
    ///
    /// Fails when the process cannot be spawned.
    async fn launch(
        &self,
        conversation: &Conversation,
        command: Option<&[String]>,
        cwd: Option<&str>,
    ) -> ControlResult<Arc<dyn LiveSession>>;
}

/// Production launcher: spawns the agent CLI under a PTY.
#[derive(Debug, Default, Clone, Copy)]
pub struct PtySessionLauncher;

impl PtySessionLauncher {
    fn default_command(agent: AgentKind) -> Vec<String> {
        let program = match agent {
            AgentKind::Codex => "codex",
            AgentKind::Claude => "claude",
            AgentKind::Cursor => "cursor-agent",
            AgentKind::Critique => "critique",
            AgentKind::Terminal => {
                return vec![std::env::var("SHELL").unwrap_or_else(|_| "bash".to_owned())];
            }
        };
        vec![program.to_owned()]
    }
}

#[async_trait]
impl SessionLauncher for PtySessionLauncher {
    async fn launch(
        &self,
        conversation: &Conversation,
        command: Option<&[String]>,
        cwd: Option<&str>,
    ) -> ControlResult<Arc<dyn LiveSession>> {
        let argv = match command {
            Some(argv) if !argv.is_empty() => argv.to_vec(),
            _ => Self::default_command(conversation.agent),
        };
        let session = PtyLiveSession::spawn(&argv, cwd)?;
        Ok(Arc::new(session))
    }
}

/// Test launcher handing out pre-seeded [`MockLiveSession`]s.
#[derive(Debug, Default)]
pub struct MockSessionLauncher {
    queued: Mutex<Vec<Arc<MockLiveSession>>>,
}

impl MockSessionLauncher {
    /// A launcher with an empty queue; launches fail until seeded.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a mock session for the next launch.
    pub async fn push(&self, session: Arc<MockLiveSession>) {
        self.queued.lock().await.push(session);
    }
}

#[async_trait]
impl SessionLauncher for MockSessionLauncher {
    async fn launch(
        &self,
        _conversation: &Conversation,
        _command: Option<&[String]>,
        _cwd: Option<&str>,
    ) -> ControlResult<Arc<dyn LiveSession>> {
        let mut queued = self.queued.lock().await;
        if queued.is_empty() {
            return Err(ControlError::internal("no mock session queued"));
        }
        Ok(queued.remove(0))
    }
}

fn summarize(session: &SessionState) -> SessionSummary {
    SessionSummary {
        session_id: session.id.clone(),
        directory_id: session.directory_id.clone(),
        status: session.status,
        live: session.is_live(),
        attention_reason: session.attention_reason.clone(),
        controller: session.controller.as_ref().map(|c| c.info()),
        created_at: session.created_at,
        last_event_at: session.last_event_at,
        last_output_cursor: session.last_observed_output_cursor,
    }
}

impl Dispatcher {
    /// Start a live PTY for a conversation and register the internal
    /// journal observer attachment.
    #[instrument(skip(self, params), fields(conversation_id = %params.conversation_id))]
    pub(super) async fn pty_start(
        &self,
        params: PtyStartParams,
    ) -> ControlResult<Response> {
        let scope = params.scope.resolve();
        let conversation = self
            .store()
            .require_conversation(&scope, &params.conversation_id)
            .await?;
        if !conversation.is_active() {
            return Err(ControlError::not_found("conversation"));
        }

        {
            let state = self.state().await;
            if state
                .sessions
                .get(&conversation.id)
                .is_some_and(SessionState::is_live)
            {
                return Err(ControlError::conflict("session already exists"));
            }
        }

        let directory = self
            .store()
            .get_directory(&scope, &conversation.directory_id)
            .await?;
        let cwd = params
            .cwd
            .clone()
            .or_else(|| directory.as_ref().map(|d| d.path.clone()));

        let live = self
            .launcher
            .launch(&conversation, params.command.as_deref(), cwd.as_deref())
            .await?;

        // Internal observer: mirrors output into the journal and detects
        // exit even with no client attached.
        let observer_tx = self.signal_sender();
        let observer_session = conversation.id.clone();
        let exit_tx = self.signal_sender();
        let exit_session = conversation.id.clone();
        live.attach(
            AttachHandlers {
                on_data: Box::new(move |chunk| {
                    let _ = observer_tx.send(SessionSignal::Output {
                        session_id: observer_session.clone(),
                        connection_id: None,
                        chunk,
                    });
                }),
                on_exit: Box::new(move |exit| {
                    let _ = exit_tx.send(SessionSignal::Exit {
                        session_id: exit_session.clone(),
                        exit,
                    });
                }),
            },
            None,
        )
        .await?;

        let process_id = live.process_id().await;

        let mut state = self.state().await;
        let mut session = state
            .sessions
            .remove(&conversation.id)
            .unwrap_or_else(|| {
                SessionState::new(
                    conversation.id.clone(),
                    scope.clone(),
                    Some(conversation.directory_id.clone()),
                )
            });
        session.live = Some(live);
        session.status = RuntimeStatus::Running;
        session.attention_reason = None;
        session.last_event_at = Some(Utc::now());
        let summary = summarize(&session);
        state.sessions.insert(session);

        state.publish(
            EventScope::conversation(&scope, Some(&conversation.directory_id), &conversation.id),
            ObservedEvent::SessionStatus {
                session_id: conversation.id.clone(),
                status: RuntimeStatus::Running,
                attention_reason: None,
            },
        );
        drop(state);

        let _ = self
            .store()
            .update_conversation_runtime(
                &conversation.id,
                &RuntimeProjection {
                    status: RuntimeStatus::Running,
                    live: true,
                    attention_reason: None,
                    process_id,
                    last_event_at: Some(Utc::now()),
                    last_exit: None,
                },
            )
            .await;

        Ok(Response::Session(summary))
    }

    pub(super) async fn session_list(
        &self,
        params: ScopeOnlyParams,
    ) -> ControlResult<Response> {
        let scope = params.scope.resolve();
        let state = self.state().await;
        let mut sessions: Vec<SessionSummary> = state
            .sessions
            .iter()
            .filter(|s| s.scope == scope)
            .map(summarize)
            .collect();
        drop(state);
        sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        Ok(Response::Sessions(SessionsResponse { sessions }))
    }

    pub(super) async fn session_status(
        &self,
        params: SessionIdParams,
    ) -> ControlResult<Response> {
        let scope = params.scope.resolve();
        let state = self.state().await;
        let session = require_session(&state, &scope, &params.session_id)?;
        let summary = summarize(session);
        drop(state);
        Ok(Response::Session(summary))
    }

    /// Capture a fresh snapshot when live; otherwise return the cached
    /// record marked stale.
    #[instrument(skip(self, params), fields(session_id = %params.session_id))]
    pub(super) async fn session_snapshot(
        &self,
        params: SessionSnapshotParams,
    ) -> ControlResult<Response> {
        let scope = params.scope.resolve();

        let live = {
            let state = self.state().await;
            let session = require_session(&state, &scope, &params.session_id)?;
            session.live.clone()
        };

        let mut record = match live.clone() {
            Some(live) => {
                let frame = live.snapshot().await?;
                let record = SnapshotRecord::from_frame(frame);

                let mut state = self.state().await;
                if let Some(session) = state.sessions.get_mut(&params.session_id) {
                    session.last_snapshot = Some(record.clone());
                }
                drop(state);

                record
            }
            None => {
                let state = self.state().await;
                let session = require_session(&state, &scope, &params.session_id)?;
                let cached = session
                    .last_snapshot
                    .clone()
                    .ok_or_else(|| ControlError::not_found("session"))?;
                drop(state);
                cached.stale()
            }
        };

        if let Some(n) = params.tail_lines {
            // Prefer the live buffer tail; fall back to the frame tail.
            let live_tail = match live {
                Some(live) => live.buffer_tail(Some(n)).await,
                None => None,
            };
            match live_tail {
                Some(tail) => record.lines = tail,
                None => {
                    let total = record.lines.len();
                    let take = total.min(n);
                    record.lines = record.lines.split_off(total - take);
                }
            }
        }

        Ok(Response::Snapshot(SnapshotResponse {
            session_id: params.session_id,
            snapshot: record,
        }))
    }

    /// Claim or take over a session, emitting the control event and a
    /// status event.
    #[instrument(skip(self, params), fields(session_id = %params.session_id, controller_id = %params.controller_id))]
    pub(super) async fn session_claim(
        &self,
        connection_id: &str,
        params: SessionClaimParams,
    ) -> ControlResult<Response> {
        let scope = params.scope.resolve();
        let mut state = self.state().await;

        let session = require_session_mut(&mut state, &scope, &params.session_id)?;
        let (action, previous) = session.claim(
            connection_id,
            params.controller_id,
            params.controller_type,
            params.display,
            params.takeover,
        )?;
        let controller = session.controller.as_ref().map(|c| c.info());
        let status = session.status;
        let attention_reason = session.attention_reason.clone();
        let directory_id = session.directory_id.clone();

        state.publish(
            EventScope::conversation(&scope, directory_id.as_deref(), &params.session_id),
            ObservedEvent::SessionControl {
                session_id: params.session_id.clone(),
                action,
                controller: controller.clone(),
                previous_controller: previous.clone(),
            },
        );
        state.publish(
            EventScope::conversation(&scope, directory_id.as_deref(), &params.session_id),
            ObservedEvent::SessionStatus {
                session_id: params.session_id.clone(),
                status,
                attention_reason,
            },
        );
        drop(state);

        Ok(Response::SessionControl(SessionControlResponse {
            session_id: params.session_id,
            action,
            controller,
            previous_controller: previous,
        }))
    }

    #[instrument(skip(self, params), fields(session_id = %params.session_id))]
    pub(super) async fn session_release(
        &self,
        connection_id: &str,
        params: SessionIdParams,
    ) -> ControlResult<Response> {
        let scope = params.scope.resolve();
        let mut state = self.state().await;

        let session = require_session_mut(&mut state, &scope, &params.session_id)?;
        let previous = session.release(connection_id)?;
        let directory_id = session.directory_id.clone();

        state.publish(
            EventScope::conversation(&scope, directory_id.as_deref(), &params.session_id),
            ObservedEvent::SessionControl {
                session_id: params.session_id.clone(),
                action: SessionControlAction::Released,
                controller: None,
                previous_controller: Some(previous.clone()),
            },
        );
        drop(state);

        Ok(Response::SessionControl(SessionControlResponse {
            session_id: params.session_id,
            action: SessionControlAction::Released,
            controller: None,
            previous_controller: Some(previous),
        }))
    }

    /// Write text to the PTY and mark the session running.
    #[instrument(skip(self, params), fields(session_id = %params.session_id))]
    pub(super) async fn session_respond(
        &self,
        connection_id: &str,
        params: SessionRespondParams,
    ) -> ControlResult<Response> {
        let scope = params.scope.resolve();
        let live = {
            let state = self.state().await;
            let session = require_session(&state, &scope, &params.session_id)?;
            session.assert_connection_can_mutate(connection_id)?;
            session
                .live
                .clone()
                .ok_or_else(|| ControlError::precondition("session is not live"))?
        };

        live.write_text(&params.text).await?;

        self.set_session_status(&scope, &params.session_id, RuntimeStatus::Running, None)
            .await
    }

    /// Write ETX to the PTY and mark the session completed.
    #[instrument(skip(self, params), fields(session_id = %params.session_id))]
    pub(super) async fn session_interrupt(
        &self,
        connection_id: &str,
        params: SessionIdParams,
    ) -> ControlResult<Response> {
        let scope = params.scope.resolve();
        let live = {
            let state = self.state().await;
            let session = require_session(&state, &scope, &params.session_id)?;
            session.assert_connection_can_mutate(connection_id)?;
            session
                .live
                .clone()
                .ok_or_else(|| ControlError::precondition("session is not live"))?
        };

        live.write_bytes(&[INTERRUPT_BYTE]).await?;

        self.set_session_status(&scope, &params.session_id, RuntimeStatus::Completed, None)
            .await
    }

    /// Destroy a session's in-memory state, closing the live handle.
    ///
    /// The conversation's persisted runtime projection is left untouched;
    /// the conversation stays the durable anchor.
    #[instrument(skip(self, params), fields(session_id = %params.session_id))]
    pub(super) async fn session_remove(
        &self,
        connection_id: &str,
        params: SessionIdParams,
    ) -> ControlResult<Response> {
        let scope = params.scope.resolve();
        let mut state = self.state().await;

        {
            let session = require_session(&state, &scope, &params.session_id)?;
            session.assert_connection_can_mutate(connection_id)?;
        }

        let session = state
            .sessions
            .remove(&params.session_id)
            .ok_or_else(|| ControlError::not_found("session"))?;

        state.publish(
            EventScope::conversation(&scope, session.directory_id.as_deref(), &params.session_id),
            ObservedEvent::SessionStatus {
                session_id: params.session_id.clone(),
                status: RuntimeStatus::Exited,
                attention_reason: None,
            },
        );
        drop(state);

        if let Some(live) = session.live {
            live.close().await;
        }

        Ok(Response::SessionAck(SessionAckResponse {
            session_id: params.session_id,
            changed: true,
        }))
    }

    /// Attach this connection to a session's output, replacing any prior
    /// attachment for the same (connection, session).
    #[instrument(skip(self, params), fields(session_id = %params.session_id))]
    pub(super) async fn pty_attach(
        &self,
        connection_id: &str,
        params: PtyAttachParams,
    ) -> ControlResult<Response> {
        let scope = params.scope.resolve();
        let mut state = self.state().await;

        let session = require_session_mut(&mut state, &scope, &params.session_id)?;
        let live = session
            .live
            .clone()
            .ok_or_else(|| ControlError::precondition("session is not live"))?;

        let previous = session.attachments.remove(connection_id);
        drop(state);

        if let Some(previous) = previous {
            live.detach(&previous).await;
        }

        let data_tx = self.signal_sender();
        let data_session = params.session_id.clone();
        let data_connection = connection_id.to_owned();
        let exit_tx = self.signal_sender();
        let exit_session = params.session_id.clone();

        let attachment_id = live
            .attach(
                AttachHandlers {
                    on_data: Box::new(move |chunk| {
                        let _ = data_tx.send(SessionSignal::Output {
                            session_id: data_session.clone(),
                            connection_id: Some(data_connection.clone()),
                            chunk,
                        });
                    }),
                    on_exit: Box::new(move |exit| {
                        let _ = exit_tx.send(SessionSignal::Exit {
                            session_id: exit_session.clone(),
                            exit,
                        });
                    }),
                },
                params.since_cursor,
            )
            .await?;
        let cursor = live.latest_cursor().await;

        let mut state = self.state().await;
        if let Some(session) = state.sessions.get_mut(&params.session_id) {
            session
                .attachments
                .insert(connection_id.to_owned(), attachment_id.clone());
        }
        drop(state);

        Ok(Response::Attach(AttachResponse {
            session_id: params.session_id,
            attachment_id,
            cursor,
        }))
    }

    pub(super) async fn pty_detach(
        &self,
        connection_id: &str,
        params: SessionIdParams,
    ) -> ControlResult<Response> {
        let scope = params.scope.resolve();
        let mut state = self.state().await;

        let session = require_session_mut(&mut state, &scope, &params.session_id)?;
        let attachment = session.attachments.remove(connection_id);
        let live = session.live.clone();
        drop(state);

        let changed = match (attachment, live) {
            (Some(attachment_id), Some(live)) => {
                live.detach(&attachment_id).await;
                true
            }
            (Some(_), None) => true,
            _ => false,
        };

        Ok(Response::SessionAck(SessionAckResponse {
            session_id: params.session_id,
            changed,
        }))
    }

    pub(super) async fn pty_subscribe_events(
        &self,
        connection_id: &str,
        params: SessionIdParams,
    ) -> ControlResult<Response> {
        let scope = params.scope.resolve();
        let mut state = self.state().await;
        let session = require_session_mut(&mut state, &scope, &params.session_id)?;
        let changed = session.subscribers.insert(connection_id.to_owned());
        drop(state);

        Ok(Response::SessionAck(SessionAckResponse {
            session_id: params.session_id,
            changed,
        }))
    }

    pub(super) async fn pty_unsubscribe_events(
        &self,
        connection_id: &str,
        params: SessionIdParams,
    ) -> ControlResult<Response> {
        let scope = params.scope.resolve();
        let mut state = self.state().await;
        let session = require_session_mut(&mut state, &scope, &params.session_id)?;
        let changed = session.subscribers.remove(connection_id);
        drop(state);

        Ok(Response::SessionAck(SessionAckResponse {
            session_id: params.session_id,
            changed,
        }))
    }

    pub(super) async fn attention_list(
        &self,
        params: ScopeOnlyParams,
    ) -> ControlResult<Response> {
        let scope = params.scope.resolve();
        let state = self.state().await;
        let mut sessions: Vec<SessionSummary> = state
            .sessions
            .iter()
            .filter(|s| s.scope == scope && s.status == RuntimeStatus::NeedsInput)
            .map(summarize)
            .collect();
        drop(state);
        sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        Ok(Response::Sessions(SessionsResponse { sessions }))
    }

    pub(super) async fn agent_tools_status(
        &self,
        _params: ScopeOnlyParams,
    ) -> ControlResult<Response> {
        let tools = AgentKind::probeable()
            .iter()
            .map(|agent| {
                let path = resolve_binary(agent.as_str());
                AgentToolStatus {
                    agent: *agent,
                    available: path.is_some(),
                    path: path.map(|p| p.display().to_string()),
                }
            })
            .collect();
        Ok(Response::AgentTools(AgentToolsResponse { tools }))
    }

    /// Set a session's runtime status, persist the conversation's
    /// projection, and publish the status event.
    async fn set_session_status(
        &self,
        scope: &Scope,
        session_id: &str,
        status: RuntimeStatus,
        attention_reason: Option<String>,
    ) -> ControlResult<Response> {
        let mut state = self.state().await;
        let session = require_session_mut(&mut state, scope, session_id)?;
        session.status = status;
        session.attention_reason = attention_reason.clone();
        session.last_event_at = Some(Utc::now());
        let live = session.is_live();
        let directory_id = session.directory_id.clone();
        let summary = summarize(session);

        state.publish(
            EventScope::conversation(scope, directory_id.as_deref(), session_id),
            ObservedEvent::SessionStatus {
                session_id: session_id.to_owned(),
                status,
                attention_reason: attention_reason.clone(),
            },
        );
        drop(state);

        let _ = self
            .store()
            .update_conversation_runtime(
                session_id,
                &RuntimeProjection {
                    status,
                    live,
                    attention_reason,
                    process_id: None,
                    last_event_at: Some(Utc::now()),
                    last_exit: None,
                },
            )
            .await;

        Ok(Response::Session(summary))
    }

    /// Pump handler for one output chunk.
    pub(super) async fn handle_output_signal(
        &self,
        session_id: &str,
        connection_id: Option<&str>,
        chunk: crate::sessions::live::OutputChunk,
    ) {
        let mut state = self.state().await;
        let Some(session) = state.sessions.get_mut(session_id) else {
            return;
        };

        let chunk_base64 = BASE64.encode(&chunk.bytes);
        let scope = session.scope.clone();
        let directory_id = session.directory_id.clone();
        session.last_event_at = Some(Utc::now());

        // The originating connection always gets its direct copy, even
        // for cursors the journal has already seen.
        if let Some(connection_id) = connection_id {
            state.send_to(
                connection_id,
                Envelope::PtyOutput {
                    session_id: session_id.to_owned(),
                    cursor: chunk.cursor,
                    chunk_base64: chunk_base64.clone(),
                },
            );
        }

        let Some(session) = state.sessions.get_mut(session_id) else {
            return;
        };
        if chunk.cursor > session.last_observed_output_cursor {
            session.last_observed_output_cursor = chunk.cursor;
            state.publish(
                EventScope::conversation(&scope, directory_id.as_deref(), session_id),
                ObservedEvent::SessionOutput {
                    session_id: session_id.to_owned(),
                    cursor: chunk.cursor,
                    chunk_base64,
                },
            );
        }
    }

    /// Pump handler for a process exit. Duplicate signals (one per
    /// attachment) collapse on the first.
    pub(super) async fn handle_exit_signal(&self, session_id: &str, exit: ExitStatus) {
        let mut state = self.state().await;
        let Some(session) = state.sessions.get_mut(session_id) else {
            return;
        };
        if session.live.is_none() {
            return;
        }

        session.live = None;
        session.status = RuntimeStatus::Exited;
        session.last_event_at = Some(Utc::now());
        if let Some(snapshot) = session.last_snapshot.take() {
            session.last_snapshot = Some(snapshot.stale());
        }

        let scope = session.scope.clone();
        let directory_id = session.directory_id.clone();
        let recipients: Vec<String> = session
            .subscribers
            .iter()
            .chain(session.attachments.keys())
            .cloned()
            .collect();
        session.attachments.clear();

        for connection_id in recipients {
            state.send_to(
                &connection_id,
                Envelope::PtyExit {
                    session_id: session_id.to_owned(),
                    exit: exit.clone(),
                },
            );
        }

        state.publish(
            EventScope::conversation(&scope, directory_id.as_deref(), session_id),
            ObservedEvent::SessionStatus {
                session_id: session_id.to_owned(),
                status: RuntimeStatus::Exited,
                attention_reason: None,
            },
        );
        drop(state);

        let _ = self
            .store()
            .update_conversation_runtime(
                session_id,
                &RuntimeProjection {
                    status: RuntimeStatus::Exited,
                    live: false,
                    attention_reason: None,
                    process_id: None,
                    last_event_at: Some(Utc::now()),
                    last_exit: Some(exit),
                },
            )
            .await;
    }
}

fn require_session<'a>(
    state: &'a super::DispatchState,
    scope: &Scope,
    session_id: &str,
) -> ControlResult<&'a SessionState> {
    state
        .sessions
        .get(session_id)
        .filter(|s| s.scope == *scope)
        .ok_or_else(|| ControlError::not_found("session"))
}

fn require_session_mut<'a>(
    state: &'a mut super::DispatchState,
    scope: &Scope,
    session_id: &str,
) -> ControlResult<&'a mut SessionState> {
    state
        .sessions
        .get_mut(session_id)
        .filter(|s| s.scope == *scope)
        .ok_or_else(|| ControlError::not_found("session"))
}
