//! In-memory registry of live sessions and controller arbitration.
//!
//! A session is the ephemeral counterpart of a conversation and shares its
//! id. The registry is owned by the dispatcher; pollers never touch it
//! directly.

/// Live PTY handles and snapshots.
pub mod live;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{
    ControlError, ControlResult, ControllerInfo, ControllerType, RuntimeStatus, Scope,
    SessionControlAction,
};
use live::{LiveSession, SnapshotFrame};

/// Identifier of a client connection.
pub type ConnectionId = String;

/// The byte written to interrupt a session's agent (ETX, Ctrl+C).
pub const INTERRUPT_BYTE: u8 = 0x03;

/// The current controller of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionController {
    /// Controller identifier.
    pub controller_id: String,

    /// Kind of actor.
    pub controller_type: ControllerType,

    /// Connection the claim was made from.
    pub connection_id: ConnectionId,

    /// Display name for conflict messages.
    pub display: Option<String>,

    /// When the claim was taken or last renewed.
    pub claimed_at: DateTime<Utc>,
}

impl SessionController {
    /// The event-facing view of this controller.
    #[must_use]
    pub fn info(&self) -> ControllerInfo {
        ControllerInfo {
            controller_id: self.controller_id.clone(),
            controller_type: self.controller_type,
            display: self.display.clone(),
        }
    }

    /// Name used in `session is already claimed by <display>` messages.
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.display.as_deref().unwrap_or(&self.controller_id)
    }
}

/// A cached terminal snapshot, marked stale once the session is no longer
/// live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotRecord {
    /// Terminal height in rows.
    pub rows: u16,

    /// Terminal width in columns.
    pub cols: u16,

    /// Visible lines, top to bottom.
    pub lines: Vec<String>,

    /// Cursor row.
    pub cursor_row: u16,

    /// Cursor column.
    pub cursor_col: u16,

    /// When the frame was captured.
    pub captured_at: DateTime<Utc>,

    /// Whether the frame predates the session going un-live.
    pub stale: bool,
}

impl SnapshotRecord {
    /// Serialize a fresh frame into a record.
    #[must_use]
    pub fn from_frame(frame: SnapshotFrame) -> Self {
        Self {
            rows: frame.rows,
            cols: frame.cols,
            lines: frame.lines,
            cursor_row: frame.cursor_row,
            cursor_col: frame.cursor_col,
            captured_at: frame.captured_at,
            stale: false,
        }
    }

    /// The same record marked stale.
    #[must_use]
    pub fn stale(mut self) -> Self {
        self.stale = true;
        self
    }
}

/// In-memory state of one session.
pub struct SessionState {
    /// Session id, equal to the conversation id.
    pub id: String,

    /// Owning scope triple.
    pub scope: Scope,

    /// Directory the session runs in, when known.
    pub directory_id: Option<String>,

    /// Worktree identifier, when the agent runs in a dedicated worktree.
    pub worktree_id: Option<String>,

    /// Live PTY handle; `None` once the process has gone away.
    pub live: Option<Arc<dyn LiveSession>>,

    /// Current controller, if claimed.
    pub controller: Option<SessionController>,

    /// Coarse runtime status.
    pub status: RuntimeStatus,

    /// Why the session needs attention, when it does.
    pub attention_reason: Option<String>,

    /// When the session entry was created.
    pub created_at: DateTime<Utc>,

    /// When the last runtime event was observed.
    pub last_event_at: Option<DateTime<Utc>>,

    /// Connections subscribed to session events.
    pub subscribers: HashSet<ConnectionId>,

    /// Output attachment id per connection; at most one per connection.
    pub attachments: HashMap<ConnectionId, String>,

    /// Cursor of the last output chunk written to the journal.
    pub last_observed_output_cursor: u64,

    /// Most recent serialized snapshot.
    pub last_snapshot: Option<SnapshotRecord>,
}

impl SessionState {
    /// A fresh entry with no live handle.
    #[must_use]
    pub fn new(id: String, scope: Scope, directory_id: Option<String>) -> Self {
        Self {
            id,
            scope,
            directory_id,
            worktree_id: None,
            live: None,
            controller: None,
            status: RuntimeStatus::Exited,
            attention_reason: None,
            created_at: Utc::now(),
            last_event_at: None,
            subscribers: HashSet::new(),
            attachments: HashMap::new(),
            last_observed_output_cursor: 0,
            last_snapshot: None,
        }
    }

    /// Whether a live handle currently backs the session.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.live.is_some()
    }

    /// Whether a connection may run mutating operations: it holds the
    /// claim, or no claim exists.
    #[must_use]
    pub fn connection_can_mutate(&self, connection_id: &str) -> bool {
        self.controller
            .as_ref()
            .is_none_or(|c| c.connection_id == connection_id)
    }

    /// Reject mutating operations from a non-controller connection.
    ///
    /// # Errors
    ///
    /// Fails when another connection holds the claim.
    pub fn assert_connection_can_mutate(&self, connection_id: &str) -> ControlResult<()> {
        match self.controller {
            Some(ref controller) if controller.connection_id != connection_id => {
                Err(ControlError::conflict(format!(
                    "session is already claimed by {}",
                    controller.display_name()
                )))
            }
            _ => Ok(()),
        }
    }

    /// Claim or renew control of the session.
    ///
    /// Unclaimed sessions and renewals from the claiming connection
    /// succeed with `claimed`; a different connection succeeds only with
    /// `takeover` and yields `taken-over`.
    ///
    /// # Errors
    ///
    /// Fails when another connection holds the claim and `takeover` is
    /// false.
    pub fn claim(
        &mut self,
        connection_id: &str,
        controller_id: String,
        controller_type: ControllerType,
        display: Option<String>,
        takeover: bool,
    ) -> ControlResult<(SessionControlAction, Option<ControllerInfo>)> {
        let previous = self.controller.clone();

        let action = match previous {
            Some(ref current) if current.connection_id != connection_id => {
                if !takeover {
                    return Err(ControlError::conflict(format!(
                        "session is already claimed by {}",
                        current.display_name()
                    )));
                }
                SessionControlAction::TakenOver
            }
            _ => SessionControlAction::Claimed,
        };

        self.controller = Some(SessionController {
            controller_id,
            controller_type,
            connection_id: connection_id.to_owned(),
            display,
            claimed_at: Utc::now(),
        });

        Ok((action, previous.map(|c| c.info())))
    }

    /// Release the claim held by this connection.
    ///
    /// # Errors
    ///
    /// Fails when the session is unclaimed or claimed elsewhere.
    pub fn release(&mut self, connection_id: &str) -> ControlResult<ControllerInfo> {
        match self.controller {
            Some(ref controller) if controller.connection_id == connection_id => {
                let info = controller.info();
                self.controller = None;
                Ok(info)
            }
            Some(ref controller) => Err(ControlError::conflict(format!(
                "session is already claimed by {}",
                controller.display_name()
            ))),
            None => Err(ControlError::precondition("session is not claimed")),
        }
    }
}

impl std::fmt::Debug for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionState")
            .field("id", &self.id)
            .field("status", &self.status)
            .field("live", &self.live.is_some())
            .field("controller", &self.controller)
            .finish_non_exhaustive()
    }
}

/// Session-id keyed registry of in-memory session state.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<String, SessionState>,
}

impl SessionRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a session entry.
    pub fn insert(&mut self, session: SessionState) {
        self.sessions.insert(session.id.clone(), session);
    }

    /// A session by id.
    #[must_use]
    pub fn get(&self, session_id: &str) -> Option<&SessionState> {
        self.sessions.get(session_id)
    }

    /// A mutable session by id.
    pub fn get_mut(&mut self, session_id: &str) -> Option<&mut SessionState> {
        self.sessions.get_mut(session_id)
    }

    /// Remove a session entry, returning it for teardown.
    pub fn remove(&mut self, session_id: &str) -> Option<SessionState> {
        self.sessions.remove(session_id)
    }

    /// Iterate all sessions.
    pub fn iter(&self) -> impl Iterator<Item = &SessionState> {
        self.sessions.values()
    }

    /// Iterate all sessions mutably.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut SessionState> {
        self.sessions.values_mut()
    }

    /// Number of sessions with a live handle in the given directory.
    #[must_use]
    pub fn live_thread_count(&self, directory_id: &str) -> usize {
        self.sessions
            .values()
            .filter(|s| s.is_live() && s.directory_id.as_deref() == Some(directory_id))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> SessionState {
        SessionState::new("conversation-1".to_owned(), Scope::local(), None)
    }

    #[test]
    fn claim_then_renew_from_same_connection() {
        let mut state = session();
        let (action, previous) = state
            .claim("connection-a", "c1".to_owned(), ControllerType::Human, None, false)
            .unwrap();
        assert_eq!(action, SessionControlAction::Claimed);
        assert!(previous.is_none());

        let (action, previous) = state
            .claim("connection-a", "c1".to_owned(), ControllerType::Human, None, false)
            .unwrap();
        assert_eq!(action, SessionControlAction::Claimed);
        assert_eq!(previous.unwrap().controller_id, "c1");
    }

    #[test]
    fn foreign_claim_requires_takeover() {
        let mut state = session();
        state
            .claim("connection-a", "c1".to_owned(), ControllerType::Human, None, false)
            .unwrap();

        let err = state
            .claim("connection-b", "c2".to_owned(), ControllerType::Agent, None, false)
            .unwrap_err();
        assert!(err.to_string().contains("already claimed"));

        let (action, previous) = state
            .claim("connection-b", "c2".to_owned(), ControllerType::Agent, None, true)
            .unwrap();
        assert_eq!(action, SessionControlAction::TakenOver);
        assert_eq!(previous.unwrap().controller_id, "c1");
    }

    #[test]
    fn release_only_from_controlling_connection() {
        let mut state = session();
        state
            .claim("connection-a", "c1".to_owned(), ControllerType::Human, None, false)
            .unwrap();

        assert!(state.release("connection-b").is_err());
        assert_eq!(state.release("connection-a").unwrap().controller_id, "c1");
        assert!(state.controller.is_none());
    }

    #[test]
    fn mutation_gate_allows_unclaimed_sessions() {
        let mut state = session();
        assert!(state.assert_connection_can_mutate("connection-x").is_ok());

        state
            .claim("connection-a", "c1".to_owned(), ControllerType::Human, None, false)
            .unwrap();
        assert!(state.assert_connection_can_mutate("connection-a").is_ok());
        assert!(state.assert_connection_can_mutate("connection-b").is_err());
    }
}
