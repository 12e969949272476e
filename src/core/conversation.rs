use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::ControlError;
use super::scope::Scope;

/// A durable coding-agent thread rooted at a directory.
///
/// The conversation id doubles as the live session id; the session is the
/// ephemeral in-memory side of the pair and is never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    /// Unique identifier (`conversation-<uuid>`), globally unique.
    pub id: String,

    /// Owning directory.
    pub directory_id: String,

    /// Scope triple, denormalized from the directory.
    #[serde(flatten)]
    pub scope: Scope,

    /// Display title.
    pub title: String,

    /// Which coding agent drives the thread.
    pub agent: AgentKind,

    /// When the conversation was created.
    pub created_at: DateTime<Utc>,

    /// When the conversation was archived, if it was.
    pub archived_at: Option<DateTime<Utc>>,

    /// Last-observed runtime state.
    pub runtime: RuntimeProjection,

    /// Opaque adapter state (JSON object).
    pub adapter_state: serde_json::Value,
}

impl Conversation {
    /// Whether the conversation is still active.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.archived_at.is_none()
    }
}

/// Runtime projection of a conversation, updated from the live session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeProjection {
    /// Coarse runtime status.
    pub status: RuntimeStatus,

    /// Whether a live session currently backs the conversation.
    pub live: bool,

    /// Why the conversation needs attention, when it does.
    pub attention_reason: Option<String>,

    /// OS process id of the agent, when live.
    pub process_id: Option<u32>,

    /// When the last runtime event was observed.
    pub last_event_at: Option<DateTime<Utc>>,

    /// Exit details of the last terminated process.
    pub last_exit: Option<ExitStatus>,
}

/// Exit details of a terminated agent process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExitStatus {
    /// Process exit code, when it exited normally.
    pub code: Option<i32>,

    /// Terminating signal name, when killed.
    pub signal: Option<String>,
}

/// Coarse runtime status of a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RuntimeStatus {
    /// Agent is actively working.
    Running,

    /// Agent is waiting on the user.
    NeedsInput,

    /// Agent finished its turn.
    Completed,

    /// Agent process exited.
    #[default]
    Exited,
}

impl RuntimeStatus {
    /// Stable storage representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::NeedsInput => "needs-input",
            Self::Completed => "completed",
            Self::Exited => "exited",
        }
    }
}

impl std::str::FromStr for RuntimeStatus {
    type Err = ControlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "needs-input" => Ok(Self::NeedsInput),
            "completed" => Ok(Self::Completed),
            "exited" => Ok(Self::Exited),
            other => Err(ControlError::integrity(format!(
                "expected runtime_status enum value, got '{other}'"
            ))),
        }
    }
}

impl std::fmt::Display for RuntimeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which coding agent drives a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    /// OpenAI Codex CLI.
    Codex,

    /// Claude Code CLI.
    Claude,

    /// Cursor agent.
    Cursor,

    /// Plain terminal, no agent harness.
    Terminal,

    /// Critique review agent.
    Critique,
}

impl AgentKind {
    /// Stable storage representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Codex => "codex",
            Self::Claude => "claude",
            Self::Cursor => "cursor",
            Self::Terminal => "terminal",
            Self::Critique => "critique",
        }
    }

    /// Agent kinds whose CLI binary can be probed on PATH.
    #[must_use]
    pub fn probeable() -> &'static [Self] {
        &[Self::Codex, Self::Claude, Self::Cursor]
    }
}

impl std::str::FromStr for AgentKind {
    type Err = ControlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "codex" => Ok(Self::Codex),
            "claude" => Ok(Self::Claude),
            "cursor" => Ok(Self::Cursor),
            "terminal" => Ok(Self::Terminal),
            "critique" => Ok(Self::Critique),
            other => Err(ControlError::integrity(format!(
                "expected agent kind enum value, got '{other}'"
            ))),
        }
    }
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn runtime_status_round_trips() {
        for status in [
            RuntimeStatus::Running,
            RuntimeStatus::NeedsInput,
            RuntimeStatus::Completed,
            RuntimeStatus::Exited,
        ] {
            assert_eq!(RuntimeStatus::from_str(status.as_str()).unwrap(), status);
        }
    }

    #[test]
    fn unknown_runtime_status_raises() {
        let err = RuntimeStatus::from_str("paused").unwrap_err();
        assert!(err.to_string().contains("expected runtime_status"));
    }
}
