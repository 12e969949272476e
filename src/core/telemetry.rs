use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::ControlError;
use super::scope::Scope;

/// A telemetry datum observed for a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryRecord {
    /// Unique identifier (`telemetry-<uuid>`).
    pub id: String,

    /// Owning scope triple.
    #[serde(flatten)]
    pub scope: Scope,

    /// Conversation the datum belongs to.
    pub conversation_id: String,

    /// Where the datum came from.
    pub source: TelemetrySource,

    /// Free-form kind tag, e.g. `tool-use`, `token-usage`.
    pub kind: String,

    /// Opaque payload.
    pub payload: serde_json::Value,

    /// When the datum was recorded.
    pub created_at: DateTime<Utc>,
}

/// Origin of a telemetry datum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TelemetrySource {
    /// Emitted by an agent hook.
    Hook,

    /// Observed by a background poller.
    Poller,

    /// Reported by the agent adapter.
    Adapter,
}

impl TelemetrySource {
    /// Stable storage representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hook => "hook",
            Self::Poller => "poller",
            Self::Adapter => "adapter",
        }
    }
}

impl std::str::FromStr for TelemetrySource {
    type Err = ControlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hook" => Ok(Self::Hook),
            "poller" => Ok(Self::Poller),
            "adapter" => Ok(Self::Adapter),
            other => Err(ControlError::integrity(format!(
                "telemetry source enum value '{other}' unknown"
            ))),
        }
    }
}
