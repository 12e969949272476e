//! Error taxonomy surfaced to clients as structured failures.

use thiserror::Error;

/// Result alias for operations that fail with a [`ControlError`].
pub type ControlResult<T> = Result<T, ControlError>;

/// Structured failures with a short human-readable message.
///
/// The dispatcher surfaces these to the calling connection; background
/// loops record them instead of raising.
#[derive(Debug, Error)]
pub enum ControlError {
    /// A referenced record does not exist.
    #[error("{what} not found")]
    NotFound {
        /// The kind of record, e.g. `directory`, `task`.
        what: &'static str,
    },

    /// Two related records do not share the same scope triple.
    #[error("{context} scope mismatch")]
    ScopeMismatch {
        /// What relation was being established.
        context: String,
    },

    /// The operation conflicts with existing state.
    #[error("{message}")]
    Conflict {
        /// Conflict description, e.g. `task already claimed: c1`.
        message: String,
    },

    /// A state-machine precondition was violated.
    #[error("{message}")]
    Precondition {
        /// Precondition description.
        message: String,
    },

    /// Input validation failed.
    #[error("{message}")]
    Validation {
        /// Validation description.
        message: String,
    },

    /// A stored-state invariant was violated.
    #[error("{message}")]
    Integrity {
        /// Integrity description, e.g. `task missing after claim`.
        message: String,
    },

    /// An external collaborator (GitHub, Linear) failed.
    #[error("{message}")]
    External {
        /// External failure description.
        message: String,
    },

    /// An unexpected internal failure.
    #[error("{message}")]
    Internal {
        /// Internal failure description.
        message: String,
    },
}

impl ControlError {
    /// A record of the given kind was not found.
    #[must_use]
    pub fn not_found(what: &'static str) -> Self {
        Self::NotFound { what }
    }

    /// A scope mismatch in the given relational context.
    #[must_use]
    pub fn scope_mismatch(context: impl Into<String>) -> Self {
        Self::ScopeMismatch {
            context: context.into(),
        }
    }

    /// A conflict with existing state.
    #[must_use]
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    /// A violated precondition.
    #[must_use]
    pub fn precondition(message: impl Into<String>) -> Self {
        Self::Precondition {
            message: message.into(),
        }
    }

    /// A validation failure.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// An integrity failure (invariant or storage corruption).
    #[must_use]
    pub fn integrity(message: impl Into<String>) -> Self {
        Self::Integrity {
            message: message.into(),
        }
    }

    /// An external-collaborator failure.
    #[must_use]
    pub fn external(message: impl Into<String>) -> Self {
        Self::External {
            message: message.into(),
        }
    }

    /// An internal failure.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// A row that a preceding write should have left behind is absent.
    #[must_use]
    pub fn missing_after(what: &'static str, op: &'static str) -> Self {
        Self::Integrity {
            message: format!("{what} missing after {op}"),
        }
    }

    /// Stable machine-readable code for the error class.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not-found",
            Self::ScopeMismatch { .. } => "scope-mismatch",
            Self::Conflict { .. } => "conflict",
            Self::Precondition { .. } => "precondition",
            Self::Validation { .. } => "validation",
            Self::Integrity { .. } => "integrity",
            Self::External { .. } => "external",
            Self::Internal { .. } => "internal",
        }
    }
}

impl From<sqlx::Error> for ControlError {
    fn from(err: sqlx::Error) -> Self {
        Self::Internal {
            message: format!("database error: {err}"),
        }
    }
}

impl From<serde_json::Error> for ControlError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal {
            message: format!("serialization error: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_match_taxonomy() {
        assert_eq!(
            ControlError::not_found("directory").to_string(),
            "directory not found"
        );
        assert_eq!(
            ControlError::scope_mismatch("task repository").to_string(),
            "task repository scope mismatch"
        );
        assert_eq!(
            ControlError::missing_after("task", "claim").to_string(),
            "task missing after claim"
        );
    }

    #[test]
    fn codes_are_stable() {
        assert_eq!(ControlError::not_found("task").code(), "not-found");
        assert_eq!(ControlError::conflict("x").code(), "conflict");
    }
}
