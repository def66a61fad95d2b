//! Error types for the reconciler crate.

use thiserror::Error;

use crate::record::ChangeStatus;

/// Result type alias for reconciler operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Reconciler error types.
///
/// Handler misbehaviour never shows up here; it is recorded as an outcome.
/// These are failures of the orchestrator's own machinery and of callers
/// misusing it.
#[derive(Debug, Error)]
pub enum Error {
    #[error("change store error: {reason}")]
    Store { reason: String },

    #[error("change '{key}' not found")]
    ChangeNotFound { key: String },

    #[error("change '{key}' already has an attempt in flight")]
    ChangeInFlight { key: String },

    #[error("change '{key}' cannot move from {from} to {to}")]
    InvalidTransition {
        key: String,
        from: ChangeStatus,
        to: ChangeStatus,
    },

    #[error("default update for '{key}' failed: {reason}")]
    DefaultUpdateFailed { key: String, reason: String },

    #[error("notice delivery failed: {reason}")]
    Notice { reason: String },

    #[error("reconciler is shutting down")]
    ShuttingDown,

    #[error("invalid reconciler configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error(transparent)]
    Reaction(#[from] accord_reaction::Error),

    #[error(transparent)]
    Core(#[from] accord_core::Error),
}

impl Error {
    /// Create a store error.
    pub fn store(reason: impl Into<String>) -> Self {
        Self::Store {
            reason: reason.into(),
        }
    }

    /// Create a change not found error.
    pub fn change_not_found(key: impl Into<String>) -> Self {
        Self::ChangeNotFound { key: key.into() }
    }

    /// Create a change in flight error.
    pub fn change_in_flight(key: impl Into<String>) -> Self {
        Self::ChangeInFlight { key: key.into() }
    }

    /// Create an invalid transition error.
    pub fn invalid_transition(
        key: impl Into<String>,
        from: ChangeStatus,
        to: ChangeStatus,
    ) -> Self {
        Self::InvalidTransition {
            key: key.into(),
            from,
            to,
        }
    }

    /// Create a default update failed error.
    pub fn default_update_failed(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::DefaultUpdateFailed {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Create a notice error.
    pub fn notice(reason: impl Into<String>) -> Self {
        Self::Notice {
            reason: reason.into(),
        }
    }

    /// Create an invalid config error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Whether the error means another worker owns the change right now.
    #[must_use]
    pub const fn is_in_flight(&self) -> bool {
        matches!(self, Self::ChangeInFlight { .. })
    }
}
