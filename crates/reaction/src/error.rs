//! Error types for the reaction crate.

use thiserror::Error;

/// Result type alias for reaction operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Reaction error types.
///
/// These cover registry and model misuse only. A misbehaving handler never
/// produces one of these; its failures become `Outcome::Failed`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("handler '{name}' is not registered")]
    UnknownHandler { name: String },

    #[error("handler '{name}' is already registered")]
    DuplicateHandler { name: String },

    #[error("invalid handler '{name}': {reason}")]
    InvalidHandler { name: String, reason: String },

    #[error("invalid state value at {section}.{key}: {reason}")]
    InvalidState {
        section: String,
        key: String,
        reason: String,
    },

    #[error("failed to encode change: {reason}")]
    Encoding { reason: String },

    #[error("invalid change key '{value}'")]
    InvalidKey { value: String },
}

impl Error {
    /// Create an unknown handler error.
    pub fn unknown_handler(name: impl Into<String>) -> Self {
        Self::UnknownHandler { name: name.into() }
    }

    /// Create a duplicate handler error.
    pub fn duplicate_handler(name: impl Into<String>) -> Self {
        Self::DuplicateHandler { name: name.into() }
    }

    /// Create an invalid handler error.
    pub fn invalid_handler(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidHandler {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid state error.
    pub fn invalid_state(
        section: impl Into<String>,
        key: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidState {
            section: section.into(),
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Create an encoding error.
    pub fn encoding(reason: impl Into<String>) -> Self {
        Self::Encoding {
            reason: reason.into(),
        }
    }

    /// Create an invalid key error.
    pub fn invalid_key(value: impl Into<String>) -> Self {
        Self::InvalidKey {
            value: value.into(),
        }
    }
}
