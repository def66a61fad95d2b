//! Core error types for Accord operations.
//!
//! All errors are explicit, typed, and recoverable - no panics allowed.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for Accord operations.
#[derive(Debug, Error)]
pub enum Error {
    // Configuration errors
    #[error("failed to read config file '{path}': {reason}")]
    ConfigRead { path: PathBuf, reason: String },

    #[error("failed to parse config file '{path}': {reason}")]
    ConfigParse { path: PathBuf, reason: String },

    #[error("invalid configuration value for '{field}': {reason}")]
    InvalidConfig { field: String, reason: String },

    // Generic I/O error wrapper
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a config read error.
    pub fn config_read(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::ConfigRead {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a config parse error.
    pub fn config_parse(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::ConfigParse {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid config error for a specific field.
    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_read_display() {
        let err = Error::config_read("/etc/accord.toml", "permission denied");
        assert!(err.to_string().contains("/etc/accord.toml"));
        assert!(err.to_string().contains("permission denied"));
    }

    #[test]
    fn test_invalid_config_names_field() {
        let err = Error::invalid_config("retry.jitter_factor", "must be below 1.0");
        assert!(err.to_string().contains("retry.jitter_factor"));
    }
}
