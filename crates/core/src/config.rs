//! Layered configuration for Accord.
//!
//! Configuration is loaded and merged from multiple sources in order:
//! 1. Default values
//! 2. `accord.toml` file
//! 3. Environment variables (`ACCORD_*`)
//! 4. CLI flags (applied by the binary)
//!
//! Later sources override earlier ones. The merged result is validated
//! before it is handed out, and is read-only afterwards.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

/// File name searched in the working directory when no path is given.
pub const DEFAULT_CONFIG_FILE: &str = "accord.toml";

/// Environment variable overriding the log level.
pub const ENV_LOG: &str = "ACCORD_LOG";
/// Environment variable overriding the change store URL.
pub const ENV_STORE_URL: &str = "ACCORD_STORE_URL";
/// Environment variable overriding the worker concurrency limit.
pub const ENV_MAX_CONCURRENT: &str = "ACCORD_MAX_CONCURRENT";

// =============================================================================
// Log Level
// =============================================================================

/// Logging level. Parses case-insensitively; defaults to `Info`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Directive understood by `tracing_subscriber::EnvFilter`.
    #[must_use]
    pub const fn as_directive(&self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error => write!(f, "ERROR"),
            Self::Warn => write!(f, "WARN"),
            Self::Info => write!(f, "INFO"),
            Self::Debug => write!(f, "DEBUG"),
            Self::Trace => write!(f, "TRACE"),
        }
    }
}

impl FromStr for LogLevel {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "ERROR" => Ok(Self::Error),
            "WARN" => Ok(Self::Warn),
            "INFO" => Ok(Self::Info),
            "DEBUG" => Ok(Self::Debug),
            "TRACE" => Ok(Self::Trace),
            _ => Err(Error::invalid_config(
                "logging.level",
                format!("Invalid log level: '{s}'. Must be ERROR, WARN, INFO, DEBUG, or TRACE"),
            )),
        }
    }
}

// =============================================================================
// Sections
// =============================================================================

/// Worker and invocation limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerSettings {
    /// Maximum handler invocations running at once across all keys.
    pub max_concurrent: usize,
    /// Upper bound on a single handler invocation.
    pub invocation_timeout_secs: u64,
    /// Time in-flight invocations get to finish on shutdown.
    pub shutdown_grace_secs: u64,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            max_concurrent: 8,
            invocation_timeout_secs: 30,
            shutdown_grace_secs: 10,
        }
    }
}

impl ReconcilerSettings {
    #[must_use]
    pub const fn invocation_timeout(&self) -> Duration {
        Duration::from_secs(self.invocation_timeout_secs)
    }

    #[must_use]
    pub const fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// Backoff and retry budget for failing handlers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Delay before the first retry (milliseconds).
    pub base_delay_ms: u64,
    /// Ceiling for any single delay (milliseconds).
    pub max_delay_ms: u64,
    /// Random extra delay as a fraction of the exponential delay, in `[0, 1)`.
    pub jitter_factor: f64,
    /// Attempts after which a still-failing change is reported stuck.
    pub max_attempts: Option<u32>,
    /// Wall-clock window after the first attempt before a change is stuck.
    pub max_elapsed_secs: Option<u64>,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            base_delay_ms: 500,
            max_delay_ms: 60_000,
            jitter_factor: 0.1,
            max_attempts: Some(10),
            max_elapsed_secs: Some(3600),
        }
    }
}

/// Location of the change-record store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    /// Connection URL, e.g. `mem://` or `rocksdb://./accord-data`.
    pub url: String,
    pub namespace: String,
    pub database: String,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            url: "mem://".to_string(),
            namespace: "accord".to_string(),
            database: "changes".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: LogLevel,
}

/// Verdict a static handler always returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StaticVerdict {
    Approved,
    Handled,
    Denied,
    Failed,
    /// Return no outcome at all.
    Nothing,
}

/// Declarative handler definition, keyed by name under `[handlers]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum HandlerSpec {
    /// Always returns the same verdict.
    Static {
        outcome: StaticVerdict,
        #[serde(default)]
        reason: Option<String>,
    },
    /// Runs an external program per invocation.
    Process {
        command: Vec<String>,
        #[serde(default)]
        env: BTreeMap<String, String>,
        #[serde(default)]
        working_dir: Option<PathBuf>,
    },
}

// =============================================================================
// Configuration
// =============================================================================

/// Fully merged Accord configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccordConfig {
    pub reconciler: ReconcilerSettings,
    pub retry: RetrySettings,
    pub store: StoreSettings,
    pub logging: LoggingSettings,
    pub handlers: BTreeMap<String, HandlerSpec>,
}

impl AccordConfig {
    /// Load configuration from `path`, or from `./accord.toml` when present,
    /// then apply environment overrides and validate.
    ///
    /// # Errors
    ///
    /// Returns an error if an explicitly given file cannot be read, if any
    /// file fails to parse, or if the merged configuration is invalid.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let base = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let local = PathBuf::from(DEFAULT_CONFIG_FILE);
                if local.is_file() {
                    Self::from_file(&local)?
                } else {
                    debug!("No config file found, using defaults");
                    Self::default()
                }
            }
        };

        let config = base.with_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML file without applying overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::config_read(path, e.to_string()))?;
        let config = Self::from_toml(&text).map_err(|e| match e {
            Error::ConfigParse { reason, .. } => Error::config_parse(path, reason),
            other => other,
        })?;
        debug!(path = %path.display(), handlers = config.handlers.len(), "Loaded config file");
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not a valid configuration document.
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::config_parse("<inline>", e.to_string()))
    }

    /// Apply `ACCORD_*` overrides read through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns an error if an override is present but malformed.
    pub fn with_env<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(level) = lookup(ENV_LOG) {
            self.logging.level = level.parse()?;
        }
        if let Some(url) = lookup(ENV_STORE_URL) {
            self.store.url = url;
        }
        if let Some(raw) = lookup(ENV_MAX_CONCURRENT) {
            self.reconciler.max_concurrent = raw.parse().map_err(|_| {
                Error::invalid_config(ENV_MAX_CONCURRENT, format!("not a number: '{raw}'"))
            })?;
        }
        Ok(self)
    }

    /// Check cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.reconciler.max_concurrent == 0 {
            return Err(Error::invalid_config(
                "reconciler.max_concurrent",
                "must be at least 1",
            ));
        }
        if self.reconciler.invocation_timeout_secs == 0 {
            return Err(Error::invalid_config(
                "reconciler.invocation_timeout_secs",
                "must be at least 1",
            ));
        }
        if !(0.0..1.0).contains(&self.retry.jitter_factor) {
            return Err(Error::invalid_config(
                "retry.jitter_factor",
                "must be in [0.0, 1.0)",
            ));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(Error::invalid_config(
                "retry.base_delay_ms",
                "must not exceed retry.max_delay_ms",
            ));
        }
        if self.retry.max_attempts == Some(0) {
            return Err(Error::invalid_config(
                "retry.max_attempts",
                "must be at least 1 when set",
            ));
        }
        if self.store.url.is_empty() {
            return Err(Error::invalid_config("store.url", "must not be empty"));
        }
        for (name, spec) in &self.handlers {
            if let HandlerSpec::Process { command, .. } = spec {
                if command.is_empty() {
                    return Err(Error::invalid_config(
                        format!("handlers.{name}.command"),
                        "must name a program",
                    ));
                }
            }
        }
        Ok(())
    }
}
