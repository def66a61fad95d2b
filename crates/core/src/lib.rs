//! Core types shared across Accord crates.
//!
//! - [`error`]: the core error type (configuration and I/O failures)
//! - [`config`]: layered configuration (defaults < file < env < flags)

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod config;
pub mod error;

pub use config::{
    AccordConfig, HandlerSpec, LogLevel, LoggingSettings, ReconcilerSettings, RetrySettings,
    StaticVerdict, StoreSettings,
};
pub use error::{Error, Result};
