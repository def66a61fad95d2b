//! # Accord
//!
//! Entry point for the `accord` binary.
//!
//! ## Start-up
//!
//! 1. **Configuration**: defaults, `accord.toml`, `ACCORD_*` variables, then
//!    CLI flags
//! 2. **Tracing**: `RUST_LOG` when set, otherwise the configured level
//! 3. **Command**: builds the change store, handler registry and reconciler
//!    it needs and runs
//!
//! ## Shutdown
//!
//! SIGTERM and SIGINT stop scheduling. In-flight invocations get the
//! configured grace period, after which they are cancelled and their changes
//! stay open for the next `accord resume`.

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

mod apply;
mod cli;
mod commands;

use accord_core::{AccordConfig, LogLevel};
use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AccordConfig::load(cli.config.as_deref())
        .context("Failed to load configuration")?;
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    if let Some(url) = cli.store_url.clone() {
        config.store.url = url;
    }

    init_tracing(config.logging.level);

    commands::execute_command(cli.command, &config, cli.apply_to).await
}

/// Initialize tracing subscriber with environment filter.
fn init_tracing(level: LogLevel) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_directive()));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
