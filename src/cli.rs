//! CLI command definitions using clap.

use std::path::PathBuf;

use accord_core::LogLevel;
use clap::{Parser, Subcommand};

/// Accord - drives state-change handlers to a verdict
#[derive(Parser, Debug)]
#[command(name = "accord")]
#[command(version)]
#[command(about = "Drive pluggable state-change handlers to a terminal verdict")]
#[command(
    long_about = "Accord submits (old, new) state changes to named handlers, retries transient failures with identical arguments, and keeps a durable record of every verdict."
)]
pub struct Cli {
    /// Configuration file (defaults to ./accord.toml when present)
    #[arg(long, global = true, env = "ACCORD_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace); RUST_LOG takes precedence
    #[arg(long, global = true)]
    pub log_level: Option<LogLevel>,

    /// Change store URL, e.g. mem:// or rocksdb://.accord/db
    #[arg(long, global = true)]
    pub store_url: Option<String>,

    /// Write the new state of approved changes to this file
    #[arg(long, global = true)]
    pub apply_to: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Submit a change to a handler and wait for its resolution
    Run {
        /// Handler name from the [handlers] table
        #[arg(long)]
        handler: String,

        /// JSON file holding {"old": ..., "new": ...}
        #[arg(long)]
        change: PathBuf,
    },

    /// Resume every open change in the store
    Resume,

    /// Show change records
    Status {
        /// Only this change key
        #[arg(short, long)]
        key: Option<String>,

        /// Print records as JSON
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Reopen a stuck change with a fresh retry budget
    Retrigger {
        /// Change key
        #[arg(short, long)]
        key: String,
    },

    /// List configured handlers
    Handlers,
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::panic)]

    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "accord",
            "run",
            "--handler",
            "users",
            "--change",
            "change.json",
            "--log-level",
            "debug",
            "--store-url",
            "mem://",
        ])
        .unwrap();

        assert_eq!(cli.log_level, Some(LogLevel::Debug));
        assert_eq!(cli.store_url.as_deref(), Some("mem://"));
        match cli.command {
            Commands::Run { handler, change } => {
                assert_eq!(handler, "users");
                assert_eq!(change, PathBuf::from("change.json"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_bad_log_level_rejected() {
        assert!(Cli::try_parse_from(["accord", "--log-level", "loud", "handlers"]).is_err());
    }
}
