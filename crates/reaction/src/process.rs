//! Handler that runs an external program per invocation.
//!
//! The change is written to the program's stdin as JSON. The program answers
//! on stdout with a wire-form outcome (see [`Outcome::from_wire`]); empty
//! stdout means it returned nothing. A non-zero exit status is a fault.
//!
//! [`Outcome::from_wire`]: crate::Outcome::from_wire

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{bail, Context};
use async_trait::async_trait;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::change::Change;
use crate::error::{Error, Result};
use crate::handler::Handler;
use crate::outcome::Reaction;

/// Longest stderr excerpt carried into a fault message.
const STDERR_EXCERPT: usize = 512;

#[derive(Debug, Clone)]
pub struct ProcessHandler {
    name: String,
    program: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    working_dir: Option<PathBuf>,
}

impl ProcessHandler {
    /// Create a process handler from a command line (`program args..`).
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidHandler` if `command` is empty.
    pub fn new(name: impl Into<String>, command: &[String]) -> Result<Self> {
        let name = name.into();
        let (program, args) = command
            .split_first()
            .ok_or_else(|| Error::invalid_handler(name.clone(), "command is empty"))?;
        Ok(Self {
            name,
            program: program.clone(),
            args: args.to_vec(),
            env: BTreeMap::new(),
            working_dir: None,
        })
    }

    /// Add environment variables for the child process.
    #[must_use]
    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env.extend(env);
        self
    }

    #[must_use]
    pub fn with_working_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.working_dir = dir;
        self
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }
        command
    }
}

#[async_trait]
impl Handler for ProcessHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn react(&self, change: Arc<Change>) -> anyhow::Result<Reaction> {
        let input = change.canonical_bytes()?;
        let mut child = self
            .command()
            .spawn()
            .with_context(|| format!("failed to spawn '{}'", self.program))?;

        // Feed stdin while stdout and stderr drain, or a program that writes
        // before it reads blocks on a full pipe.
        let stdin = child.stdin.take();
        let feed = async move {
            let Some(mut stdin) = stdin else {
                return Ok(());
            };
            // A program that ignores its input may exit before reading it.
            match stdin.write_all(&input).await {
                Err(e) if e.kind() != ErrorKind::BrokenPipe => Err(e),
                _ => Ok(()),
            }
        };
        let (fed, output) = tokio::join!(feed, child.wait_with_output());
        fed.context("failed to write change to handler stdin")?;
        let output = output.context("failed to collect handler output")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let excerpt: String = stderr.trim().chars().take(STDERR_EXCERPT).collect();
            bail!("'{}' exited with {}: {excerpt}", self.program, output.status);
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stdout = stdout.trim();
        debug!(handler = %self.name, bytes = stdout.len(), "Process handler replied");

        if stdout.is_empty() {
            return Ok(Reaction::Nothing);
        }
        Ok(Reaction::Wire(
            serde_json::from_str(stdout).unwrap_or_else(|_| Value::String(stdout.to_string())),
        ))
    }
}

#[cfg(all(test, unix))]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]

    use super::*;
    use crate::state::State;
    use serde_json::json;

    fn sh(name: &str, script: &str) -> ProcessHandler {
        let command = vec!["sh".to_string(), "-c".to_string(), script.to_string()];
        ProcessHandler::new(name, &command).expect("command is non-empty")
    }

    fn change() -> Arc<Change> {
        Arc::new(Change::new(
            State::new().with_config("user", "admin"),
            State::new().with_config("user", "root"),
        ))
    }

    #[test]
    fn test_empty_command_rejected() {
        assert!(ProcessHandler::new("empty", &[]).is_err());
    }

    #[tokio::test]
    async fn test_reply_is_wire_outcome() {
        let handler = sh(
            "deny",
            r#"cat >/dev/null; echo '{"outcome":"denied","reason":"root is reserved"}'"#,
        );
        let reaction = handler.react(change()).await.unwrap();
        assert_eq!(
            reaction,
            Reaction::Wire(json!({"outcome": "denied", "reason": "root is reserved"}))
        );
    }

    #[tokio::test]
    async fn test_program_reads_change_from_stdin() {
        let handler = sh(
            "echo",
            r#"if grep -q '"user":"root"'; then echo '"handled"'; fi"#,
        );
        let reaction = handler.react(change()).await.unwrap();
        assert_eq!(reaction, Reaction::Wire(json!("handled")));
    }

    #[tokio::test]
    async fn test_silent_program_returns_nothing() {
        let handler = sh("silent", "cat >/dev/null");
        assert_eq!(handler.react(change()).await.unwrap(), Reaction::Nothing);
    }

    #[tokio::test]
    async fn test_non_json_reply_is_kept_raw() {
        let handler = sh("chatty", "cat >/dev/null; echo all good");
        assert_eq!(
            handler.react(change()).await.unwrap(),
            Reaction::Wire(Value::String("all good".to_string()))
        );
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_error() {
        let handler = sh("crash", "cat >/dev/null; echo 'db locked' >&2; exit 3");
        let err = handler.react(change()).await.expect_err("exit 3 is a fault");
        assert!(err.to_string().contains("db locked"));
    }

    #[tokio::test]
    async fn test_large_change_with_chatty_program() {
        let big = "x".repeat(200_000);
        let change = Arc::new(Change::new(
            State::new(),
            State::new().with_relation("blob", big),
        ));
        let handler = sh(
            "chatty",
            r#"head -c 100000 /dev/zero | tr '\0' x >&2; wc -c >&2; echo '"handled"'"#,
        );

        let limit = std::time::Duration::from_secs(10);
        let reaction = tokio::time::timeout(limit, handler.react(change))
            .await
            .expect("handler must not block on its pipes")
            .unwrap();
        assert_eq!(reaction, Reaction::Wire(json!("handled")));
    }

    #[tokio::test]
    async fn test_env_is_passed() {
        let handler = sh("env", r#"cat >/dev/null; echo "\"$VERDICT\"""#).with_env(
            [("VERDICT".to_string(), "approved".to_string())]
                .into_iter()
                .collect(),
        );
        assert_eq!(
            handler.react(change()).await.unwrap(),
            Reaction::Wire(json!("approved"))
        );
    }
}
