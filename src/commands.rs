//! CLI command handlers.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use accord_core::{AccordConfig, HandlerSpec};
use accord_reaction::{Change, ChangeKey, HandlerRegistry};
use accord_reconciler::{
    install_signal_handlers, ChangeRecord, ChangeStore, DefaultUpdate, Reconciler,
    ReconcilerConfig, Resolution, Submission, SurrealChangeStore, TracingChangeStore,
    TracingDefaultUpdate,
};
use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::apply::StateFileUpdate;
use crate::cli::Commands;

/// Execute a CLI command.
pub async fn execute_command(
    command: Commands,
    config: &AccordConfig,
    apply_to: Option<PathBuf>,
) -> Result<()> {
    match command {
        Commands::Run { handler, change } => cmd_run(config, apply_to, &handler, &change).await,
        Commands::Resume => cmd_resume(config, apply_to).await,
        Commands::Status { key, json } => cmd_status(config, key.as_deref(), json).await,
        Commands::Retrigger { key } => cmd_retrigger(config, apply_to, &key).await,
        Commands::Handlers => {
            print!("{}", render_handlers(config));
            Ok(())
        }
    }
}

/// Submit one change and wait for it to settle.
async fn cmd_run(
    config: &AccordConfig,
    apply_to: Option<PathBuf>,
    handler: &str,
    change_path: &Path,
) -> Result<()> {
    let change = read_change(change_path)?;
    let reconciler = build_reconciler(config, apply_to).await?;

    let submission = reconciler.submit(handler, change).await?;
    info!(key = %submission.key().short(), handler, "Submitted change");
    match &submission {
        Submission::Accepted { key } => {
            run_until_idle(&reconciler).await;
            println!("{}", describe(key, reconciler.record(key).await?.as_ref()));
        }
        Submission::Denied { key, reason } => {
            println!("{key}: denied earlier ({reason}), handler not invoked");
        }
        Submission::Resolved { key, status } => {
            println!("{key}: already {status}");
        }
        Submission::InFlight { key } => println!("{key}: already in flight"),
        Submission::Stuck { key } => {
            println!("{key}: stuck, run `accord retrigger --key {key}` to retry");
        }
    }
    Ok(())
}

async fn cmd_resume(config: &AccordConfig, apply_to: Option<PathBuf>) -> Result<()> {
    let reconciler = build_reconciler(config, apply_to).await?;
    let scheduled = reconciler.resume().await?;
    run_until_idle(&reconciler).await;
    println!("resumed {scheduled} change(s)");
    Ok(())
}

async fn cmd_status(config: &AccordConfig, key: Option<&str>, json: bool) -> Result<()> {
    let store = open_store(config).await?;
    let records = match key {
        Some(key) => {
            let key = ChangeKey::parse(key)?;
            store.load(&key).await?.into_iter().collect()
        }
        None => store.list().await?,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
    } else if records.is_empty() {
        println!("no change records");
    } else {
        for record in &records {
            println!("{}", status_line(record));
        }
    }
    Ok(())
}

async fn cmd_retrigger(config: &AccordConfig, apply_to: Option<PathBuf>, key: &str) -> Result<()> {
    let key = ChangeKey::parse(key)?;
    let reconciler = build_reconciler(config, apply_to).await?;
    reconciler.retrigger(&key).await?;
    run_until_idle(&reconciler).await;
    println!("{}", describe(&key, reconciler.record(&key).await?.as_ref()));
    Ok(())
}

async fn build_reconciler(config: &AccordConfig, apply_to: Option<PathBuf>) -> Result<Reconciler> {
    let registry = HandlerRegistry::from_specs(&config.handlers)
        .context("Invalid handler configuration")?;
    let store = open_store(config).await?;
    let update: Arc<dyn DefaultUpdate> = match apply_to {
        Some(path) => Arc::new(StateFileUpdate::new(path)),
        None => Arc::new(TracingDefaultUpdate),
    };

    let reconciler = Reconciler::builder()
        .with_registry(registry)
        .with_store(Arc::new(store))
        .with_default_update(update)
        .with_config(ReconcilerConfig::from(config))
        .build()?;
    info!(
        handlers = reconciler.registry().len(),
        max_concurrent = reconciler.config().max_concurrent,
        "Reconciler ready"
    );
    Ok(reconciler)
}

async fn open_store(config: &AccordConfig) -> Result<TracingChangeStore<SurrealChangeStore>> {
    let store = SurrealChangeStore::connect(&config.store)
        .await
        .context("Failed to open change store")?;
    Ok(TracingChangeStore::new(store))
}

/// Wait for every worker, or shut down gracefully on SIGTERM/SIGINT.
async fn run_until_idle(reconciler: &Reconciler) {
    let coordinator = reconciler.shutdown_coordinator();
    let signals = install_signal_handlers(Arc::clone(&coordinator));
    let mut listener = coordinator.listener();

    tokio::select! {
        () = reconciler.wait_idle() => {}
        () = listener.draining() => {
            let stats = reconciler.shutdown(reconciler.config().shutdown_grace).await;
            if stats.workers_interrupted + stats.workers_aborted > 0 {
                warn!(
                    interrupted = stats.workers_interrupted,
                    aborted = stats.workers_aborted,
                    "Changes left open, run `accord resume` to continue"
                );
            }
        }
    }
    signals.abort();
}

fn read_change(path: &Path) -> Result<Change> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read change file {}", path.display()))?;
    serde_json::from_str(&text)
        .with_context(|| format!("Invalid change file {}", path.display()))
}

fn describe(key: &ChangeKey, record: Option<&ChangeRecord>) -> String {
    match record {
        None => format!("{key}: no record"),
        Some(record) => match Resolution::of(record) {
            Some(resolution) => format!("{key}: {resolution}"),
            None => format!(
                "{key}: still {} after {} attempt(s)",
                record.status, record.attempts
            ),
        },
    }
}

fn status_line(record: &ChangeRecord) -> String {
    let reason = record
        .last_reason()
        .map(|reason| format!("  {reason}"))
        .unwrap_or_default();
    format!(
        "{}  {:<8}  {:>3}  {:<16}  {}{reason}",
        record.key.short(),
        record.status.as_str(),
        record.attempts,
        record.handler,
        record.updated_at.format("%Y-%m-%d %H:%M:%S"),
    )
}

fn render_handlers(config: &AccordConfig) -> String {
    if config.handlers.is_empty() {
        return "no handlers configured\n".to_string();
    }
    config
        .handlers
        .iter()
        .map(|(name, spec)| match spec {
            HandlerSpec::Static { outcome, .. } => {
                format!("{name}  static  {}\n", format!("{outcome:?}").to_lowercase())
            }
            HandlerSpec::Process { command, .. } => {
                format!("{name}  process  {}\n", command.join(" "))
            }
        })
        .collect()
}
