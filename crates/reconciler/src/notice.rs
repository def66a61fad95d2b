//! Operator-facing notices for denied and stuck changes.

use std::sync::Arc;

use accord_reaction::ChangeKey;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, error, warn};
use ulid::Ulid;

use crate::error::{Error, Result};
use crate::record::ChangeRecord;

/// Default capacity of a [`BroadcastNoticeSink`].
const BROADCAST_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    /// A handler permanently rejected the change.
    Denied,
    /// The change kept failing until its retry budget ran out.
    Stuck,
}

impl std::fmt::Display for NoticeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Denied => write!(f, "denied"),
            Self::Stuck => write!(f, "stuck"),
        }
    }
}

/// What an operator needs to act on a change that will not resolve itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorNotice {
    pub id: Ulid,
    pub kind: NoticeKind,
    pub key: ChangeKey,
    pub handler: String,
    pub reason: String,
    pub attempts: u32,
    pub first_seen: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub emitted_at: DateTime<Utc>,
}

impl OperatorNotice {
    /// Build a notice from the record's latest state.
    #[must_use]
    pub fn from_record(kind: NoticeKind, record: &ChangeRecord) -> Self {
        Self {
            id: Ulid::new(),
            kind,
            key: record.key.clone(),
            handler: record.handler.clone(),
            reason: record.last_reason().unwrap_or_default().to_string(),
            attempts: record.attempts,
            first_seen: record.created_at,
            last_attempt_at: record.history.last().map(|attempt| attempt.finished_at),
            emitted_at: Utc::now(),
        }
    }
}

/// Destination for operator notices.
#[async_trait]
pub trait NoticeSink: Send + Sync {
    /// Deliver a notice.
    async fn emit(&self, notice: &OperatorNotice) -> Result<()>;
}

/// Writes notices to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNoticeSink;

#[async_trait]
impl NoticeSink for TracingNoticeSink {
    async fn emit(&self, notice: &OperatorNotice) -> Result<()> {
        match notice.kind {
            NoticeKind::Denied => warn!(
                key = %notice.key,
                handler = %notice.handler,
                reason = %notice.reason,
                attempts = notice.attempts,
                "Change denied"
            ),
            NoticeKind::Stuck => error!(
                key = %notice.key,
                handler = %notice.handler,
                reason = %notice.reason,
                attempts = notice.attempts,
                "Change stuck, operator action required"
            ),
        }
        Ok(())
    }
}

/// Publishes notices to in-process subscribers.
#[derive(Debug, Clone)]
pub struct BroadcastNoticeSink {
    tx: broadcast::Sender<OperatorNotice>,
}

impl BroadcastNoticeSink {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(BROADCAST_CAPACITY)
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OperatorNotice> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastNoticeSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NoticeSink for BroadcastNoticeSink {
    async fn emit(&self, notice: &OperatorNotice) -> Result<()> {
        if self.tx.send(notice.clone()).is_err() {
            debug!(key = %notice.key, "No subscribers for operator notice");
        }
        Ok(())
    }
}

/// Delivers each notice to every inner sink.
#[derive(Clone, Default)]
pub struct FanoutNoticeSink {
    sinks: Vec<Arc<dyn NoticeSink>>,
}

impl FanoutNoticeSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, sink: Arc<dyn NoticeSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

#[async_trait]
impl NoticeSink for FanoutNoticeSink {
    /// Every sink is tried even when an earlier one fails.
    async fn emit(&self, notice: &OperatorNotice) -> Result<()> {
        let results =
            futures::future::join_all(self.sinks.iter().map(|sink| sink.emit(notice))).await;
        let failures: Vec<String> = results
            .into_iter()
            .filter_map(|result| result.err().map(|e| e.to_string()))
            .collect();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::notice(failures.join("; ")))
        }
    }
}
