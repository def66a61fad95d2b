//! Change-record store trait and implementations.

use std::collections::BTreeMap;
use std::sync::Arc;

use accord_reaction::ChangeKey;
use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::Result;
use crate::record::ChangeRecord;

/// Durable home of change records, keyed by change key.
///
/// Only the worker holding a key's claim writes that key's record.
#[async_trait]
pub trait ChangeStore: Send + Sync {
    /// Load a record.
    async fn load(&self, key: &ChangeKey) -> Result<Option<ChangeRecord>>;

    /// Insert or replace a record.
    async fn save(&self, record: &ChangeRecord) -> Result<()>;

    /// All records, ordered by key.
    async fn list(&self) -> Result<Vec<ChangeRecord>>;
}

/// In-memory change store for testing.
#[derive(Debug, Default)]
pub struct InMemoryChangeStore {
    records: RwLock<BTreeMap<ChangeKey, ChangeRecord>>,
}

impl InMemoryChangeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl ChangeStore for InMemoryChangeStore {
    async fn load(&self, key: &ChangeKey) -> Result<Option<ChangeRecord>> {
        Ok(self.records.read().await.get(key).cloned())
    }

    async fn save(&self, record: &ChangeRecord) -> Result<()> {
        self.records
            .write()
            .await
            .insert(record.key.clone(), record.clone());
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ChangeRecord>> {
        Ok(self.records.read().await.values().cloned().collect())
    }
}

/// A wrapper that adds tracing to a change store.
pub struct TracingChangeStore<S: ChangeStore> {
    inner: S,
}

impl<S: ChangeStore> TracingChangeStore<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<S: ChangeStore> ChangeStore for TracingChangeStore<S> {
    async fn load(&self, key: &ChangeKey) -> Result<Option<ChangeRecord>> {
        tracing::trace!(key = %key.short(), "Loading change record");
        self.inner.load(key).await
    }

    async fn save(&self, record: &ChangeRecord) -> Result<()> {
        tracing::debug!(
            key = %record.key.short(),
            status = %record.status,
            attempts = record.attempts,
            "Saving change record"
        );
        let result = self.inner.save(record).await;
        if let Err(ref e) = result {
            tracing::warn!(key = %record.key.short(), error = %e, "Change record save failed");
        }
        result
    }

    async fn list(&self) -> Result<Vec<ChangeRecord>> {
        let records = self.inner.list().await?;
        tracing::debug!(count = records.len(), "Listed change records");
        Ok(records)
    }
}
