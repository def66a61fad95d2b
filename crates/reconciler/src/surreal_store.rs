//! SurrealDB-backed change store.
//!
//! Works with any engine the `any` client accepts; `mem://` for tests and
//! `rocksdb://<path>` for records that survive a restart.

use std::sync::Arc;

use accord_core::StoreSettings;
use accord_reaction::ChangeKey;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::info;

use crate::error::{Error, Result};
use crate::record::ChangeRecord;
use crate::store::ChangeStore;

const TABLE: &str = "change_record";

/// Row layout. The record itself travels as a JSON string so that its
/// shape is owned by serde, not by the database schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredRecord {
    key: String,
    handler: String,
    status: String,
    attempts: u32,
    updated_at: DateTime<Utc>,
    payload: String,
}

impl StoredRecord {
    fn from_record(record: &ChangeRecord) -> Result<Self> {
        Ok(Self {
            key: record.key.as_str().to_string(),
            handler: record.handler.clone(),
            status: record.status.to_string(),
            attempts: record.attempts,
            updated_at: record.updated_at,
            payload: serde_json::to_string(record)
                .map_err(|e| Error::store(format!("failed to encode record: {e}")))?,
        })
    }

    fn into_record(self) -> Result<ChangeRecord> {
        serde_json::from_str(&self.payload)
            .map_err(|e| Error::store(format!("corrupt record '{}': {e}", self.key)))
    }
}

#[derive(Debug, Clone)]
pub struct SurrealChangeStore {
    db: Arc<Surreal<Any>>,
}

impl SurrealChangeStore {
    /// Connect and select the configured namespace and database.
    ///
    /// # Errors
    ///
    /// Returns `Error::Store` if the connection fails.
    pub async fn connect(settings: &StoreSettings) -> Result<Self> {
        let db = Surreal::<Any>::init();

        db.connect(settings.url.as_str())
            .await
            .map_err(|e| Error::store(format!("failed to connect to {}: {e}", settings.url)))?;

        db.use_ns(&settings.namespace)
            .use_db(&settings.database)
            .await
            .map_err(|e| Error::store(e.to_string()))?;

        info!(
            url = %settings.url,
            namespace = %settings.namespace,
            database = %settings.database,
            "Connected change store"
        );
        Ok(Self { db: Arc::new(db) })
    }

    /// In-memory instance.
    ///
    /// # Errors
    ///
    /// Returns `Error::Store` if the embedded engine fails to start.
    pub async fn in_memory() -> Result<Self> {
        Self::connect(&StoreSettings::default()).await
    }
}

#[async_trait]
impl ChangeStore for SurrealChangeStore {
    async fn load(&self, key: &ChangeKey) -> Result<Option<ChangeRecord>> {
        let stored: Option<StoredRecord> = self
            .db
            .select((TABLE, key.as_str()))
            .await
            .map_err(|e| Error::store(e.to_string()))?;
        stored.map(StoredRecord::into_record).transpose()
    }

    async fn save(&self, record: &ChangeRecord) -> Result<()> {
        let stored = StoredRecord::from_record(record)?;
        let _: Option<StoredRecord> = self
            .db
            .upsert((TABLE, record.key.as_str()))
            .content(stored)
            .await
            .map_err(|e| Error::store(e.to_string()))?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ChangeRecord>> {
        let stored: Vec<StoredRecord> = self
            .db
            .select(TABLE)
            .await
            .map_err(|e| Error::store(e.to_string()))?;
        stored
            .into_iter()
            .sorted_by(|a, b| a.key.cmp(&b.key))
            .map(StoredRecord::into_record)
            .collect()
    }
}
