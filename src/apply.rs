//! File-backed default update.

use std::path::{Path, PathBuf};

use accord_reaction::{ChangeKey, State};
use accord_reconciler::DefaultUpdate;
use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Document written for every applied change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedState {
    pub key: ChangeKey,
    pub state: State,
}

/// Writes the new state of an approved change to a JSON file.
///
/// The file is replaced through a sibling temporary file and a rename, so
/// readers see either the previous state or the new one.
#[derive(Debug, Clone)]
pub struct StateFileUpdate {
    path: PathBuf,
}

impl StateFileUpdate {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl DefaultUpdate for StateFileUpdate {
    async fn apply(&self, key: &ChangeKey, new: &State) -> anyhow::Result<()> {
        let document = AppliedState {
            key: key.clone(),
            state: new.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&document)?;

        let staging = self.path.with_extension("tmp");
        tokio::fs::write(&staging, &bytes)
            .await
            .with_context(|| format!("failed to write {}", staging.display()))?;
        tokio::fs::rename(&staging, &self.path)
            .await
            .with_context(|| format!("failed to replace {}", self.path.display()))?;

        info!(key = %key.short(), path = %self.path.display(), "Wrote applied state");
        Ok(())
    }
}
