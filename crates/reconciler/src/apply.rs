//! The default update applied to approved changes.

use accord_reaction::{ChangeKey, State};
use async_trait::async_trait;
use tracing::info;

/// Applies the proposed state of an approved change.
///
/// Called once per approved change until it succeeds, and never for a change
/// the handler applied itself.
#[async_trait]
pub trait DefaultUpdate: Send + Sync {
    async fn apply(&self, key: &ChangeKey, new: &State) -> anyhow::Result<()>;
}

/// Default update that only records the new state in the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingDefaultUpdate;

#[async_trait]
impl DefaultUpdate for TracingDefaultUpdate {
    async fn apply(&self, key: &ChangeKey, new: &State) -> anyhow::Result<()> {
        info!(
            key = %key.short(),
            config = new.config().len(),
            relations = new.relations().len(),
            runtime = new.runtime().len(),
            "Applying default update"
        );
        Ok(())
    }
}
