//! Reconciliation driver for Accord.
//!
//! Every submitted change gets a durable [`ChangeRecord`] keyed by the
//! change's content hash. A worker drives the record through its handler
//! until the outcome settles:
//!
//! - **Approved**: the [`DefaultUpdate`] applies `new`, exactly once
//! - **Handled**: nothing more to do
//! - **Denied**: closed for good; an [`OperatorNotice`] is emitted
//! - **Failed**: retried with identical arguments under a [`RetryPolicy`],
//!   until the budget runs out and the record is reported **Stuck**
//!
//! # Key Concepts
//!
//! ## One worker per key
//!
//! A key is driven by at most one worker at a time. Distinct keys run in
//! parallel, bounded by `max_concurrent` invocations.
//!
//! ## Restarts
//!
//! Records are saved after every step. A new [`Reconciler`] over the same
//! [`ChangeStore`] picks up open records with [`Reconciler::resume`].
//!
//! # Example
//!
//! ```ignore
//! use accord_reaction::{Change, HandlerRegistry, State, StaticHandler};
//! use accord_reconciler::Reconciler;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let registry = HandlerRegistry::new().with(Arc::new(StaticHandler::new(
//!         "allow",
//!         accord_core::StaticVerdict::Approved,
//!         None,
//!     )))?;
//!     let reconciler = Reconciler::builder().with_registry(registry).build()?;
//!
//!     let change = Change::new(State::new(), State::new().with_config("user", "app"));
//!     let submission = reconciler.submit("allow", change).await?;
//!     reconciler.wait_idle().await;
//!     println!("{:?}", reconciler.record(submission.key()).await?);
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod apply;
pub mod error;
pub mod notice;
pub mod reconciler;
pub mod record;
pub mod retry;
pub mod shutdown;
pub mod store;
pub mod surreal_store;
pub mod types;

// Re-export main types
pub use apply::{DefaultUpdate, TracingDefaultUpdate};
pub use error::{Error, Result};
pub use notice::{
    BroadcastNoticeSink, FanoutNoticeSink, NoticeKind, NoticeSink, OperatorNotice,
    TracingNoticeSink,
};
pub use reconciler::{Reconciler, ReconcilerBuilder, ReconcilerConfig};
pub use record::{AttemptRecord, ChangeRecord, ChangeStatus};
pub use retry::RetryPolicy;
pub use shutdown::{
    install_signal_handlers, ShutdownCoordinator, ShutdownListener, ShutdownPhase,
    ShutdownSignal, ShutdownStats,
};
pub use store::{ChangeStore, InMemoryChangeStore, TracingChangeStore};
pub use surreal_store::SurrealChangeStore;
pub use types::{Resolution, Submission};
