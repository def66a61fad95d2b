//! The reaction model for Accord.
//!
//! A handler is consulted about a proposed [`Change`] and answers with an
//! [`Outcome`]:
//!
//! - **Approved**: go ahead; the orchestrator applies its default update
//! - **Handled**: the handler applied the change itself
//! - **Denied**: permanent rejection of this exact change
//! - **Failed**: try again later with the same arguments
//!
//! Handler code only ever runs inside the [`InvocationBoundary`], which
//! converts errors, panics, timeouts and malformed replies into `Failed`
//! outcomes and a missing reply into an implicit `Approved`.
//!
//! # Example
//!
//! ```ignore
//! use accord_reaction::{Change, FnHandler, InvocationBoundary, Outcome, Reaction, State};
//! use std::{sync::Arc, time::Duration};
//!
//! let handler = Arc::new(FnHandler::new("users", |change: Arc<Change>| async move {
//!     if change.diff().config().contains_key("user") {
//!         return Ok(Reaction::Explicit(Outcome::denied("user is immutable")));
//!     }
//!     Ok(Reaction::Nothing)
//! }));
//!
//! let change = Change::new(State::new(), State::new().with_config("user", "app"));
//! let invocation = InvocationBoundary::new(Duration::from_secs(30))
//!     .invoke(handler, &change)
//!     .await;
//! ```

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod boundary;
pub mod change;
pub mod error;
pub mod handler;
pub mod outcome;
pub mod process;
pub mod registry;
pub mod state;

pub use boundary::{Invocation, InvocationBoundary};
pub use change::{Change, ChangeKey};
pub use error::{Error, Result};
pub use handler::{FnHandler, Handler, StaticHandler};
pub use outcome::{FaultDetail, FaultKind, Outcome, Reaction, FAULT_REASON, TIMEOUT_REASON};
pub use process::ProcessHandler;
pub use registry::HandlerRegistry;
pub use state::{Diff, Namespace, Section, State};
