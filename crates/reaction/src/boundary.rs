//! The invocation boundary: the one place handler code runs.
//!
//! Whatever a handler does (returns, errors, panics, hangs, returns nothing,
//! returns garbage), [`InvocationBoundary::invoke`] produces an [`Outcome`].
//! Nothing a handler does propagates past this module as a panic or error.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::change::Change;
use crate::handler::Handler;
use crate::outcome::{FaultDetail, FaultKind, Outcome, Reaction, FAULT_REASON, TIMEOUT_REASON};

/// Result of one handler invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub outcome: Outcome,
    /// The handler returned nothing and `outcome` is the implied approval.
    pub implicit: bool,
    pub elapsed: Duration,
}

/// Aborts the wrapped task when dropped, so a cancelled invocation does not
/// leave the handler running detached.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Runs handlers in isolated tasks under a time limit.
#[derive(Debug, Clone, Copy)]
pub struct InvocationBoundary {
    timeout: Duration,
}

impl InvocationBoundary {
    #[must_use]
    pub const fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Invoke `handler` with `change` and classify the result.
    ///
    /// The handler receives its own copy of the change, so it cannot alter
    /// the arguments of a later attempt.
    pub async fn invoke(&self, handler: Arc<dyn Handler>, change: &Change) -> Invocation {
        let started = Instant::now();
        let name = handler.name().to_string();
        let input = Arc::new(change.clone());

        let mut task = AbortOnDrop(tokio::spawn(async move { handler.react(input).await }));
        let joined = tokio::time::timeout(self.timeout, &mut task.0).await;

        let (outcome, implicit) = match joined {
            Err(_) => {
                warn!(handler = %name, timeout_ms = self.timeout.as_millis(), "Handler timed out");
                (
                    Outcome::failed_with(TIMEOUT_REASON, FaultDetail::timeout(self.timeout)),
                    false,
                )
            }
            Ok(Err(join_error)) if join_error.is_panic() => {
                let detail = FaultDetail::from_panic(join_error.into_panic().as_ref());
                warn!(handler = %name, panic = %detail.message, "Handler panicked");
                (Outcome::failed_with(FAULT_REASON, detail), false)
            }
            Ok(Err(join_error)) => {
                warn!(handler = %name, error = %join_error, "Handler task ended without a result");
                (
                    Outcome::failed_with(
                        FAULT_REASON,
                        FaultDetail::new(FaultKind::Aborted, join_error.to_string()),
                    ),
                    false,
                )
            }
            Ok(Ok(Err(err))) => {
                let detail = FaultDetail::from_error(&err);
                warn!(handler = %name, error = %detail.message, "Handler returned an error");
                (Outcome::failed_with(FAULT_REASON, detail), false)
            }
            Ok(Ok(Ok(reaction))) => classify(&name, reaction),
        };

        let elapsed = started.elapsed();
        debug!(
            handler = %name,
            outcome = outcome.label(),
            implicit,
            elapsed_ms = elapsed.as_millis(),
            "Invocation finished"
        );
        Invocation {
            outcome,
            implicit,
            elapsed,
        }
    }
}

fn classify(name: &str, reaction: Reaction) -> (Outcome, bool) {
    let decoded = match reaction {
        Reaction::Explicit(outcome) => Ok(Some(outcome)),
        Reaction::Nothing => Ok(None),
        Reaction::Wire(value) => Outcome::from_wire(value),
    };
    match decoded {
        Ok(Some(outcome)) => (outcome, false),
        Ok(None) => {
            warn!(handler = %name, "Handler returned no outcome, treating as approved");
            (Outcome::Approved, true)
        }
        Err(violation) => {
            warn!(handler = %name, %violation, "Handler returned a malformed outcome");
            (
                Outcome::failed_with(
                    format!("handler returned a malformed outcome: {violation}"),
                    FaultDetail::new(FaultKind::ProtocolViolation, violation),
                ),
                false,
            )
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::panic)]

    use super::*;
    use crate::handler::FnHandler;
    use crate::state::State;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn change() -> Change {
        Change::new(State::new(), State::new().with_config("user", "app"))
    }

    fn boundary() -> InvocationBoundary {
        InvocationBoundary::new(Duration::from_millis(200))
    }

    #[tokio::test]
    async fn test_explicit_outcome_passes_through() {
        let handler = Arc::new(FnHandler::new("deny", |_| async {
            Ok::<_, anyhow::Error>(Reaction::Explicit(Outcome::denied("not today")))
        }));
        let invocation = boundary().invoke(handler, &change()).await;
        assert_eq!(invocation.outcome, Outcome::denied("not today"));
        assert!(!invocation.implicit);
    }

    #[tokio::test]
    async fn test_nothing_is_implicit_approval() {
        let handler = Arc::new(FnHandler::new("silent", |_| async {
            Ok::<_, anyhow::Error>(Reaction::Nothing)
        }));
        let invocation = boundary().invoke(handler, &change()).await;
        assert_eq!(invocation.outcome, Outcome::Approved);
        assert!(invocation.implicit);
    }

    #[tokio::test]
    async fn test_error_becomes_failed_with_cause() {
        let handler = Arc::new(FnHandler::new("broken", |_| async {
            Err::<Reaction, _>(anyhow::anyhow!("socket closed").context("could not connect"))
        }));
        let invocation = boundary().invoke(handler, &change()).await;
        let Outcome::Failed { reason, cause } = invocation.outcome else {
            panic!("expected failure");
        };
        assert_eq!(reason, FAULT_REASON);
        let cause = cause.unwrap();
        assert_eq!(cause.kind, FaultKind::Error);
        assert_eq!(cause.message, "could not connect");
        assert_eq!(cause.chain, vec!["socket closed".to_string()]);
    }

    #[tokio::test]
    async fn test_panic_is_contained() {
        let handler = Arc::new(FnHandler::new("panics", |_| async {
            if true {
                panic!("handler exploded");
            }
            Ok::<_, anyhow::Error>(Reaction::Nothing)
        }));
        let invocation = boundary().invoke(handler, &change()).await;
        let Outcome::Failed { reason, cause } = invocation.outcome else {
            panic!("expected failure");
        };
        assert_eq!(reason, FAULT_REASON);
        let cause = cause.unwrap();
        assert_eq!(cause.kind, FaultKind::Panic);
        assert_eq!(cause.message, "handler exploded");
    }

    #[tokio::test]
    async fn test_hang_times_out_and_task_is_aborted() {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&finished);
        let handler = Arc::new(FnHandler::new("hangs", move |_| {
            let flag = Arc::clone(&flag);
            async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                flag.store(true, Ordering::SeqCst);
                Ok::<_, anyhow::Error>(Reaction::Nothing)
            }
        }));
        let boundary = InvocationBoundary::new(Duration::from_millis(50));
        let invocation = boundary.invoke(handler, &change()).await;

        let Outcome::Failed { reason, cause } = invocation.outcome else {
            panic!("expected failure");
        };
        assert_eq!(reason, TIMEOUT_REASON);
        assert_eq!(cause.unwrap().kind, FaultKind::Timeout);
        assert!(invocation.elapsed < Duration::from_secs(5));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_malformed_wire_outcome_is_failure() {
        let handler = Arc::new(FnHandler::new("garbage", |_| async {
            Ok::<_, anyhow::Error>(Reaction::Wire(json!({"verdict": "yes"})))
        }));
        let invocation = boundary().invoke(handler, &change()).await;
        let Outcome::Failed { reason, cause } = invocation.outcome else {
            panic!("expected failure");
        };
        assert!(reason.starts_with("handler returned a malformed outcome"));
        assert_eq!(cause.unwrap().kind, FaultKind::ProtocolViolation);
    }

    #[tokio::test]
    async fn test_wire_null_is_implicit_approval() {
        let handler = Arc::new(FnHandler::new("null", |_| async {
            Ok::<_, anyhow::Error>(Reaction::Wire(serde_json::Value::Null))
        }));
        let invocation = boundary().invoke(handler, &change()).await;
        assert_eq!(invocation.outcome, Outcome::Approved);
        assert!(invocation.implicit);
    }

    #[tokio::test]
    async fn test_handler_receives_identical_arguments() {
        let expected = change();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler: Arc<dyn Handler> = Arc::new(FnHandler::new("record", move |c: Arc<Change>| {
            sink.lock().unwrap().push((*c).clone());
            async { Ok::<_, anyhow::Error>(Reaction::Explicit(Outcome::failed("again"))) }
        }));
        for _ in 0..3 {
            boundary().invoke(Arc::clone(&handler), &expected).await;
        }
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert!(seen.iter().all(|c| *c == expected));
    }
}
