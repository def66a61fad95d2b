//! Graceful shutdown coordination.
//!
//! Shutdown runs in two steps. `Draining` stops scheduling and ends backoff
//! sleeps immediately while in-flight invocations keep running. `Aborting`
//! follows once the grace period is over and cancels whatever is still in
//! flight. A cancelled attempt is never recorded, so its change resumes on
//! the next start.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Shutdown signal types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShutdownSignal {
    /// SIGTERM signal received
    Sigterm,
    /// SIGINT signal received (Ctrl+C)
    Sigint,
    /// Programmatic shutdown requested
    Programmatic,
}

impl std::fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sigterm => write!(f, "SIGTERM"),
            Self::Sigint => write!(f, "SIGINT"),
            Self::Programmatic => write!(f, "PROGRAMMATIC"),
        }
    }
}

/// Shutdown progress, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ShutdownPhase {
    /// Normal operation
    Running,
    /// No new work; waiting for in-flight invocations
    Draining,
    /// Grace period over; in-flight invocations are cancelled
    Aborting,
    /// All workers have stopped
    Complete,
}

/// Shared shutdown state. Cheap to observe from any task.
#[derive(Debug)]
pub struct ShutdownCoordinator {
    initiated: AtomicBool,
    signal: OnceLock<ShutdownSignal>,
    phase_tx: watch::Sender<ShutdownPhase>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (phase_tx, _) = watch::channel(ShutdownPhase::Running);
        Self {
            initiated: AtomicBool::new(false),
            signal: OnceLock::new(),
            phase_tx,
        }
    }

    pub fn phase(&self) -> ShutdownPhase {
        *self.phase_tx.borrow()
    }

    pub fn is_shutdown_initiated(&self) -> bool {
        self.initiated.load(Ordering::Acquire)
    }

    /// The signal that started shutdown, if any.
    pub fn signal(&self) -> Option<ShutdownSignal> {
        self.signal.get().copied()
    }

    pub fn listener(&self) -> ShutdownListener {
        ShutdownListener {
            rx: self.phase_tx.subscribe(),
        }
    }

    /// Start draining. Returns `false` if shutdown was already under way.
    pub fn initiate(&self, signal: ShutdownSignal) -> bool {
        if self
            .initiated
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(signal = %signal, "Shutdown already in progress, ignoring duplicate signal");
            return false;
        }
        let _ = self.signal.set(signal);
        info!(
            signal = %signal,
            subscribers = self.phase_tx.receiver_count(),
            "Initiating graceful shutdown"
        );
        self.advance(ShutdownPhase::Draining);
        true
    }

    /// Cancel in-flight invocations.
    pub fn abort_in_flight(&self) {
        self.advance(ShutdownPhase::Aborting);
    }

    pub fn complete(&self) {
        self.advance(ShutdownPhase::Complete);
    }

    /// Phases only move forward.
    fn advance(&self, phase: ShutdownPhase) {
        self.phase_tx.send_if_modified(|current| {
            if phase > *current {
                *current = phase;
                true
            } else {
                false
            }
        });
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-task view of the shutdown phase.
#[derive(Debug, Clone)]
pub struct ShutdownListener {
    rx: watch::Receiver<ShutdownPhase>,
}

impl ShutdownListener {
    /// Resolves once draining has begun.
    pub async fn draining(&mut self) {
        self.reached(ShutdownPhase::Draining).await;
    }

    /// Resolves once in-flight work must be cancelled.
    pub async fn aborting(&mut self) {
        self.reached(ShutdownPhase::Aborting).await;
    }

    async fn reached(&mut self, phase: ShutdownPhase) {
        if self.rx.wait_for(|current| *current >= phase).await.is_err() {
            // Coordinator gone: nothing will ever ask us to stop.
            std::future::pending::<()>().await;
        }
    }
}

/// Statistics about the shutdown process
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownStats {
    /// Signal that triggered shutdown
    pub signal: Option<ShutdownSignal>,
    /// Workers that reached a resolution while draining
    pub workers_resolved: usize,
    /// Workers that stopped early and left their change open
    pub workers_interrupted: usize,
    /// Workers that ended with an error
    pub workers_failed: usize,
    /// Workers cancelled after the grace period
    pub workers_aborted: usize,
    /// Total shutdown duration in milliseconds
    pub total_duration_ms: u64,
}

/// Install OS signal handlers (SIGTERM, SIGINT) that start draining.
pub fn install_signal_handlers(
    coordinator: Arc<ShutdownCoordinator>,
) -> tokio::task::JoinHandle<()> {
    info!("Installing OS signal handlers");

    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    error!(error = %e, "Failed to install SIGTERM handler");
                    return;
                }
            };

            let mut sigint = match signal(SignalKind::interrupt()) {
                Ok(s) => s,
                Err(e) => {
                    error!(error = %e, "Failed to install SIGINT handler");
                    return;
                }
            };

            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM");
                    coordinator.initiate(ShutdownSignal::Sigterm);
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT");
                    coordinator.initiate(ShutdownSignal::Sigint);
                }
            }
        }

        #[cfg(not(unix))]
        {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for Ctrl+C");
                return;
            }

            info!("Received Ctrl+C");
            coordinator.initiate(ShutdownSignal::Sigint);
        }
    })
}
