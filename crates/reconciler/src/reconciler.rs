//! Reconciler implementation.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use accord_core::AccordConfig;
use accord_reaction::{Change, ChangeKey, HandlerRegistry, InvocationBoundary};
use chrono::Utc;
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn, Instrument};

use crate::apply::{DefaultUpdate, TracingDefaultUpdate};
use crate::error::{Error, Result};
use crate::notice::{NoticeKind, NoticeSink, OperatorNotice, TracingNoticeSink};
use crate::record::{ChangeRecord, ChangeStatus};
use crate::retry::RetryPolicy;
use crate::shutdown::{ShutdownCoordinator, ShutdownListener, ShutdownSignal, ShutdownStats};
use crate::store::{ChangeStore, InMemoryChangeStore};
use crate::types::{Resolution, Submission};

/// How long aborted workers get to unwind before they are cancelled outright.
const ABORT_SETTLE: Duration = Duration::from_secs(1);

/// Configuration for the reconciler.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcilerConfig {
    /// Maximum handler invocations in flight across all keys.
    pub max_concurrent: usize,
    /// Upper bound on a single invocation.
    pub invocation_timeout: Duration,
    /// Time in-flight invocations get on shutdown.
    pub shutdown_grace: Duration,
    pub retry: RetryPolicy,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self::from(&AccordConfig::default())
    }
}

impl From<&AccordConfig> for ReconcilerConfig {
    fn from(config: &AccordConfig) -> Self {
        Self {
            max_concurrent: config.reconciler.max_concurrent,
            invocation_timeout: config.reconciler.invocation_timeout(),
            shutdown_grace: config.reconciler.shutdown_grace(),
            retry: RetryPolicy::from(&config.retry),
        }
    }
}

/// Keys currently owned by a worker.
#[derive(Debug, Default)]
struct ClaimRegistry {
    keys: Mutex<HashSet<ChangeKey>>,
}

impl ClaimRegistry {
    fn claim(self: &Arc<Self>, key: &ChangeKey) -> Result<Claim> {
        let mut keys = self.keys.lock().unwrap_or_else(PoisonError::into_inner);
        if !keys.insert(key.clone()) {
            return Err(Error::change_in_flight(key.as_str()));
        }
        Ok(Claim {
            registry: Arc::clone(self),
            key: key.clone(),
        })
    }
}

/// Exclusive right to drive one key. Released on drop.
#[derive(Debug)]
struct Claim {
    registry: Arc<ClaimRegistry>,
    key: ChangeKey,
}

impl Drop for Claim {
    fn drop(&mut self) {
        self.registry
            .keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

/// Counts a spawned worker until it ends, aborted or not.
struct Active(Arc<Shared>);

impl Active {
    fn enter(shared: &Arc<Shared>) -> Self {
        shared.active.send_modify(|n| *n += 1);
        Self(Arc::clone(shared))
    }
}

impl Drop for Active {
    fn drop(&mut self) {
        self.0.active.send_modify(|n| *n = n.saturating_sub(1));
    }
}

struct Shared {
    registry: HandlerRegistry,
    store: Arc<dyn ChangeStore>,
    notices: Arc<dyn NoticeSink>,
    update: Arc<dyn DefaultUpdate>,
    boundary: InvocationBoundary,
    config: ReconcilerConfig,
    permits: Arc<Semaphore>,
    claims: Arc<ClaimRegistry>,
    shutdown: Arc<ShutdownCoordinator>,
    active: watch::Sender<usize>,
}

/// Drives submitted changes through their handlers to a resolution.
pub struct Reconciler {
    shared: Arc<Shared>,
    workers: tokio::sync::Mutex<JoinSet<Result<Resolution>>>,
}

impl Reconciler {
    fn new(
        registry: HandlerRegistry,
        store: Arc<dyn ChangeStore>,
        notices: Arc<dyn NoticeSink>,
        update: Arc<dyn DefaultUpdate>,
        config: ReconcilerConfig,
        shutdown: Arc<ShutdownCoordinator>,
    ) -> Self {
        let (active, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                registry,
                store,
                notices,
                update,
                boundary: InvocationBoundary::new(config.invocation_timeout),
                permits: Arc::new(Semaphore::new(
                    config.max_concurrent.min(Semaphore::MAX_PERMITS),
                )),
                config,
                claims: Arc::default(),
                shutdown,
                active,
            }),
            workers: tokio::sync::Mutex::new(JoinSet::new()),
        }
    }

    pub fn builder() -> ReconcilerBuilder {
        ReconcilerBuilder::new()
    }

    /// Submit a change to `handler` and schedule it on a worker.
    ///
    /// A change identical to one already on record is not opened again:
    /// a denied change stays denied and a resolved change stays resolved.
    ///
    /// # Errors
    ///
    /// Returns an error if the handler is unknown, the new state is invalid,
    /// the store fails, or shutdown has begun.
    pub async fn submit(&self, handler: &str, change: Change) -> Result<Submission> {
        self.ensure_running()?;
        self.shared.registry.get(handler)?;
        change.new_state().validate()?;

        let key = change.key()?;
        let claim = match self.shared.claims.claim(&key) {
            Ok(claim) => claim,
            Err(e) if e.is_in_flight() => return Ok(Submission::InFlight { key }),
            Err(e) => return Err(e),
        };

        let record = match self.shared.store.load(&key).await? {
            Some(record) => record,
            None => {
                let record = ChangeRecord::new(handler, change, Utc::now())?;
                self.shared.store.save(&record).await?;
                info!(key = %key.short(), handler, "Change submitted");
                record
            }
        };
        if record.handler != handler {
            debug!(
                key = %key.short(),
                recorded = %record.handler,
                requested = handler,
                "Change already on record under another handler"
            );
        }

        match record.status {
            ChangeStatus::Denied => {
                let reason = record.last_reason().unwrap_or_default().to_string();
                info!(
                    key = %key.short(),
                    %reason,
                    "Change was denied before, not invoking handler"
                );
                Ok(Submission::Denied { key, reason })
            }
            ChangeStatus::Stuck => Ok(Submission::Stuck { key }),
            status @ ChangeStatus::Handled => Ok(Submission::Resolved { key, status }),
            status @ ChangeStatus::Approved if record.applied => {
                Ok(Submission::Resolved { key, status })
            }
            ChangeStatus::Approved | ChangeStatus::Pending | ChangeStatus::Retrying => {
                self.spawn(claim).await;
                Ok(Submission::Accepted { key })
            }
        }
    }

    /// Drive one record to a resolution in the calling task.
    ///
    /// # Errors
    ///
    /// Returns `Error::ChangeInFlight` if another worker owns the key,
    /// `Error::ChangeNotFound` if there is no record, or a store error.
    pub async fn reconcile(&self, key: &ChangeKey) -> Result<Resolution> {
        self.ensure_running()?;
        let claim = self.shared.claims.claim(key)?;
        Arc::clone(&self.shared).drive(claim).await
    }

    /// Schedule every record that still has work left. Call on start-up.
    ///
    /// Returns the number of workers started.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be listed or shutdown has begun.
    pub async fn resume(&self) -> Result<usize> {
        self.ensure_running()?;
        let mut scheduled = 0;
        for record in self.shared.store.list().await?.iter().filter(|r| r.is_open()) {
            match self.shared.claims.claim(&record.key) {
                Ok(claim) => {
                    self.spawn(claim).await;
                    scheduled += 1;
                }
                Err(_) => debug!(key = %record.key.short(), "Already in flight, not resuming"),
            }
        }
        info!(scheduled, "Resumed open changes");
        Ok(scheduled)
    }

    /// Reopen a stuck record with a fresh retry budget and schedule it.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidTransition` unless the record is stuck, and
    /// `Error::ChangeNotFound` if there is no record.
    pub async fn retrigger(&self, key: &ChangeKey) -> Result<()> {
        self.ensure_running()?;
        let claim = self.shared.claims.claim(key)?;
        let mut record = self
            .shared
            .store
            .load(key)
            .await?
            .ok_or_else(|| Error::change_not_found(key.as_str()))?;
        record.retrigger(Utc::now())?;
        self.shared.store.save(&record).await?;
        info!(key = %key.short(), attempts = record.attempts, "Change retriggered");
        self.spawn(claim).await;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns a store error.
    pub async fn record(&self, key: &ChangeKey) -> Result<Option<ChangeRecord>> {
        self.shared.store.load(key).await
    }

    /// # Errors
    ///
    /// Returns a store error.
    pub async fn records(&self) -> Result<Vec<ChangeRecord>> {
        self.shared.store.list().await
    }

    /// Wait until no spawned worker is running.
    pub async fn wait_idle(&self) {
        let mut active = self.shared.active.subscribe();
        let _ = active.wait_for(|n| *n == 0).await;
        let mut workers = self.workers.lock().await;
        while let Some(exit) = workers.try_join_next() {
            log_worker_exit(&exit);
        }
    }

    /// Stop scheduling, let in-flight invocations finish within `grace`,
    /// then cancel the rest.
    pub async fn shutdown(&self, grace: Duration) -> ShutdownStats {
        let started = Instant::now();
        self.shared.shutdown.initiate(ShutdownSignal::Programmatic);
        let mut stats = ShutdownStats {
            signal: self.shared.shutdown.signal(),
            ..ShutdownStats::default()
        };

        let mut workers = self.workers.lock().await;
        info!(
            workers = workers.len(),
            grace_ms = grace.as_millis(),
            "Draining workers"
        );

        let drained = tokio::time::timeout(grace, join_all(&mut workers, &mut stats)).await;
        if drained.is_err() {
            warn!(
                remaining = workers.len(),
                "Grace period over, cancelling in-flight invocations"
            );
            self.shared.shutdown.abort_in_flight();
            let settled =
                tokio::time::timeout(ABORT_SETTLE, join_all(&mut workers, &mut stats)).await;
            if settled.is_err() {
                workers.abort_all();
                join_all(&mut workers, &mut stats).await;
            }
        }

        self.shared.shutdown.complete();
        stats.total_duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        info!(
            resolved = stats.workers_resolved,
            interrupted = stats.workers_interrupted,
            failed = stats.workers_failed,
            aborted = stats.workers_aborted,
            duration_ms = stats.total_duration_ms,
            "Shutdown complete"
        );
        stats
    }

    /// Shared coordinator, e.g. for installing OS signal handlers.
    pub fn shutdown_coordinator(&self) -> Arc<ShutdownCoordinator> {
        Arc::clone(&self.shared.shutdown)
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.shared.registry
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.shared.config
    }

    fn ensure_running(&self) -> Result<()> {
        if self.shared.shutdown.is_shutdown_initiated() {
            Err(Error::ShuttingDown)
        } else {
            Ok(())
        }
    }

    async fn spawn(&self, claim: Claim) {
        let span = tracing::info_span!("worker", key = %claim.key.short());
        let active = Active::enter(&self.shared);
        let shared = Arc::clone(&self.shared);

        let mut workers = self.workers.lock().await;
        while let Some(exit) = workers.try_join_next() {
            log_worker_exit(&exit);
        }
        workers.spawn(
            async move {
                let _active = active;
                shared.drive(claim).await
            }
            .instrument(span),
        );
    }
}

impl Shared {
    /// Worker loop for one key. All writes to the record happen here.
    async fn drive(self: Arc<Self>, claim: Claim) -> Result<Resolution> {
        let key = claim.key.clone();
        let mut listener = self.shutdown.listener();

        loop {
            let mut record = self
                .store
                .load(&key)
                .await?
                .ok_or_else(|| Error::change_not_found(key.as_str()))?;

            if let Some(resolution) = Resolution::of(&record) {
                return Ok(resolution);
            }

            let wait = record.wait_before_next(Utc::now());
            if !wait.is_zero() {
                debug!(
                    key = %key.short(),
                    attempts = record.attempts,
                    wait_ms = wait.as_millis(),
                    "Backing off"
                );
                tokio::select! {
                    () = tokio::time::sleep(wait) => {}
                    () = listener.draining() => return Ok(interrupted(&record)),
                }
            }
            if self.shutdown.is_shutdown_initiated() {
                return Ok(interrupted(&record));
            }

            if record.needs_apply() {
                self.apply(&mut record).await?;
                continue;
            }
            if !self.attempt(&mut record, &mut listener).await? {
                return Ok(interrupted(&record));
            }
        }
    }

    /// Run one invocation and persist its outcome.
    ///
    /// Returns `false` if shutdown cut the attempt short; nothing is recorded
    /// in that case.
    async fn attempt(
        &self,
        record: &mut ChangeRecord,
        listener: &mut ShutdownListener,
    ) -> Result<bool> {
        let handler = self.registry.get(&record.handler)?;
        let permit = tokio::select! {
            permit = Arc::clone(&self.permits).acquire_owned() => {
                permit.map_err(|_| Error::ShuttingDown)?
            }
            () = listener.draining() => return Ok(false),
        };

        let attempt = record.attempts + 1;
        let started_at = Utc::now();
        debug!(key = %record.key.short(), handler = %record.handler, attempt, "Invoking handler");

        let invocation = tokio::select! {
            invocation = self.boundary.invoke(handler, &record.change) => invocation,
            () = listener.aborting() => {
                warn!(key = %record.key.short(), attempt, "Invocation cancelled by shutdown");
                return Ok(false);
            }
        };
        drop(permit);

        let status = record.record_outcome(&invocation, started_at, &self.config.retry)?;
        self.store.save(record).await?;

        let reason = invocation.outcome.reason().unwrap_or_default();
        match status {
            ChangeStatus::Approved | ChangeStatus::Handled => info!(
                key = %record.key.short(),
                attempt,
                status = %status,
                implicit = invocation.implicit,
                "Change resolved"
            ),
            ChangeStatus::Denied => {
                info!(key = %record.key.short(), attempt, %reason, "Change denied");
                self.notify(NoticeKind::Denied, record).await;
            }
            ChangeStatus::Stuck => {
                warn!(key = %record.key.short(), attempt, %reason, "Retry budget exhausted");
                self.notify(NoticeKind::Stuck, record).await;
            }
            ChangeStatus::Pending | ChangeStatus::Retrying => warn!(
                key = %record.key.short(),
                attempt,
                %reason,
                next_in_ms = record.wait_before_next(Utc::now()).as_millis(),
                "Attempt failed, will retry"
            ),
        }
        Ok(true)
    }

    /// Apply the default update of an approved record. A failure schedules
    /// the update again and never re-invokes the handler.
    async fn apply(&self, record: &mut ChangeRecord) -> Result<()> {
        match self.update.apply(&record.key, record.change.new_state()).await {
            Ok(()) => {
                record.mark_applied(Utc::now());
                self.store.save(record).await?;
                info!(key = %record.key.short(), "Default update applied");
            }
            Err(e) => {
                let failure = Error::default_update_failed(record.key.as_str(), format!("{e:#}"));
                warn!(
                    key = %record.key.short(),
                    failures = record.apply_failures + 1,
                    error = %failure,
                    "Default update failed, will retry"
                );
                record.record_apply_failure(format!("{e:#}"), &self.config.retry, Utc::now());
                self.store.save(record).await?;
            }
        }
        Ok(())
    }

    async fn notify(&self, kind: NoticeKind, record: &ChangeRecord) {
        let notice = OperatorNotice::from_record(kind, record);
        if let Err(e) = self.notices.emit(&notice).await {
            warn!(
                key = %record.key.short(),
                kind = %kind,
                error = %e,
                "Failed to deliver operator notice"
            );
        }
    }
}

fn interrupted(record: &ChangeRecord) -> Resolution {
    debug!(key = %record.key.short(), "Worker stopped by shutdown");
    Resolution::Interrupted {
        attempts: record.attempts,
    }
}

async fn join_all(workers: &mut JoinSet<Result<Resolution>>, stats: &mut ShutdownStats) {
    while let Some(exit) = workers.join_next().await {
        log_worker_exit(&exit);
        match exit {
            Ok(Ok(Resolution::Interrupted { .. })) => stats.workers_interrupted += 1,
            Ok(Ok(_)) => stats.workers_resolved += 1,
            Err(e) if e.is_cancelled() => stats.workers_aborted += 1,
            Ok(Err(_)) | Err(_) => stats.workers_failed += 1,
        }
    }
}

fn log_worker_exit(exit: &std::result::Result<Result<Resolution>, JoinError>) {
    match exit {
        Ok(Ok(resolution)) => debug!(%resolution, "Worker finished"),
        Ok(Err(e)) => error!(error = %e, "Worker failed"),
        Err(e) if e.is_cancelled() => debug!("Worker cancelled"),
        Err(e) => error!(error = %e, "Worker panicked"),
    }
}

/// Builder for Reconciler.
pub struct ReconcilerBuilder {
    registry: Option<HandlerRegistry>,
    store: Option<Arc<dyn ChangeStore>>,
    notices: Option<Arc<dyn NoticeSink>>,
    update: Option<Arc<dyn DefaultUpdate>>,
    shutdown: Option<Arc<ShutdownCoordinator>>,
    config: ReconcilerConfig,
}

impl ReconcilerBuilder {
    pub fn new() -> Self {
        Self {
            registry: None,
            store: None,
            notices: None,
            update: None,
            shutdown: None,
            config: ReconcilerConfig::default(),
        }
    }

    #[must_use]
    pub fn with_registry(mut self, registry: HandlerRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Defaults to an in-memory store.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn ChangeStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Defaults to logging notices.
    #[must_use]
    pub fn with_notices(mut self, notices: Arc<dyn NoticeSink>) -> Self {
        self.notices = Some(notices);
        self
    }

    /// Defaults to logging the new state.
    #[must_use]
    pub fn with_default_update(mut self, update: Arc<dyn DefaultUpdate>) -> Self {
        self.update = Some(update);
        self
    }

    #[must_use]
    pub fn with_shutdown(mut self, shutdown: Arc<ShutdownCoordinator>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: ReconcilerConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn max_concurrent(mut self, max: usize) -> Self {
        self.config.max_concurrent = max;
        self
    }

    #[must_use]
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.config.retry = policy;
        self
    }

    #[must_use]
    pub fn invocation_timeout(mut self, timeout: Duration) -> Self {
        self.config.invocation_timeout = timeout;
        self
    }

    /// Build the reconciler.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` without a registry or with zero
    /// concurrency or timeout.
    pub fn build(self) -> Result<Reconciler> {
        let registry = self
            .registry
            .ok_or_else(|| Error::invalid_config("handler registry is required"))?;
        if self.config.max_concurrent == 0 {
            return Err(Error::invalid_config("max_concurrent must be at least 1"));
        }
        if self.config.invocation_timeout.is_zero() {
            return Err(Error::invalid_config("invocation timeout must be positive"));
        }

        Ok(Reconciler::new(
            registry,
            self.store.unwrap_or_else(|| InMemoryChangeStore::new_arc()),
            self.notices.unwrap_or_else(|| Arc::new(TracingNoticeSink)),
            self.update.unwrap_or_else(|| Arc::new(TracingDefaultUpdate)),
            self.config,
            self.shutdown.unwrap_or_default(),
        ))
    }
}

impl Default for ReconcilerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
