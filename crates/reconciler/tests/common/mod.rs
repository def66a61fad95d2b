//! Shared fixtures for reconciler integration tests.

#![allow(dead_code)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use accord_reaction::{Change, ChangeKey, Handler, HandlerRegistry, Outcome, Reaction, State};
use accord_reconciler::{
    BroadcastNoticeSink, ChangeStore, DefaultUpdate, InMemoryChangeStore, Reconciler,
    RetryPolicy,
};
use async_trait::async_trait;
use tokio::sync::Notify;

/// One scripted handler reply.
#[derive(Debug, Clone)]
pub enum Step {
    Reply(Outcome),
    Nothing,
    Error(&'static str),
    Panic(&'static str),
    Sleep(Duration, Outcome),
    /// Block until released through [`ScriptedHandler::release`].
    Gate(Outcome),
}

/// Handler that replays a script, then repeats its last step.
pub struct ScriptedHandler {
    name: String,
    script: Mutex<VecDeque<Step>>,
    last: Mutex<Step>,
    calls: AtomicUsize,
    seen: Mutex<Vec<Vec<u8>>>,
    gate: Notify,
}

impl ScriptedHandler {
    pub fn new(name: &str, steps: impl IntoIterator<Item = Step>) -> Arc<Self> {
        let script: VecDeque<Step> = steps.into_iter().collect();
        let last = script.back().cloned().unwrap_or(Step::Nothing);
        Arc::new(Self {
            name: name.to_string(),
            script: Mutex::new(script),
            last: Mutex::new(last),
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
            gate: Notify::new(),
        })
    }

    pub fn always(name: &str, step: Step) -> Arc<Self> {
        Self::new(name, [step])
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Canonical bytes of every change this handler received, in order.
    pub fn seen(&self) -> Vec<Vec<u8>> {
        self.seen.lock().unwrap().clone()
    }

    pub fn release(&self) {
        self.gate.notify_one();
    }

    fn next_step(&self) -> Step {
        let mut script = self.script.lock().unwrap();
        match script.pop_front() {
            Some(step) => {
                *self.last.lock().unwrap() = step.clone();
                step
            }
            None => self.last.lock().unwrap().clone(),
        }
    }
}

#[async_trait]
impl Handler for ScriptedHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn react(&self, change: Arc<Change>) -> anyhow::Result<Reaction> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen
            .lock()
            .unwrap()
            .push(change.canonical_bytes().unwrap());

        match self.next_step() {
            Step::Reply(outcome) => Ok(Reaction::Explicit(outcome)),
            Step::Nothing => Ok(Reaction::Nothing),
            Step::Error(message) => Err(anyhow::anyhow!(message)),
            Step::Panic(message) => panic!("{message}"),
            Step::Sleep(duration, outcome) => {
                tokio::time::sleep(duration).await;
                Ok(Reaction::Explicit(outcome))
            }
            Step::Gate(outcome) => {
                self.gate.notified().await;
                Ok(Reaction::Explicit(outcome))
            }
        }
    }
}

/// Default update that records every call and can be told to fail first.
#[derive(Default)]
pub struct RecordingUpdate {
    applied: Mutex<Vec<(ChangeKey, State)>>,
    calls: AtomicUsize,
    failures_left: AtomicUsize,
}

impl RecordingUpdate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing(times: usize) -> Arc<Self> {
        let update = Self::default();
        update.failures_left.store(times, Ordering::SeqCst);
        Arc::new(update)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn applied(&self) -> Vec<(ChangeKey, State)> {
        self.applied.lock().unwrap().clone()
    }
}

#[async_trait]
impl DefaultUpdate for RecordingUpdate {
    async fn apply(&self, key: &ChangeKey, new: &State) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            anyhow::bail!("state file is locked");
        }
        self.applied.lock().unwrap().push((key.clone(), new.clone()));
        Ok(())
    }
}

/// Millisecond backoff so tests finish quickly.
pub fn fast_policy(max_attempts: Option<u32>) -> RetryPolicy {
    RetryPolicy {
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(8),
        jitter_factor: 0.0,
        max_attempts,
        max_elapsed: None,
    }
}

pub fn change(user: &str) -> Change {
    Change::new(
        State::new()
            .with_config("user", "admin")
            .with_relation("db", serde_json::json!({"host": "db-0"})),
        State::new()
            .with_config("user", user)
            .with_relation("db", serde_json::json!({"host": "db-0"}))
            .with_runtime("unit", "mariadb/0"),
    )
}

pub struct Harness {
    pub reconciler: Reconciler,
    pub store: Arc<InMemoryChangeStore>,
    pub notices: BroadcastNoticeSink,
    pub update: Arc<RecordingUpdate>,
}

pub fn harness(handlers: &[Arc<ScriptedHandler>], policy: RetryPolicy) -> Harness {
    harness_with(handlers, policy, InMemoryChangeStore::new_arc(), RecordingUpdate::new())
}

pub fn harness_with(
    handlers: &[Arc<ScriptedHandler>],
    policy: RetryPolicy,
    store: Arc<InMemoryChangeStore>,
    update: Arc<RecordingUpdate>,
) -> Harness {
    let mut registry = HandlerRegistry::new();
    for handler in handlers {
        registry.register(Arc::clone(handler) as Arc<dyn Handler>).unwrap();
    }
    let notices = BroadcastNoticeSink::new();
    let reconciler = Reconciler::builder()
        .with_registry(registry)
        .with_store(Arc::clone(&store) as Arc<dyn ChangeStore>)
        .with_notices(Arc::new(notices.clone()))
        .with_default_update(Arc::clone(&update) as Arc<dyn DefaultUpdate>)
        .retry(policy)
        .invocation_timeout(Duration::from_secs(5))
        .build()
        .unwrap();
    Harness {
        reconciler,
        store,
        notices,
        update,
    }
}

/// Poll `check` until it holds, failing the test after two seconds.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}
