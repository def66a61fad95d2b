//! The handler capability and its in-process variants.

use std::future::Future;
use std::sync::Arc;

use accord_core::StaticVerdict;
use async_trait::async_trait;

use crate::change::Change;
use crate::outcome::{Outcome, Reaction};

/// Pluggable code consulted about a proposed change.
///
/// Implementations may fail in any way: return an error, panic, hang, or
/// return nothing. The invocation boundary turns each of these into an
/// [`Outcome`]. A handler may be invoked again with the same change after a
/// partial update, so it must tolerate seeing state it already touched.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Registry name.
    fn name(&self) -> &str;

    /// React to a proposed change.
    async fn react(&self, change: Arc<Change>) -> anyhow::Result<Reaction>;
}

/// Handler backed by an async closure.
pub struct FnHandler<F> {
    name: String,
    react: F,
}

impl<F, Fut> FnHandler<F>
where
    F: Fn(Arc<Change>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Reaction>> + Send + 'static,
{
    pub fn new(name: impl Into<String>, react: F) -> Self {
        Self {
            name: name.into(),
            react,
        }
    }
}

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Arc<Change>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Reaction>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn react(&self, change: Arc<Change>) -> anyhow::Result<Reaction> {
        (self.react)(change).await
    }
}

/// Handler that returns the same verdict for every change.
#[derive(Debug, Clone)]
pub struct StaticHandler {
    name: String,
    verdict: StaticVerdict,
    reason: Option<String>,
}

impl StaticHandler {
    pub fn new(name: impl Into<String>, verdict: StaticVerdict, reason: Option<String>) -> Self {
        Self {
            name: name.into(),
            verdict,
            reason,
        }
    }

    fn reason_or(&self, fallback: &str) -> String {
        self.reason.clone().unwrap_or_else(|| fallback.to_string())
    }
}

#[async_trait]
impl Handler for StaticHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn react(&self, _change: Arc<Change>) -> anyhow::Result<Reaction> {
        let reaction = match self.verdict {
            StaticVerdict::Approved => Reaction::Explicit(Outcome::Approved),
            StaticVerdict::Handled => Reaction::Explicit(Outcome::Handled),
            StaticVerdict::Denied => {
                Reaction::Explicit(Outcome::denied(self.reason_or("denied by static handler")))
            }
            StaticVerdict::Failed => {
                Reaction::Explicit(Outcome::failed(self.reason_or("failed by static handler")))
            }
            StaticVerdict::Nothing => Reaction::Nothing,
        };
        Ok(reaction)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::state::State;

    fn change() -> Arc<Change> {
        Arc::new(Change::new(State::new(), State::new().with_config("k", 1)))
    }

    #[tokio::test]
    async fn test_static_handler_verdicts() {
        let deny = StaticHandler::new("deny", StaticVerdict::Denied, Some("nope".into()));
        assert_eq!(
            deny.react(change()).await.unwrap(),
            Reaction::Explicit(Outcome::denied("nope"))
        );

        let silent = StaticHandler::new("silent", StaticVerdict::Nothing, None);
        assert_eq!(silent.react(change()).await.unwrap(), Reaction::Nothing);

        let fail = StaticHandler::new("fail", StaticVerdict::Failed, None);
        assert_eq!(
            fail.react(change()).await.unwrap(),
            Reaction::Explicit(Outcome::failed("failed by static handler"))
        );
    }

    #[tokio::test]
    async fn test_fn_handler_sees_change() {
        let handler = FnHandler::new("inspect", |change: Arc<Change>| async move {
            let user = change.new_state().config().get("k").cloned();
            Ok::<_, anyhow::Error>(match user {
                Some(_) => Reaction::Explicit(Outcome::Handled),
                None => Reaction::Nothing,
            })
        });
        assert_eq!(handler.name(), "inspect");
        assert_eq!(
            handler.react(change()).await.unwrap(),
            Reaction::Explicit(Outcome::Handled)
        );
    }
}
