//! Named handlers available to the reconciler.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use accord_core::HandlerSpec;

use crate::error::{Error, Result};
use crate::handler::{Handler, StaticHandler};
use crate::process::ProcessHandler;

#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: BTreeMap<String, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from configured handler specs.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidHandler` if a spec cannot be turned into a handler.
    pub fn from_specs(specs: &BTreeMap<String, HandlerSpec>) -> Result<Self> {
        let mut registry = Self::new();
        for (name, spec) in specs {
            let handler: Arc<dyn Handler> = match spec {
                HandlerSpec::Static { outcome, reason } => {
                    Arc::new(StaticHandler::new(name.clone(), *outcome, reason.clone()))
                }
                HandlerSpec::Process {
                    command,
                    env,
                    working_dir,
                } => Arc::new(
                    ProcessHandler::new(name.clone(), command)?
                        .with_env(env.clone())
                        .with_working_dir(working_dir.clone()),
                ),
            };
            registry.register(handler)?;
        }
        Ok(registry)
    }

    /// Register a handler under its own name.
    ///
    /// # Errors
    ///
    /// Returns `Error::DuplicateHandler` if the name is taken.
    pub fn register(&mut self, handler: Arc<dyn Handler>) -> Result<()> {
        let name = handler.name().to_string();
        if self.handlers.contains_key(&name) {
            return Err(Error::duplicate_handler(name));
        }
        self.handlers.insert(name, handler);
        Ok(())
    }

    /// Builder form of [`register`](Self::register).
    ///
    /// # Errors
    ///
    /// Returns `Error::DuplicateHandler` if the name is taken.
    pub fn with(mut self, handler: Arc<dyn Handler>) -> Result<Self> {
        self.register(handler)?;
        Ok(self)
    }

    /// # Errors
    ///
    /// Returns `Error::UnknownHandler` if nothing is registered under `name`.
    pub fn get(&self, name: &str) -> Result<Arc<dyn Handler>> {
        self.handlers
            .get(name)
            .cloned()
            .ok_or_else(|| Error::unknown_handler(name))
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}
