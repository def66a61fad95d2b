//! State snapshots and the diff between them.

use std::collections::BTreeMap;
use std::fmt;

use itertools::{EitherOrBoth, Itertools};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// One namespace of a [`State`]. Ordered so that encoding is canonical.
pub type Namespace = BTreeMap<String, Value>;

/// The three independent namespaces of a state snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Section {
    /// Administrator-supplied scalar settings.
    Config,
    /// Peer and integration data.
    Relations,
    /// Orchestrator-internal metadata.
    Runtime,
}

impl Section {
    /// All sections, in encoding order.
    pub const ALL: [Self; 3] = [Self::Config, Self::Relations, Self::Runtime];

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Config => "config",
            Self::Relations => "relations",
            Self::Runtime => "runtime",
        }
    }
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An immutable snapshot of configuration, relation and runtime data.
///
/// Built with the `with_*` methods; there is no way to mutate a snapshot in
/// place once it has been handed to a [`crate::Change`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct State {
    config: Namespace,
    relations: Namespace,
    runtime: Namespace,
}

impl State {
    /// Create an empty state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a config key.
    #[must_use]
    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    /// Set a relations key.
    #[must_use]
    pub fn with_relation(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.relations.insert(key.into(), value.into());
        self
    }

    /// Set a runtime key.
    #[must_use]
    pub fn with_runtime(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.runtime.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub const fn config(&self) -> &Namespace {
        &self.config
    }

    #[must_use]
    pub const fn relations(&self) -> &Namespace {
        &self.relations
    }

    #[must_use]
    pub const fn runtime(&self) -> &Namespace {
        &self.runtime
    }

    /// Borrow a namespace by section.
    #[must_use]
    pub const fn section(&self, section: Section) -> &Namespace {
        match section {
            Section::Config => &self.config,
            Section::Relations => &self.relations,
            Section::Runtime => &self.runtime,
        }
    }

    /// Look up a single value.
    #[must_use]
    pub fn get(&self, section: Section, key: &str) -> Option<&Value> {
        self.section(section).get(key)
    }

    /// Check that config values are scalars.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidState` for the first array or object found in
    /// the `config` namespace.
    pub fn validate(&self) -> Result<()> {
        match self
            .config
            .iter()
            .find(|(_, value)| value.is_array() || value.is_object())
        {
            Some((key, _)) => Err(Error::invalid_state(
                Section::Config.as_str(),
                key.clone(),
                "config values must be scalars",
            )),
            None => Ok(()),
        }
    }

    fn section_mut(&mut self, section: Section) -> &mut Namespace {
        match section {
            Section::Config => &mut self.config,
            Section::Relations => &mut self.relations,
            Section::Runtime => &mut self.runtime,
        }
    }
}

/// Changed keys between two states, shaped like [`State`].
///
/// A key whose value changed or appeared carries its new value; a key that
/// disappeared carries `null`. Unchanged keys are absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Diff(State);

impl Diff {
    /// Compute the diff from `old` to `new`.
    #[must_use]
    pub fn between(old: &State, new: &State) -> Self {
        let mut diff = State::default();
        for section in Section::ALL {
            let changed = diff.section_mut(section);
            old.section(section)
                .iter()
                .merge_join_by(new.section(section).iter(), |(a, _), (b, _)| a.cmp(b))
                .for_each(|pair| match pair {
                    EitherOrBoth::Both((_, before), (key, after)) if before != after => {
                        changed.insert(key.clone(), after.clone());
                    }
                    EitherOrBoth::Both(..) => {}
                    EitherOrBoth::Left((key, _)) => {
                        changed.insert(key.clone(), Value::Null);
                    }
                    EitherOrBoth::Right((key, after)) => {
                        changed.insert(key.clone(), after.clone());
                    }
                });
        }
        Self(diff)
    }

    #[must_use]
    pub const fn config(&self) -> &Namespace {
        self.0.config()
    }

    #[must_use]
    pub const fn relations(&self) -> &Namespace {
        self.0.relations()
    }

    #[must_use]
    pub const fn runtime(&self) -> &Namespace {
        self.0.runtime()
    }

    /// Borrow the changed keys of one section.
    #[must_use]
    pub const fn section(&self, section: Section) -> &Namespace {
        self.0.section(section)
    }

    /// Whether `key` changed in `section`.
    #[must_use]
    pub fn contains(&self, section: Section, key: &str) -> bool {
        self.0.section(section).contains_key(key)
    }

    /// Total number of changed keys across all sections.
    #[must_use]
    pub fn len(&self) -> usize {
        Section::ALL
            .iter()
            .map(|section| self.0.section(*section).len())
            .sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]

    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_diff_tracks_changed_added_removed() {
        let old = State::new()
            .with_config("user", "admin")
            .with_config("port", 3306)
            .with_relation("db", json!({"host": "a"}));
        let new = State::new()
            .with_config("user", "app")
            .with_config("port", 3306)
            .with_config("tls", true)
            .with_runtime("unit", "mariadb/0");

        let diff = Diff::between(&old, &new);

        assert_eq!(diff.config().get("user"), Some(&json!("app")));
        assert_eq!(diff.config().get("tls"), Some(&json!(true)));
        assert!(!diff.contains(Section::Config, "port"));
        assert_eq!(diff.relations().get("db"), Some(&Value::Null));
        assert_eq!(diff.runtime().get("unit"), Some(&json!("mariadb/0")));
        assert_eq!(diff.len(), 4);
    }

    #[test]
    fn test_diff_of_identical_states_is_empty() {
        let state = State::new().with_config("user", "app");
        assert!(Diff::between(&state, &state).is_empty());
    }

    #[test]
    fn test_validate_rejects_non_scalar_config() {
        let state = State::new().with_config("users", json!(["a", "b"]));
        let err = state.validate().expect_err("arrays are rejected");
        assert!(err.to_string().contains("config.users"));

        let ok = State::new()
            .with_config("user", "a")
            .with_relation("peers", json!(["b"]));
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn test_state_serializes_all_namespaces() {
        let state = State::new().with_config("user", "app");
        let value = serde_json::to_value(&state).unwrap();
        assert_eq!(
            value,
            json!({"config": {"user": "app"}, "relations": {}, "runtime": {}})
        );

        let parsed: State = serde_json::from_value(json!({"config": {"user": "app"}})).unwrap();
        assert_eq!(parsed, state);
    }

    fn namespace() -> impl Strategy<Value = Namespace> {
        prop::collection::btree_map("[a-e]", 0i64..4, 0..5)
            .prop_map(|m| m.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
    }

    fn state() -> impl Strategy<Value = State> {
        (namespace(), namespace(), namespace()).prop_map(|(config, relations, runtime)| State {
            config,
            relations,
            runtime,
        })
    }

    proptest! {
        /// A key is in the diff exactly when its value differs between the states.
        #[test]
        fn prop_diff_contains_exactly_changed_keys(old in state(), new in state()) {
            let diff = Diff::between(&old, &new);
            for section in Section::ALL {
                let keys = old.section(section).keys().chain(new.section(section).keys());
                for key in keys {
                    let changed = old.get(section, key) != new.get(section, key);
                    prop_assert_eq!(diff.contains(section, key), changed);
                    if changed {
                        let expected = new.get(section, key).cloned().unwrap_or(Value::Null);
                        prop_assert_eq!(diff.section(section).get(key), Some(&expected));
                    }
                }
            }
        }

        #[test]
        fn prop_diff_is_deterministic(old in state(), new in state()) {
            prop_assert_eq!(Diff::between(&old, &new), Diff::between(&old, &new));
        }
    }
}
