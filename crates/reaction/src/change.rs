//! The proposed transition handed to handlers, and its stable key.

use std::fmt;

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::state::{Diff, State};

/// Stable identifier of a [`Change`]: hex SHA-256 of its canonical encoding.
///
/// Two changes with identical `(old, new, diff)` always share a key, which is
/// what lets a denial stick to "the same change" across resubmissions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangeKey(String);

impl ChangeKey {
    const HEX_LEN: usize = 64;

    /// Parse a key previously produced by [`Change::key`].
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidKey` unless `value` is 64 lowercase hex digits.
    pub fn parse(value: &str) -> Result<Self> {
        let well_formed = value.len() == Self::HEX_LEN
            && value
                .chars()
                .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c));
        if well_formed {
            Ok(Self(value.to_string()))
        } else {
            Err(Error::invalid_key(value))
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First twelve hex digits, for log lines.
    #[must_use]
    pub fn short(&self) -> &str {
        self.0.get(..12).unwrap_or(&self.0)
    }
}

impl fmt::Display for ChangeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A proposed transition: last known-good state, proposed state, and the
/// diff between them.
///
/// The diff is always computed here, never supplied by a caller; a decoded
/// change recomputes it from the two states.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "ChangeParts")]
pub struct Change {
    old: State,
    new: State,
    diff: Diff,
}

#[derive(Deserialize)]
struct ChangeParts {
    #[serde(default)]
    old: State,
    #[serde(default)]
    new: State,
}

impl From<ChangeParts> for Change {
    fn from(parts: ChangeParts) -> Self {
        Self::new(parts.old, parts.new)
    }
}

impl Change {
    /// Build a change and compute its diff.
    #[must_use]
    pub fn new(old: State, new: State) -> Self {
        let diff = Diff::between(&old, &new);
        Self { old, new, diff }
    }

    #[must_use]
    pub const fn old(&self) -> &State {
        &self.old
    }

    #[must_use]
    pub const fn new_state(&self) -> &State {
        &self.new
    }

    #[must_use]
    pub const fn diff(&self) -> &Diff {
        &self.diff
    }

    /// Whether the change alters nothing.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.diff.is_empty()
    }

    /// Canonical JSON encoding: object keys in sorted order at every depth.
    ///
    /// Nested values keep whatever key order they were built or decoded with,
    /// so they are re-sorted here before encoding.
    ///
    /// # Errors
    ///
    /// Returns `Error::Encoding` if a value cannot be serialized.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        let value = serde_json::to_value(self).map_err(|e| Error::encoding(e.to_string()))?;
        serde_json::to_vec(&canonicalize(value)).map_err(|e| Error::encoding(e.to_string()))
    }

    /// Compute the stable key of this change.
    ///
    /// # Errors
    ///
    /// Returns `Error::Encoding` if the change cannot be encoded.
    pub fn key(&self) -> Result<ChangeKey> {
        let digest = Sha256::digest(self.canonical_bytes()?);
        Ok(ChangeKey(format!("{digest:x}")))
    }
}

/// Rebuild every object in `value` with its keys sorted.
fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .sorted_by(|(a, _), (b, _)| a.cmp(b))
                .map(|(key, value)| (key, canonicalize(value)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]

    use super::*;
    use serde_json::json;

    fn sample() -> Change {
        Change::new(
            State::new().with_config("user", "admin"),
            State::new().with_config("user", "app"),
        )
    }

    #[test]
    fn test_key_is_stable_and_content_addressed() {
        let a = sample().key().unwrap();
        let b = sample().key().unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);

        let other = Change::new(State::new(), State::new().with_config("user", "app"));
        assert_ne!(other.key().unwrap(), a);
    }

    #[test]
    fn test_key_ignores_insertion_order() {
        let one = Change::new(
            State::new(),
            State::new().with_config("a", 1).with_config("b", 2),
        );
        let two = Change::new(
            State::new(),
            State::new().with_config("b", 2).with_config("a", 1),
        );
        assert_eq!(one.key().unwrap(), two.key().unwrap());
    }

    #[test]
    fn test_key_ignores_nested_key_order() {
        let one: Change = serde_json::from_str(
            r#"{"new":{"relations":{"db":{"host":"h","port":1,"tls":{"on":1,"ca":2}}}}}"#,
        )
        .unwrap();
        let two: Change = serde_json::from_str(
            r#"{"new":{"relations":{"db":{"tls":{"ca":2,"on":1},"port":1,"host":"h"}}}}"#,
        )
        .unwrap();

        assert_eq!(one, two);
        assert_eq!(one.key().unwrap(), two.key().unwrap());
        assert_eq!(one.canonical_bytes().unwrap(), two.canonical_bytes().unwrap());
    }

    #[test]
    fn test_canonicalize_sorts_every_level() {
        let mut inner = serde_json::Map::new();
        inner.insert("z".to_string(), json!(1));
        inner.insert("a".to_string(), json!([{"y": 2, "b": 3}]));
        let mut outer = serde_json::Map::new();
        outer.insert("m".to_string(), Value::Object(inner));
        outer.insert("c".to_string(), json!(null));

        let text = serde_json::to_string(&canonicalize(Value::Object(outer))).unwrap();
        assert_eq!(text, r#"{"c":null,"m":{"a":[{"b":3,"y":2}],"z":1}}"#);
    }

    #[test]
    fn test_decoding_recomputes_diff() {
        let value = json!({
            "old": {"config": {"user": "admin"}},
            "new": {"config": {"user": "app"}},
            "diff": {"config": {"bogus": 1}}
        });
        let change: Change = serde_json::from_value(value).unwrap();
        assert_eq!(change, sample());
        assert!(!change.diff().config().contains_key("bogus"));
    }

    #[test]
    fn test_roundtrip_preserves_key() {
        let change = sample();
        let bytes = change.canonical_bytes().unwrap();
        let decoded: Change = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded.key().unwrap(), change.key().unwrap());
    }

    #[test]
    fn test_parse_key() {
        let key = sample().key().unwrap();
        assert_eq!(ChangeKey::parse(key.as_str()).unwrap(), key);
        assert_eq!(key.short().len(), 12);
        assert!(ChangeKey::parse("not-a-key").is_err());
        assert!(ChangeKey::parse(&key.as_str().to_uppercase()).is_err());
    }

    #[test]
    fn test_noop_change() {
        let state = State::new().with_config("user", "app");
        assert!(Change::new(state.clone(), state).is_noop());
        assert!(!sample().is_noop());
    }
}
