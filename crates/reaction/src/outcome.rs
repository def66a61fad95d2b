//! Handler verdicts and the diagnostics attached to failures.

use std::any::Any;
use std::backtrace::BacktraceStatus;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Reason attached to every outcome synthesized from a handler fault.
pub const FAULT_REASON: &str = "handler raised an unhandled fault";

/// Reason attached to outcomes synthesized from an invocation timeout.
pub const TIMEOUT_REASON: &str = "handler did not finish in time";

/// A handler's verdict on a proposed change.
///
/// The set is closed: every consumer matches on all four variants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    /// The handler agrees but did not apply the change itself; the
    /// orchestrator applies its default update.
    Approved,
    /// The handler applied the change itself; no default update.
    Handled,
    /// Permanent rejection. The identical change is never attempted again.
    Denied { reason: String },
    /// Transient failure. The change is retried with identical arguments.
    Failed {
        reason: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cause: Option<FaultDetail>,
    },
}

impl Outcome {
    /// Create a denial.
    pub fn denied(reason: impl Into<String>) -> Self {
        Self::Denied {
            reason: reason.into(),
        }
    }

    /// Create a failure without a captured cause.
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed {
            reason: reason.into(),
            cause: None,
        }
    }

    /// Create a failure carrying fault diagnostics.
    pub fn failed_with(reason: impl Into<String>, cause: FaultDetail) -> Self {
        Self::Failed {
            reason: reason.into(),
            cause: Some(cause),
        }
    }

    /// Whether no further invocation follows this outcome.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Failed { .. })
    }

    /// Short lowercase name of the variant.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::Handled => "handled",
            Self::Denied { .. } => "denied",
            Self::Failed { .. } => "failed",
        }
    }

    /// The reason carried by `Denied` or `Failed`.
    #[must_use]
    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Denied { reason } | Self::Failed { reason, .. } => Some(reason),
            Self::Approved | Self::Handled => None,
        }
    }

    /// Decode an outcome from its wire form.
    ///
    /// Accepts the tagged object form (`{"outcome": "denied", "reason": ".."}`)
    /// and bare strings for the payload-free variants (`"approved"`).
    /// `null` decodes to `Ok(None)`: the handler returned nothing.
    ///
    /// # Errors
    ///
    /// Returns a description of the violation for anything else.
    pub fn from_wire(value: Value) -> Result<Option<Self>, String> {
        match value {
            Value::Null => Ok(None),
            Value::String(tag) => match tag.as_str() {
                "approved" => Ok(Some(Self::Approved)),
                "handled" => Ok(Some(Self::Handled)),
                other => Err(format!("unrecognized outcome '{other}'")),
            },
            object @ Value::Object(_) => serde_json::from_value(object)
                .map(Some)
                .map_err(|e| format!("malformed outcome object: {e}")),
            other => Err(format!("expected an outcome object, got {other}")),
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.reason() {
            Some(reason) => write!(f, "{}: {reason}", self.label()),
            None => f.write_str(self.label()),
        }
    }
}

/// Category of a captured handler fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    /// The handler returned an error.
    Error,
    /// The handler panicked.
    Panic,
    /// The handler exceeded the invocation timeout.
    Timeout,
    /// The handler returned something that is not an outcome.
    ProtocolViolation,
    /// The invocation task ended without a result.
    Aborted,
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Error => "error",
            Self::Panic => "panic",
            Self::Timeout => "timeout",
            Self::ProtocolViolation => "protocol_violation",
            Self::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Diagnostics captured at the invocation boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultDetail {
    pub kind: FaultKind,
    pub message: String,
    /// Error source chain, outermost first (excluding `message`).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub chain: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backtrace: Option<String>,
}

impl FaultDetail {
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            chain: Vec::new(),
            backtrace: None,
        }
    }

    /// Capture an error returned by a handler, with its source chain and,
    /// when one was recorded, its backtrace.
    #[must_use]
    pub fn from_error(err: &anyhow::Error) -> Self {
        let backtrace = err.backtrace();
        Self {
            kind: FaultKind::Error,
            message: err.to_string(),
            chain: err.chain().skip(1).map(ToString::to_string).collect(),
            backtrace: (backtrace.status() == BacktraceStatus::Captured)
                .then(|| backtrace.to_string()),
        }
    }

    /// Capture a panic payload.
    #[must_use]
    pub fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        Self::new(FaultKind::Panic, message)
    }

    #[must_use]
    pub fn timeout(limit: Duration) -> Self {
        Self::new(
            FaultKind::Timeout,
            format!("invocation exceeded {}ms", limit.as_millis()),
        )
    }
}

/// What a handler hands back before the boundary classifies it.
#[derive(Debug, Clone, PartialEq)]
pub enum Reaction {
    /// A typed verdict.
    Explicit(Outcome),
    /// No verdict; treated as an implicit approval.
    Nothing,
    /// An undecoded verdict from foreign code (e.g. a subprocess).
    Wire(Value),
}

impl From<Outcome> for Reaction {
    fn from(outcome: Outcome) -> Self {
        Self::Explicit(outcome)
    }
}

impl From<Option<Outcome>> for Reaction {
    fn from(outcome: Option<Outcome>) -> Self {
        outcome.map_or(Self::Nothing, Self::Explicit)
    }
}
