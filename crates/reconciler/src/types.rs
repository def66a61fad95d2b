//! Results handed back to callers of the reconciler.

use accord_reaction::ChangeKey;
use serde::{Deserialize, Serialize};

use crate::record::{ChangeRecord, ChangeStatus};

/// What happened to a submitted change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "submission", rename_all = "snake_case")]
pub enum Submission {
    /// A worker was scheduled for the change.
    Accepted { key: ChangeKey },
    /// The identical change was denied before; the handler is not invoked.
    Denied { key: ChangeKey, reason: String },
    /// The identical change already resolved as approved or handled.
    Resolved { key: ChangeKey, status: ChangeStatus },
    /// A worker is already driving the change.
    InFlight { key: ChangeKey },
    /// The change is stuck and needs a retrigger.
    Stuck { key: ChangeKey },
}

impl Submission {
    #[must_use]
    pub const fn key(&self) -> &ChangeKey {
        match self {
            Self::Accepted { key }
            | Self::Denied { key, .. }
            | Self::Resolved { key, .. }
            | Self::InFlight { key }
            | Self::Stuck { key } => key,
        }
    }
}

/// Where a worker left a change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "resolution", rename_all = "snake_case")]
pub enum Resolution {
    /// Approved and the default update applied.
    Approved { attempts: u32 },
    Handled { attempts: u32 },
    Denied { attempts: u32, reason: String },
    /// Out of retry budget; waits for an operator.
    Stuck { attempts: u32, reason: String },
    /// Shutdown stopped the worker; the change is still open.
    Interrupted { attempts: u32 },
}

impl Resolution {
    /// Resolution of a record a worker has finished with.
    ///
    /// Returns `None` while the record still has work left.
    #[must_use]
    pub fn of(record: &ChangeRecord) -> Option<Self> {
        let attempts = record.attempts;
        let reason = || record.last_reason().unwrap_or_default().to_string();
        match record.status {
            ChangeStatus::Approved if record.applied => Some(Self::Approved { attempts }),
            ChangeStatus::Handled => Some(Self::Handled { attempts }),
            ChangeStatus::Denied => Some(Self::Denied {
                attempts,
                reason: reason(),
            }),
            ChangeStatus::Stuck => Some(Self::Stuck {
                attempts,
                reason: reason(),
            }),
            ChangeStatus::Approved | ChangeStatus::Pending | ChangeStatus::Retrying => None,
        }
    }

    #[must_use]
    pub const fn attempts(&self) -> u32 {
        match self {
            Self::Approved { attempts }
            | Self::Handled { attempts }
            | Self::Denied { attempts, .. }
            | Self::Stuck { attempts, .. }
            | Self::Interrupted { attempts } => *attempts,
        }
    }

    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Approved { .. } => "approved",
            Self::Handled { .. } => "handled",
            Self::Denied { .. } => "denied",
            Self::Stuck { .. } => "stuck",
            Self::Interrupted { .. } => "interrupted",
        }
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Denied { attempts, reason } | Self::Stuck { attempts, reason } => {
                write!(f, "{} after {attempts} attempt(s): {reason}", self.label())
            }
            _ => write!(f, "{} after {} attempt(s)", self.label(), self.attempts()),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use accord_reaction::{Change, State};
    use chrono::Utc;

    fn record(status: ChangeStatus, applied: bool) -> ChangeRecord {
        let change = Change::new(State::new(), State::new().with_config("user", "app"));
        let mut record = ChangeRecord::new("users", change, Utc::now()).unwrap();
        record.status = status;
        record.applied = applied;
        record.attempts = 2;
        record
    }

    #[test]
    fn test_open_records_have_no_resolution() {
        assert_eq!(Resolution::of(&record(ChangeStatus::Pending, false)), None);
        assert_eq!(Resolution::of(&record(ChangeStatus::Retrying, false)), None);
        assert_eq!(Resolution::of(&record(ChangeStatus::Approved, false)), None);
    }

    #[test]
    fn test_finished_records() {
        assert_eq!(
            Resolution::of(&record(ChangeStatus::Approved, true)),
            Some(Resolution::Approved { attempts: 2 })
        );
        assert_eq!(
            Resolution::of(&record(ChangeStatus::Handled, false)),
            Some(Resolution::Handled { attempts: 2 })
        );
        assert_eq!(
            Resolution::Stuck {
                attempts: 3,
                reason: "db down".into()
            }
            .to_string(),
            "stuck after 3 attempt(s): db down"
        );
    }
}
