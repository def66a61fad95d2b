//! Change records and the per-record state machine.
//!
//! A record is created on first submission of a change, mutated only by the
//! worker holding its key, and kept after it turns terminal so that a denial
//! sticks to the change for good.

use std::fmt;
use std::time::Duration;

use accord_reaction::{Change, ChangeKey, Invocation, Outcome};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::retry::RetryPolicy;

/// Where a change stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeStatus {
    /// Submitted, never attempted.
    Pending,
    /// At least one attempt failed; another is scheduled.
    Retrying,
    /// Still failing and out of retry budget. Waits for an operator.
    Stuck,
    /// Approved by the handler; the default update applies `new`.
    Approved,
    /// Applied by the handler itself.
    Handled,
    /// Permanently rejected.
    Denied,
}

impl ChangeStatus {
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Approved | Self::Handled | Self::Denied)
    }

    /// Allowed state-machine edges.
    #[must_use]
    pub const fn can_transition_to(&self, next: Self) -> bool {
        match self {
            Self::Pending | Self::Retrying => !matches!(next, Self::Pending),
            Self::Stuck => matches!(next, Self::Retrying),
            Self::Approved | Self::Handled | Self::Denied => false,
        }
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Retrying => "retrying",
            Self::Stuck => "stuck",
            Self::Approved => "approved",
            Self::Handled => "handled",
            Self::Denied => "denied",
        }
    }
}

impl fmt::Display for ChangeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One handler invocation, as recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// 1-based attempt number across the record's whole life.
    pub attempt: u32,
    pub outcome: Outcome,
    /// The handler returned nothing.
    #[serde(default)]
    pub implicit: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    /// Backoff scheduled after this attempt, when another one follows.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_ms: Option<u64>,
}

/// Orchestrator-owned record of one change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub key: ChangeKey,
    pub handler: String,
    pub change: Change,
    pub status: ChangeStatus,
    pub attempts: u32,
    pub last_outcome: Option<Outcome>,
    pub history: Vec<AttemptRecord>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub first_attempt_at: Option<DateTime<Utc>>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// The default update has been applied (only meaningful when approved).
    pub applied: bool,
    #[serde(default)]
    pub apply_failures: u32,
    #[serde(default)]
    pub last_apply_error: Option<String>,
    /// Attempt count at which the current retry budget window opened.
    #[serde(default)]
    pub window_base: u32,
    /// Start of the current retry budget window.
    #[serde(default)]
    pub window_started_at: Option<DateTime<Utc>>,
}

impl ChangeRecord {
    /// Open a record for a freshly submitted change.
    ///
    /// # Errors
    ///
    /// Returns an error if the change cannot be keyed.
    pub fn new(handler: impl Into<String>, change: Change, now: DateTime<Utc>) -> Result<Self> {
        Ok(Self {
            key: change.key()?,
            handler: handler.into(),
            change,
            status: ChangeStatus::Pending,
            attempts: 0,
            last_outcome: None,
            history: Vec::new(),
            created_at: now,
            updated_at: now,
            first_attempt_at: None,
            next_attempt_at: None,
            applied: false,
            apply_failures: 0,
            last_apply_error: None,
            window_base: 0,
            window_started_at: None,
        })
    }

    /// Approved and waiting for its default update.
    #[must_use]
    pub fn needs_apply(&self) -> bool {
        self.status == ChangeStatus::Approved && !self.applied
    }

    /// Whether a worker has something left to do for this record.
    #[must_use]
    pub fn is_open(&self) -> bool {
        matches!(self.status, ChangeStatus::Pending | ChangeStatus::Retrying) || self.needs_apply()
    }

    /// Attempts made in the current retry budget window.
    #[must_use]
    pub const fn window_attempts(&self) -> u32 {
        self.attempts.saturating_sub(self.window_base)
    }

    /// Reason attached to the latest outcome, if any.
    #[must_use]
    pub fn last_reason(&self) -> Option<&str> {
        self.last_outcome.as_ref().and_then(Outcome::reason)
    }

    /// Time until the next attempt is due, zero if it is due already.
    #[must_use]
    pub fn wait_before_next(&self, now: DateTime<Utc>) -> Duration {
        self.next_attempt_at
            .and_then(|at| (at - now).to_std().ok())
            .unwrap_or(Duration::ZERO)
    }

    fn transition(&mut self, next: ChangeStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::invalid_transition(
                self.key.as_str(),
                self.status,
                next,
            ));
        }
        self.status = next;
        Ok(())
    }

    /// Fold one invocation into the record and return the new status.
    ///
    /// `Failed` becomes `Retrying` with a scheduled backoff, or `Stuck` once
    /// the retry budget is spent. The other outcomes are terminal.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidTransition` unless the record is pending or
    /// retrying.
    pub fn record_outcome(
        &mut self,
        invocation: &Invocation,
        started_at: DateTime<Utc>,
        policy: &RetryPolicy,
    ) -> Result<ChangeStatus> {
        let finished_at = started_at
            + chrono::Duration::from_std(invocation.elapsed).unwrap_or(chrono::Duration::zero());
        let next = match &invocation.outcome {
            Outcome::Approved => ChangeStatus::Approved,
            Outcome::Handled => ChangeStatus::Handled,
            Outcome::Denied { .. } => ChangeStatus::Denied,
            Outcome::Failed { .. } => {
                let window_started = self.window_started_at.unwrap_or(started_at);
                let elapsed = (finished_at - window_started)
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                if policy.budget_exhausted(self.window_attempts() + 1, elapsed) {
                    ChangeStatus::Stuck
                } else {
                    ChangeStatus::Retrying
                }
            }
        };
        self.transition(next)?;

        self.attempts += 1;
        self.first_attempt_at.get_or_insert(started_at);
        self.window_started_at.get_or_insert(started_at);
        self.updated_at = finished_at;

        let backoff = (next == ChangeStatus::Retrying)
            .then(|| policy.delay(self.window_attempts().saturating_sub(1)));
        self.next_attempt_at = backoff.and_then(|delay| {
            chrono::Duration::from_std(delay)
                .ok()
                .map(|delay| finished_at + delay)
        });

        self.history.push(AttemptRecord {
            attempt: self.attempts,
            outcome: invocation.outcome.clone(),
            implicit: invocation.implicit,
            started_at,
            finished_at,
            elapsed_ms: u64::try_from(invocation.elapsed.as_millis()).unwrap_or(u64::MAX),
            backoff_ms: backoff.map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
        });
        self.last_outcome = Some(invocation.outcome.clone());
        Ok(next)
    }

    /// The default update succeeded.
    pub fn mark_applied(&mut self, now: DateTime<Utc>) {
        self.applied = true;
        self.last_apply_error = None;
        self.next_attempt_at = None;
        self.updated_at = now;
    }

    /// The default update failed; schedule only the update again.
    pub fn record_apply_failure(
        &mut self,
        reason: impl Into<String>,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) {
        let delay = policy.delay(self.apply_failures);
        self.apply_failures += 1;
        self.last_apply_error = Some(reason.into());
        self.next_attempt_at = chrono::Duration::from_std(delay).ok().map(|d| now + d);
        self.updated_at = now;
    }

    /// Reopen a stuck record with a fresh retry budget.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidTransition` unless the record is stuck.
    pub fn retrigger(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.transition(ChangeStatus::Retrying)?;
        self.window_base = self.attempts;
        self.window_started_at = None;
        self.next_attempt_at = Some(now);
        self.updated_at = now;
        Ok(())
    }
}
