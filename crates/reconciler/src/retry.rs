//! Capped exponential backoff with jitter, and the retry budget.
//!
//! `delay(n) = min(base * 2^n * (1 + r), max)` with `r` drawn from
//! `[0, jitter)`. Since `jitter < 1`, the factor `(1 + r)` is below 2 and the
//! sequence never decreases, whatever values `r` takes.

use std::time::Duration;

use accord_core::RetrySettings;
use rand::Rng;

/// Exponent past which `2^n` already exceeds any ceiling a `Duration` holds.
const MAX_EXPONENT: u32 = 64;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction in `[0, 1)`.
    pub jitter_factor: f64,
    /// `None` retries without an attempt limit.
    pub max_attempts: Option<u32>,
    /// `None` retries without a time limit.
    pub max_elapsed: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetrySettings::default())
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            base_delay: Duration::from_millis(settings.base_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
            jitter_factor: settings.jitter_factor.clamp(0.0, 0.999),
            max_attempts: settings.max_attempts,
            max_elapsed: settings.max_elapsed_secs.map(Duration::from_secs),
        }
    }
}

impl RetryPolicy {
    /// Policy with fixed delays and no jitter. Handy for tests.
    #[must_use]
    pub const fn fixed(delay: Duration, max_attempts: Option<u32>) -> Self {
        Self {
            base_delay: delay,
            max_delay: delay,
            jitter_factor: 0.0,
            max_attempts,
            max_elapsed: None,
        }
    }

    #[must_use]
    pub const fn with_max_attempts(mut self, max_attempts: Option<u32>) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    #[must_use]
    pub const fn with_max_elapsed(mut self, max_elapsed: Option<Duration>) -> Self {
        self.max_elapsed = max_elapsed;
        self
    }

    #[must_use]
    pub const fn with_jitter(mut self, jitter_factor: f64) -> Self {
        self.jitter_factor = jitter_factor;
        self
    }

    /// Delay before retry number `retry` (0-indexed), with random jitter.
    #[must_use]
    pub fn delay(&self, retry: u32) -> Duration {
        let r = if self.jitter_factor > 0.0 {
            rand::thread_rng().gen_range(0.0..self.jitter_factor)
        } else {
            0.0
        };
        self.delay_with(retry, r)
    }

    /// Delay before retry number `retry` for a given jitter draw `r`.
    #[must_use]
    pub fn delay_with(&self, retry: u32, r: f64) -> Duration {
        let exponent = i32::try_from(retry.min(MAX_EXPONENT)).unwrap_or(i32::MAX);
        let factor = 2_f64.powi(exponent) * (1.0 + r.max(0.0));
        let base = self.base_delay.as_nanos() as f64;
        let max = self.max_delay.as_nanos() as f64;
        // Float-to-int `as` saturates.
        Duration::from_nanos((base * factor).min(max) as u64)
    }

    /// Whether a change with `attempts` attempts in its current window, the
    /// first of which started `elapsed` ago, may not be retried again.
    #[must_use]
    pub fn budget_exhausted(&self, attempts: u32, elapsed: Duration) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
            || self.max_elapsed.is_some_and(|max| elapsed >= max)
    }
}
