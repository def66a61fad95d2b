//! Property-based tests for retry backoff and the change key.
//!
//! Uses proptest to validate:
//! - Delays never shrink from one retry to the next
//! - Delays never exceed the configured cap
//! - The retry budget is monotone in attempts
//! - Keys are stable for identical changes

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use std::time::Duration;

use accord_reaction::{Change, State};
use accord_reconciler::RetryPolicy;
use proptest::prelude::*;

fn policy(base_ms: u64, max_ms: u64, jitter: f64) -> RetryPolicy {
    RetryPolicy {
        base_delay: Duration::from_millis(base_ms),
        max_delay: Duration::from_millis(base_ms.max(max_ms)),
        jitter_factor: jitter,
        max_attempts: None,
        max_elapsed: None,
    }
}

proptest! {
    /// Property: delay(n) <= delay(n + 1) for any pair of jitter draws
    #[test]
    fn prop_delays_non_decreasing(
        base_ms in 1u64..5_000,
        max_ms in 1u64..600_000,
        jitter in 0.0f64..0.999,
        retry in 0u32..80,
        r1 in 0.0f64..1.0,
        r2 in 0.0f64..1.0,
    ) {
        let policy = policy(base_ms, max_ms, jitter);
        let now = policy.delay_with(retry, r1 * jitter);
        let next = policy.delay_with(retry + 1, r2 * jitter);
        prop_assert!(
            now <= next,
            "delay({}) = {:?} > delay({}) = {:?}",
            retry,
            now,
            retry + 1,
            next
        );
    }

    /// Property: no delay exceeds the cap, even with jitter
    #[test]
    fn prop_delays_capped(
        base_ms in 1u64..5_000,
        max_ms in 1u64..600_000,
        jitter in 0.0f64..0.999,
        retry in 0u32..200,
    ) {
        let policy = policy(base_ms, max_ms, jitter);
        prop_assert!(policy.delay(retry) <= policy.max_delay);
    }

    /// Property: once exhausted, more attempts stay exhausted
    #[test]
    fn prop_budget_monotone(max in 1u32..50, attempts in 0u32..100) {
        let policy = policy(1, 10, 0.0).with_max_attempts(Some(max));
        if policy.budget_exhausted(attempts, Duration::ZERO) {
            prop_assert!(policy.budget_exhausted(attempts + 1, Duration::ZERO));
        }
        prop_assert_eq!(policy.budget_exhausted(attempts, Duration::ZERO), attempts >= max);
    }

    /// Property: equal changes get equal keys, and a different value a different key
    #[test]
    fn prop_key_identity(user in "[a-z]{1,12}", other in "[a-z]{1,12}") {
        let make = |name: &str| {
            Change::new(
                State::new().with_config("user", "admin"),
                State::new().with_config("user", name),
            )
        };
        prop_assert_eq!(make(&user).key().unwrap(), make(&user).key().unwrap());
        if user != other {
            prop_assert_ne!(make(&user).key().unwrap(), make(&other).key().unwrap());
        }
    }
}
