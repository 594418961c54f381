//! Retry backoff computation.

use rand::Rng;
use std::time::Duration;

use super::types::{BackoffKind, RetryPolicy};

/// Delay before the attempt that follows `attempt` (1-based) failed.
///
/// `exponential`: `min(max_delay, base_delay * 2^(attempt - 1))`.
/// `fixed`: `min(max_delay, base_delay)`.
/// With jitter the delay is scaled by a uniform factor in `[0, 1]`.
pub fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let delay = nominal_delay(policy, attempt);
    if policy.jitter {
        delay.mul_f64(rand::rng().random_range(0.0..=1.0))
    } else {
        delay
    }
}

/// Backoff delay before jitter.
pub fn nominal_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let raw = match policy.backoff {
        BackoffKind::Fixed => policy.base_delay,
        BackoffKind::Exponential => {
            let exponent = attempt.saturating_sub(1).min(31);
            policy
                .base_delay
                .checked_mul(1u32 << exponent)
                .unwrap_or(policy.max_delay)
        }
    };
    raw.min(policy.max_delay)
}

/// Sum of nominal delays across every retry a policy allows.
pub fn total_nominal_delay(policy: &RetryPolicy) -> Duration {
    (1..policy.max_attempts)
        .map(|attempt| nominal_delay(policy, attempt))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_exponential_doubles_until_cap() {
        let policy = RetryPolicy::exponential(10, ms(100), ms(1000));
        assert_eq!(nominal_delay(&policy, 1), ms(100));
        assert_eq!(nominal_delay(&policy, 2), ms(200));
        assert_eq!(nominal_delay(&policy, 3), ms(400));
        assert_eq!(nominal_delay(&policy, 4), ms(800));
        assert_eq!(nominal_delay(&policy, 5), ms(1000));
        assert_eq!(nominal_delay(&policy, 40), ms(1000));
    }

    #[test]
    fn test_fixed_is_flat() {
        let policy = RetryPolicy::fixed(4, ms(50));
        for attempt in 1..4 {
            assert_eq!(backoff_delay(&policy, attempt), ms(50));
        }
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = RetryPolicy::exponential(5, ms(100), ms(1000)).with_jitter();
        for _ in 0..200 {
            let d = backoff_delay(&policy, 3);
            assert!(d <= ms(400), "{d:?}");
        }
    }

    #[test]
    fn test_total_nominal_delay() {
        let policy = RetryPolicy::exponential(4, ms(10), ms(1000));
        // Three retries: 10 + 20 + 40
        assert_eq!(total_nominal_delay(&policy), ms(70));
        assert_eq!(total_nominal_delay(&RetryPolicy::once()), Duration::ZERO);
    }
}
