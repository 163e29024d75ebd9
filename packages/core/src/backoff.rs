//! Exponential retry schedule.

use std::time::Duration;

/// Delay applied before the retry that follows the `attempts`-th failed attempt.
///
/// The schedule is `base_ms * 2^(attempts - 1)`, so with a base of 1000 ms the
/// first retry waits one second, the second two seconds, and so on. An
/// `attempts` of zero is treated as one. The result saturates instead of
/// overflowing.
pub fn backoff_delay(base_ms: u64, attempts: u32) -> Duration {
    let exponent = attempts.saturating_sub(1);
    let factor = 2u64.checked_pow(exponent).unwrap_or(u64::MAX);
    Duration::from_millis(base_ms.saturating_mul(factor))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn follows_documented_schedule() {
        assert_eq!(backoff_delay(1000, 1), Duration::from_millis(1000));
        assert_eq!(backoff_delay(1000, 2), Duration::from_millis(2000));
        assert_eq!(backoff_delay(1000, 3), Duration::from_millis(4000));
        assert_eq!(backoff_delay(250, 0), Duration::from_millis(250));
    }

    #[test]
    fn saturates_on_large_attempt_counts() {
        assert_eq!(backoff_delay(1000, 200), Duration::from_millis(u64::MAX));
        assert_eq!(backoff_delay(0, 200), Duration::ZERO);
    }

    proptest! {
        #[test]
        fn delay_never_decreases(base in 1u64..10_000, attempts in 1u32..40) {
            prop_assert!(backoff_delay(base, attempts + 1) >= backoff_delay(base, attempts));
        }

        #[test]
        fn delay_doubles_until_saturation(base in 1u64..10_000, attempts in 1u32..20) {
            let current = backoff_delay(base, attempts).as_millis();
            let next = backoff_delay(base, attempts + 1).as_millis();
            prop_assert_eq!(next, current * 2);
        }
    }
}
