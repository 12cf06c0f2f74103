//! Backoff policy: when a failed row may be claimed again.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::ports::offset_by;

/// Exponential backoff without jitter.
///
/// `delay = min(base_delay * multiplier^(attempts - 1), max_delay)`
///
/// With base 1s, multiplier 2, max 10min:
/// - attempt 1: 1s
/// - attempt 2: 2s
/// - attempt 3: 4s
/// - attempt 10: 512s
/// - attempt 11 and later: 600s
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(600),
            multiplier: 2.0,
        }
    }
}

impl BackoffPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            ..Self::default()
        }
    }

    /// Delay after the `attempts`-th failure (post-increment count, so the
    /// first failure is 1). 0 is treated as 1.
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let exponent = i32::try_from(attempts.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        // overflow / NaN -> cap
        Duration::try_from_secs_f64(secs)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    pub fn next_available_at(&self, now: DateTime<Utc>, attempts: u32) -> DateTime<Utc> {
        offset_by(now, self.next_delay(attempts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;

    #[rstest]
    #[case(0, 1)]
    #[case(1, 1)]
    #[case(2, 2)]
    #[case(3, 4)]
    #[case(10, 512)]
    #[case(11, 600)]
    #[case(64, 600)]
    #[case(u32::MAX, 600)]
    fn delay_doubles_up_to_the_cap(#[case] attempts: u32, #[case] expected_secs: u64) {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.next_delay(attempts), Duration::from_secs(expected_secs));
    }

    #[test]
    fn delays_never_decrease() {
        let policy = BackoffPolicy::new(Duration::from_millis(250), Duration::from_secs(30));
        let mut previous = Duration::ZERO;
        for attempts in 1..=40 {
            let delay = policy.next_delay(attempts);
            assert!(delay >= previous);
            assert!(delay <= policy.max_delay);
            previous = delay;
        }
    }

    #[test]
    fn next_available_at_adds_delay() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let at = BackoffPolicy::default().next_available_at(now, 1);
        assert_eq!(at - now, chrono::TimeDelta::seconds(1));
    }
}
