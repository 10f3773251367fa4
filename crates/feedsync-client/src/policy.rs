//! Error recovery policy: what to do after a classified failure.

use std::time::Duration;

use feedsync_core::error::ErrorCategory;
use rand::Rng;

/// Exponential backoff schedule for one retryable category.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub initial: Duration,
    pub multiplier: u32,
    pub cap: Duration,
    /// Total attempts allowed for the category, the first one included.
    pub max_attempts: u32,
}

impl Backoff {
    /// Un-jittered delay before retry number `retry` (1-based).
    pub fn delay(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let factor = self.multiplier.saturating_pow(retry - 1);
        self.initial.saturating_mul(factor).min(self.cap)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Wait, then dispatch again.
    RetryAfter(Duration),
    /// Stop; the session must be re-established by the caller.
    Reauthenticate,
    /// Stop and return the failure.
    Surface,
}

/// Maps failure categories to recovery actions.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub rate_limited: Backoff,
    pub transient: Backoff,
    /// Relative jitter applied to computed backoff delays (0.2 = ±20%).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            rate_limited: Backoff {
                initial: Duration::from_secs(2),
                multiplier: 2,
                cap: Duration::from_secs(60),
                max_attempts: 5,
            },
            transient: Backoff {
                initial: Duration::from_secs(1),
                multiplier: 2,
                cap: Duration::from_secs(30),
                max_attempts: 3,
            },
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(mut self, transient: u32, rate_limited: u32) -> Self {
        self.transient.max_attempts = transient.max(1);
        self.rate_limited.max_attempts = rate_limited.max(1);
        self
    }

    /// Attempts allowed for `category`; non-retryable categories get one.
    pub fn max_attempts(&self, category: ErrorCategory) -> u32 {
        match category {
            ErrorCategory::RateLimited => self.rate_limited.max_attempts,
            ErrorCategory::Transient => self.transient.max_attempts,
            _ => 1,
        }
    }

    /// Decide after the `failures`-th failure of `category` in one call.
    ///
    /// A server-indicated delay is honored as given (capped, no jitter).
    pub fn decide(
        &self,
        category: ErrorCategory,
        failures: u32,
        server_delay: Option<Duration>,
    ) -> RecoveryAction {
        let backoff = match category {
            ErrorCategory::RateLimited => &self.rate_limited,
            ErrorCategory::Transient => &self.transient,
            ErrorCategory::AuthExpired => return RecoveryAction::Reauthenticate,
            ErrorCategory::Malformed | ErrorCategory::Fatal => return RecoveryAction::Surface,
        };
        if failures >= backoff.max_attempts {
            return RecoveryAction::Surface;
        }
        let delay = match (category, server_delay) {
            (ErrorCategory::RateLimited, Some(delay)) => delay.min(backoff.cap),
            _ => jittered(backoff.delay(failures), self.jitter).min(backoff.cap),
        };
        RecoveryAction::RetryAfter(delay)
    }
}

/// Scale `delay` by a random factor in `[1 - fraction, 1 + fraction]`.
pub fn jittered(delay: Duration, fraction: f64) -> Duration {
    let fraction = fraction.clamp(0.0, 1.0);
    if fraction == 0.0 || delay.is_zero() {
        return delay;
    }
    let factor = rand::thread_rng().gen_range((1.0 - fraction)..=(1.0 + fraction));
    delay.mul_f64(factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn within(actual: Duration, expected: Duration, fraction: f64) -> bool {
        let lo = expected.mul_f64(1.0 - fraction);
        let hi = expected.mul_f64(1.0 + fraction);
        actual >= lo && actual <= hi
    }

    #[test]
    fn backoff_doubles_until_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.transient.delay(1), Duration::from_secs(1));
        assert_eq!(policy.transient.delay(2), Duration::from_secs(2));
        assert_eq!(policy.transient.delay(6), Duration::from_secs(30));
        assert_eq!(policy.rate_limited.delay(1), Duration::from_secs(2));
        assert_eq!(policy.rate_limited.delay(10), Duration::from_secs(60));
    }

    #[test]
    fn transient_retries_are_jittered_and_bounded() {
        let policy = RetryPolicy::default();
        for _ in 0..50 {
            match policy.decide(ErrorCategory::Transient, 2, None) {
                RecoveryAction::RetryAfter(d) => assert!(within(d, Duration::from_secs(2), 0.2)),
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(
            policy.decide(ErrorCategory::Transient, 3, None),
            RecoveryAction::Surface
        );
    }

    #[test]
    fn server_delay_wins_for_rate_limits() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.decide(ErrorCategory::RateLimited, 1, Some(Duration::from_secs(2))),
            RecoveryAction::RetryAfter(Duration::from_secs(2))
        );
        assert_eq!(
            policy.decide(ErrorCategory::RateLimited, 1, Some(Duration::from_secs(600))),
            RecoveryAction::RetryAfter(Duration::from_secs(60))
        );
        assert_eq!(
            policy.decide(ErrorCategory::RateLimited, 5, Some(Duration::from_secs(1))),
            RecoveryAction::Surface
        );
    }

    #[test]
    fn jitter_never_exceeds_cap() {
        let policy = RetryPolicy::default();
        for _ in 0..50 {
            match policy.decide(ErrorCategory::RateLimited, 4, None) {
                RecoveryAction::RetryAfter(d) => assert!(d <= Duration::from_secs(60)),
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn non_retryable_categories() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.decide(ErrorCategory::AuthExpired, 1, None),
            RecoveryAction::Reauthenticate
        );
        assert_eq!(policy.decide(ErrorCategory::Malformed, 1, None), RecoveryAction::Surface);
        assert_eq!(policy.decide(ErrorCategory::Fatal, 1, None), RecoveryAction::Surface);
        assert_eq!(policy.max_attempts(ErrorCategory::Fatal), 1);
    }

    #[test]
    fn attempt_overrides_have_a_floor_of_one() {
        let policy = RetryPolicy::default().with_max_attempts(0, 7);
        assert_eq!(policy.max_attempts(ErrorCategory::Transient), 1);
        assert_eq!(policy.max_attempts(ErrorCategory::RateLimited), 7);
    }
}
