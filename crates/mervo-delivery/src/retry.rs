//! Capped exponential backoff and the attempt budget.
//!
//! `backoff(n) = min(cap, 2^n * base)` with a 1 second base and a 60 second
//! cap by default. The function is pure: no jitter, no hidden state, so the
//! same attempt count always yields the same wait.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DeliveryError, Result};

/// Attempts before a delivery is dead-lettered.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Backoff unit multiplied by `2^attempt`.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Upper bound on any single backoff wait.
pub const DEFAULT_BACKOFF_CAP: Duration = Duration::from_secs(60);

/// Capped exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    base: Duration,
    cap: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self { base: DEFAULT_BACKOFF_BASE, cap: DEFAULT_BACKOFF_CAP }
    }
}

impl BackoffPolicy {
    /// Creates a policy with the given base unit and cap.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` when `base` is zero or `cap` is
    /// below `base`.
    pub fn new(base: Duration, cap: Duration) -> Result<Self> {
        if base.is_zero() {
            return Err(DeliveryError::configuration("backoff base must be greater than zero"));
        }
        if cap < base {
            return Err(DeliveryError::configuration(format!(
                "backoff cap {cap:?} is below base {base:?}"
            )));
        }
        Ok(Self { base, cap })
    }

    /// Returns the base unit.
    pub fn base(&self) -> Duration {
        self.base
    }

    /// Returns the cap.
    pub fn cap(&self) -> Duration {
        self.cap
    }

    /// Returns the wait after `attempt` failures.
    ///
    /// Attempts below 1 are treated as 1. Overflowing products clamp to the
    /// cap, so the result is non-decreasing in `attempt`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        2_u32
            .checked_pow(attempt)
            .and_then(|multiplier| self.base.checked_mul(multiplier))
            .map_or(self.cap, |delay| delay.min(self.cap))
    }
}

/// Backoff with the default 1 second base and 60 second cap.
///
/// ```
/// use std::time::Duration;
/// use mervo_delivery::retry::backoff;
///
/// assert_eq!(backoff(1), Duration::from_secs(2));
/// assert_eq!(backoff(5), Duration::from_secs(32));
/// assert_eq!(backoff(6), Duration::from_secs(60));
/// ```
pub fn backoff(attempt: u32) -> Duration {
    BackoffPolicy::default().delay(attempt)
}

/// Attempt budget plus the backoff applied between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Failed attempts after which a delivery is dead-lettered.
    pub max_attempts: u32,

    /// Wait between failed attempts.
    pub backoff: BackoffPolicy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: DEFAULT_MAX_ATTEMPTS, backoff: BackoffPolicy::default() }
    }
}

/// What to do with a delivery after a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Requeue for another attempt.
    Retry {
        /// Earliest time of the next attempt
        next_attempt_at: DateTime<Utc>,
        /// Backoff applied
        delay: Duration,
    },
    /// Dead-letter the delivery.
    GiveUp {
        /// Why no further attempt is made
        reason: String,
    },
}

impl RetryPolicy {
    /// Creates a retry policy.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` when `max_attempts` is zero.
    pub fn new(max_attempts: u32, backoff: BackoffPolicy) -> Result<Self> {
        if max_attempts == 0 {
            return Err(DeliveryError::configuration("max_attempts must be greater than zero"));
        }
        Ok(Self { max_attempts, backoff })
    }

    /// Decides the fate of a delivery that has now failed `attempt_count`
    /// times, the latest failure at `failed_at`.
    pub fn decide(&self, attempt_count: u32, failed_at: DateTime<Utc>) -> RetryDecision {
        if attempt_count >= self.max_attempts {
            return RetryDecision::GiveUp {
                reason: format!("maximum attempts ({}) reached", self.max_attempts),
            };
        }

        let delay = self.backoff.delay(attempt_count);
        let Ok(chrono_delay) = chrono::Duration::from_std(delay) else {
            return RetryDecision::GiveUp {
                reason: "retry delay duration out of range".to_string(),
            };
        };

        RetryDecision::Retry { next_attempt_at: failed_at + chrono_delay, delay }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_backoff_values() {
        assert_eq!(backoff(1), Duration::from_millis(2_000));
        assert_eq!(backoff(2), Duration::from_millis(4_000));
        assert_eq!(backoff(5), Duration::from_millis(32_000));
        assert_eq!(backoff(6), Duration::from_millis(60_000));
        assert_eq!(backoff(64), Duration::from_millis(60_000));
        assert_eq!(backoff(u32::MAX), Duration::from_millis(60_000));
    }

    #[test]
    fn zero_attempt_treated_as_first() {
        assert_eq!(backoff(0), backoff(1));
    }

    #[test]
    fn custom_policy_scales_base() {
        let policy = BackoffPolicy::new(Duration::from_millis(10), Duration::from_millis(100))
            .expect("valid policy");

        assert_eq!(policy.delay(1), Duration::from_millis(20));
        assert_eq!(policy.delay(3), Duration::from_millis(80));
        assert_eq!(policy.delay(4), Duration::from_millis(100));
    }

    #[test]
    fn invalid_backoff_rejected() {
        assert!(BackoffPolicy::new(Duration::ZERO, Duration::from_secs(1)).is_err());
        assert!(BackoffPolicy::new(Duration::from_secs(2), Duration::from_secs(1)).is_err());
        assert!(RetryPolicy::new(0, BackoffPolicy::default()).is_err());
    }

    #[test]
    fn decide_retries_below_budget() {
        let policy = RetryPolicy::default();
        let failed_at = Utc::now();

        let decision = policy.decide(3, failed_at);
        assert_eq!(
            decision,
            RetryDecision::Retry {
                next_attempt_at: failed_at + chrono::Duration::seconds(8),
                delay: Duration::from_secs(8),
            }
        );
    }

    #[test]
    fn decide_gives_up_at_budget() {
        let policy = RetryPolicy::default();

        assert!(matches!(policy.decide(4, Utc::now()), RetryDecision::Retry { .. }));
        assert!(matches!(policy.decide(5, Utc::now()), RetryDecision::GiveUp { .. }));
        assert!(matches!(policy.decide(6, Utc::now()), RetryDecision::GiveUp { .. }));
    }
}
