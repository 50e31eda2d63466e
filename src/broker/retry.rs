//! Retry budget and backoff schedule shared by queues and subscriptions.

use std::time::Duration;

/// Configuration for redelivery of failed messages.
///
/// The delay before attempt `n + 1` becomes visible is
/// `min(backoff_cap, backoff_base * backoff_multiplier^(n - 1))`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of delivery attempts, the first one included.
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    pub backoff_base: Duration,
    /// Growth factor between successive delays.
    pub backoff_multiplier: f64,
    /// Upper bound on any single delay.
    pub backoff_cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base: Duration::from_millis(500),
            backoff_multiplier: 2.0,
            backoff_cap: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// A policy that redelivers immediately. Handy for tests and for queues
    /// where ordering matters more than pacing.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            backoff_base: Duration::ZERO,
            backoff_multiplier: 1.0,
            backoff_cap: Duration::ZERO,
        }
    }

    /// Delay before a message that has failed `attempts` times may be leased
    /// again.
    pub fn backoff(&self, attempts: u32) -> Duration {
        if attempts == 0 || self.backoff_base.is_zero() {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(attempts - 1).unwrap_or(i32::MAX);
        let factor = self.backoff_multiplier.powi(exponent);
        let scaled = self.backoff_base.as_nanos() as f64 * factor;
        if !scaled.is_finite() || scaled >= self.backoff_cap.as_nanos() as f64 {
            return self.backoff_cap;
        }
        Duration::from_nanos(scaled as u64)
    }

    /// Whether a message that has been attempted `attempts` times may be
    /// retried once more.
    pub fn allows_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be at least 1".to_string());
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(format!(
                "backoff_multiplier must be a finite number >= 1.0, got {}",
                self.backoff_multiplier
            ));
        }
        if self.backoff_base > self.backoff_cap {
            return Err("backoff_base must not exceed backoff_cap".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 5,
            backoff_base: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            backoff_cap: Duration::from_millis(500),
        }
    }

    #[test]
    fn backoff_grows_exponentially_until_cap() {
        let policy = policy();
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
        assert_eq!(policy.backoff(4), Duration::from_millis(500));
        assert_eq!(policy.backoff(60), Duration::from_millis(500));
    }

    #[test]
    fn immediate_policy_never_waits() {
        let policy = RetryPolicy::immediate(3);
        assert_eq!(policy.backoff(1), Duration::ZERO);
        assert_eq!(policy.backoff(2), Duration::ZERO);
    }

    #[test]
    fn retry_budget() {
        let policy = RetryPolicy::immediate(2);
        assert!(policy.allows_retry(1));
        assert!(!policy.allows_retry(2));
    }

    #[test]
    fn validate_rejects_bad_policies() {
        assert!(RetryPolicy::immediate(0).validate().is_err());
        let shrinking = RetryPolicy {
            backoff_multiplier: 0.5,
            ..policy()
        };
        assert!(shrinking.validate().is_err());
        assert!(policy().validate().is_ok());
    }
}
