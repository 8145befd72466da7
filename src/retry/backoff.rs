//! Backoff policies for re-arming failed entries

use crate::config::RetryConfig;
use std::time::Duration;

/// Capped exponential backoff keyed by a rejection counter
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay after the first rejection
    pub initial_delay: Duration,

    /// Upper bound on any single delay
    pub max_delay: Duration,

    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,

    /// Whether to add jitter to delays
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl BackoffPolicy {
    /// Calculate delay for a given attempt number (0-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let base_delay = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let capped_delay = base_delay.min(self.max_delay.as_secs_f64());

        let final_delay = if self.jitter {
            // Add up to 25% jitter
            let jitter = rand::random::<f64>() * 0.25 * capped_delay;
            capped_delay + jitter
        } else {
            capped_delay
        };

        Duration::from_secs_f64(final_delay)
    }
}

/// Everything the store needs to re-arm an entry after a failure
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Backoff for admission-control rejections
    pub resource: BackoffPolicy,

    /// Fixed delay before a logically failed entry is eligible again
    pub logical_delay: Duration,

    /// Extra time past an entry's timeout before its claim counts as abandoned
    pub lease_grace: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            resource: BackoffPolicy::default(),
            logical_delay: Duration::ZERO,
            lease_grace: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Create a policy from the `[retry]` config section
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            resource: BackoffPolicy {
                initial_delay: Duration::from_millis(config.resource_initial_delay_ms),
                max_delay: Duration::from_millis(config.resource_max_delay_ms),
                backoff_multiplier: config.resource_backoff_multiplier,
                jitter: config.jitter,
            },
            logical_delay: Duration::from_millis(config.logical_retry_delay_ms),
            lease_grace: Duration::from_secs(config.claim_lease_grace_seconds),
        }
    }

    /// Policy with no delays at all
    pub fn immediate() -> Self {
        Self {
            resource: BackoffPolicy {
                initial_delay: Duration::ZERO,
                max_delay: Duration::ZERO,
                backoff_multiplier: 1.0,
                jitter: false,
            },
            logical_delay: Duration::ZERO,
            lease_grace: Duration::ZERO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_delays() {
        let policy = BackoffPolicy {
            initial_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            jitter: false,
        };

        // Without jitter, delays should be deterministic
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(8));
        // Should cap at max_delay
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(30));
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn test_backoff_with_jitter() {
        let policy = BackoffPolicy {
            initial_delay: Duration::from_secs(1),
            jitter: true,
            ..Default::default()
        };

        // With jitter, delay should be >= base delay
        let delay = policy.delay_for_attempt(0);
        assert!(delay >= Duration::from_secs(1));
        assert!(delay <= Duration::from_millis(1250)); // 1s + 25% jitter
    }

    #[test]
    fn test_policy_from_config() {
        let config = RetryConfig {
            resource_initial_delay_ms: 250,
            resource_max_delay_ms: 4000,
            logical_retry_delay_ms: 100,
            jitter: false,
            ..Default::default()
        };

        let policy = RetryPolicy::from_config(&config);
        assert_eq!(policy.resource.initial_delay, Duration::from_millis(250));
        assert_eq!(policy.resource.delay_for_attempt(10), Duration::from_secs(4));
        assert_eq!(policy.logical_delay, Duration::from_millis(100));
    }
}
