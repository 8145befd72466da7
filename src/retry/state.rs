//! Consolidated retry/backoff state of one schedule entry
//!
//! An entry carries two independent budgets: logical attempts, bounded by
//! `max_attempts`, and transient admission rejections, which are unbounded
//! but push the entry's eligibility further out through `wait_factor`.

use super::backoff::RetryPolicy;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which budget a failure is charged to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryKind {
    /// Admission rejection from an external resource governor
    Transient,
    /// Script/runtime failure or timeout
    Logical,
}

impl RetryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetryKind::Transient => "transient",
            RetryKind::Logical => "logical",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "transient" => Some(Self::Transient),
            "logical" => Some(Self::Logical),
            _ => None,
        }
    }
}

/// Result of charging a failure to an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Entry goes back to READY, eligible from `next_eligible_at` (immediately if `None`)
    Rearm {
        next_eligible_at: Option<DateTime<Utc>>,
    },
    /// Logical budget exhausted
    Exhausted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetryState {
    /// Budget charged by the most recent failure
    pub last_kind: Option<RetryKind>,

    /// Logical failures so far (`retry_count`)
    pub attempts: u32,

    /// Logical failure budget (`max_retries`)
    pub max_attempts: u32,

    /// Admission rejections so far (`resource_retry_count`)
    pub transient_attempts: u32,

    /// Backoff counter driving the rejection delay
    pub wait_factor: u32,

    /// Entry is ineligible for dispatch before this instant
    pub next_eligible_at: Option<DateTime<Utc>>,

    pub last_rejection_reason: Option<String>,
}

impl RetryState {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            last_kind: None,
            attempts: 0,
            max_attempts,
            transient_attempts: 0,
            wait_factor: 0,
            next_eligible_at: None,
            last_rejection_reason: None,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    /// Budget left and backoff window elapsed
    pub fn is_eligible_at(&self, now: DateTime<Utc>) -> bool {
        !self.is_exhausted() && self.next_eligible_at.is_none_or(|at| at <= now)
    }

    /// Charge one failure of the given kind
    pub fn record(
        &mut self,
        kind: RetryKind,
        reason: &str,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> RetryDecision {
        self.last_kind = Some(kind);

        match kind {
            RetryKind::Transient => {
                let delay = policy.resource.delay_for_attempt(self.wait_factor);
                self.transient_attempts = self.transient_attempts.saturating_add(1);
                self.wait_factor = self.wait_factor.saturating_add(1);
                self.last_rejection_reason = Some(reason.to_string());
                self.next_eligible_at = Some(eligible_after(now, delay));

                RetryDecision::Rearm {
                    next_eligible_at: self.next_eligible_at,
                }
            }
            RetryKind::Logical => {
                self.attempts = self.attempts.saturating_add(1);
                if self.is_exhausted() {
                    self.next_eligible_at = None;
                    return RetryDecision::Exhausted;
                }

                self.next_eligible_at = if policy.logical_delay.is_zero() {
                    None
                } else {
                    Some(eligible_after(now, policy.logical_delay))
                };

                RetryDecision::Rearm {
                    next_eligible_at: self.next_eligible_at,
                }
            }
        }
    }
}

/// `now + delay`, saturating at the latest representable instant
fn eligible_after(now: DateTime<Utc>, delay: std::time::Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::retry::BackoffPolicy;
    use std::time::Duration;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            resource: BackoffPolicy {
                initial_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(8),
                backoff_multiplier: 2.0,
                jitter: false,
            },
            logical_delay: Duration::ZERO,
            lease_grace: Duration::ZERO,
        }
    }

    #[test]
    fn test_rejection_leaves_logical_budget_alone() {
        let now = Utc::now();
        let mut state = RetryState::new(3);

        let decision = state.record(RetryKind::Transient, "pool full", &policy(), now);
        let first = now + chrono::Duration::seconds(1);
        assert_eq!(
            decision,
            RetryDecision::Rearm {
                next_eligible_at: Some(first)
            }
        );

        let decision = state.record(RetryKind::Transient, "pool still full", &policy(), now);
        let second = now + chrono::Duration::seconds(2);
        assert_eq!(
            decision,
            RetryDecision::Rearm {
                next_eligible_at: Some(second)
            }
        );

        assert_eq!(state.attempts, 0);
        assert_eq!(state.transient_attempts, 2);
        assert_eq!(state.wait_factor, 2);
        assert_eq!(state.last_rejection_reason.as_deref(), Some("pool still full"));
        assert!(!state.is_eligible_at(now));
        assert!(state.is_eligible_at(second));
    }

    #[test]
    fn test_logical_exhaustion() {
        let now = Utc::now();
        let mut state = RetryState::new(3);

        assert!(matches!(
            state.record(RetryKind::Logical, "exit 1", &policy(), now),
            RetryDecision::Rearm { next_eligible_at: None }
        ));
        assert!(matches!(
            state.record(RetryKind::Logical, "exit 1", &policy(), now),
            RetryDecision::Rearm { .. }
        ));
        assert_eq!(
            state.record(RetryKind::Logical, "exit 1", &policy(), now),
            RetryDecision::Exhausted
        );
        assert_eq!(state.attempts, 3);
        assert!(state.is_exhausted());
        assert!(!state.is_eligible_at(now + chrono::Duration::days(1)));
    }

    #[test]
    fn test_logical_delay() {
        let now = Utc::now();
        let mut state = RetryState::new(2);
        let policy = RetryPolicy {
            logical_delay: Duration::from_millis(500),
            ..policy()
        };

        state.record(RetryKind::Logical, "boom", &policy, now);
        assert_eq!(
            state.next_eligible_at,
            Some(now + chrono::Duration::milliseconds(500))
        );
        assert_eq!(state.last_kind, Some(RetryKind::Logical));
    }

    #[test]
    fn test_rejection_backoff_is_capped() {
        let now = Utc::now();
        let mut state = RetryState::new(1);
        for _ in 0..10 {
            state.record(RetryKind::Transient, "busy", &policy(), now);
        }
        assert_eq!(state.next_eligible_at, Some(now + chrono::Duration::seconds(8)));
        assert_eq!(state.wait_factor, 10);
    }

    #[test]
    fn test_huge_delays_saturate() {
        let now = Utc::now();
        let policy = RetryPolicy::from_config(&RetryConfig {
            resource_initial_delay_ms: u64::MAX,
            resource_max_delay_ms: u64::MAX,
            logical_retry_delay_ms: u64::MAX,
            ..RetryConfig::default()
        });

        let mut state = RetryState::new(3);
        let decision = state.record(RetryKind::Transient, "busy", &policy, now);
        assert_eq!(
            decision,
            RetryDecision::Rearm {
                next_eligible_at: Some(DateTime::<Utc>::MAX_UTC)
            }
        );

        state.record(RetryKind::Logical, "boom", &policy, now);
        assert_eq!(state.next_eligible_at, Some(DateTime::<Utc>::MAX_UTC));
        assert!(!state.is_eligible_at(now));
    }

    #[test]
    fn test_kind_round_trip() {
        assert_eq!(RetryKind::parse("transient"), Some(RetryKind::Transient));
        assert_eq!(RetryKind::parse(RetryKind::Logical.as_str()), Some(RetryKind::Logical));
        assert_eq!(RetryKind::parse("other"), None);
    }
}
