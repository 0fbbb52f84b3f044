// src/retry.rs

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// Exponential backoff settings shared by segment- and download-level retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    /// Total attempts allowed before giving up, the first one included.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            max_attempts: 5,
        }
    }
}

/// Whether a failure is worth another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorClass {
    /// Timeouts, resets, 5xx, 408/429: the same request may well succeed later.
    Transient,
    /// 404-class answers and anything else that will not change on retry.
    Permanent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based), capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs.max(0.0))
        }
    }

    /// Decides what to do after the `failures`-th consecutive failure.
    pub fn decide(&self, failures: u32, class: ErrorClass) -> RetryDecision {
        if class == ErrorClass::Permanent || failures >= self.max_attempts {
            RetryDecision::GiveUp
        } else {
            RetryDecision::RetryAfter(self.delay_for(failures))
        }
    }
}

/// Retry bookkeeping for one unit of work. Lives only in memory.
#[derive(Debug, Clone, Default)]
pub struct RetryState {
    pub attempts: u32,
    pub next_eligible: Option<Instant>,
    pub last_error: Option<ErrorClass>,
}

impl RetryState {
    /// Records a failure and returns the policy's verdict for it.
    pub fn record_failure(&mut self, policy: &RetryPolicy, class: ErrorClass) -> RetryDecision {
        self.attempts += 1;
        self.last_error = Some(class);
        let decision = policy.decide(self.attempts, class);
        self.next_eligible = match decision {
            RetryDecision::RetryAfter(delay) => Some(Instant::now() + delay),
            RetryDecision::GiveUp => None,
        };
        decision
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_follow_exponential_sequence() {
        let policy = RetryPolicy::default();
        let delays: Vec<u64> = (1..=5).map(|a| policy.delay_for(a).as_secs()).collect();
        assert_eq!(delays, vec![2, 4, 8, 16, 32]);
    }

    #[test]
    fn delays_are_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(6), Duration::from_secs(60));
        assert_eq!(policy.delay_for(40), Duration::from_secs(60));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn custom_multiplier() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(100),
            multiplier: 3.0,
            max_delay: Duration::from_secs(10),
            max_attempts: 4,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(300));
        assert_eq!(policy.delay_for(3), Duration::from_millis(900));
    }

    #[test]
    fn permanent_errors_are_never_retried() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.decide(1, ErrorClass::Permanent), RetryDecision::GiveUp);
    }

    #[test]
    fn budget_is_exhausted_after_max_attempts() {
        let policy = RetryPolicy::default();
        let mut state = RetryState::default();
        for attempt in 1..policy.max_attempts {
            assert_eq!(
                state.record_failure(&policy, ErrorClass::Transient),
                RetryDecision::RetryAfter(policy.delay_for(attempt))
            );
        }
        assert_eq!(state.record_failure(&policy, ErrorClass::Transient), RetryDecision::GiveUp);
        assert_eq!(state.attempts, policy.max_attempts);
        assert!(state.next_eligible.is_none());

        state.reset();
        assert_eq!(state.attempts, 0);
        assert!(state.last_error.is_none());
    }
}
