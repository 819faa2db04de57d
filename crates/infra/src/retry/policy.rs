//! Retry policy: how many attempts, and how long to wait between them.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Rejected policy parameters.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InvalidPolicyError {
    #[error("max_attempts must be at least 1 (got {0})")]
    MaxAttempts(u32),
    #[error("backoff_multiplier must be a finite value >= 1.0 (got {0})")]
    BackoffMultiplier(f64),
    #[error("max_delay ({max_delay:?}) must not be shorter than initial_delay ({initial_delay:?})")]
    DelayBounds {
        initial_delay: Duration,
        max_delay: Duration,
    },
}

/// Exponential backoff retry policy.
///
/// Immutable once built; every constructor validates its parameters so an
/// invalid policy never reaches the executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawRetryPolicy", into = "RawRetryPolicy")]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_delay: Duration,
    max_delay: Duration,
    backoff_multiplier: f64,
}

impl RetryPolicy {
    pub fn new(
        max_attempts: u32,
        initial_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f64,
    ) -> Result<Self, InvalidPolicyError> {
        if max_attempts < 1 {
            return Err(InvalidPolicyError::MaxAttempts(max_attempts));
        }
        if !backoff_multiplier.is_finite() || backoff_multiplier < 1.0 {
            return Err(InvalidPolicyError::BackoffMultiplier(backoff_multiplier));
        }
        if max_delay < initial_delay {
            return Err(InvalidPolicyError::DelayBounds {
                initial_delay,
                max_delay,
            });
        }
        Ok(Self {
            max_attempts,
            initial_delay,
            max_delay,
            backoff_multiplier,
        })
    }

    /// General-purpose preset: 3 attempts, 1s doubling up to 30s.
    pub fn default_policy() -> Self {
        Self::preset(3, Duration::from_millis(1_000), Duration::from_secs(30), 2.0)
    }

    /// Events whose side effects must not be lost (payments, stock levels):
    /// more attempts, quicker first retry, longer cap.
    pub fn critical_event_policy() -> Self {
        Self::preset(5, Duration::from_millis(500), Duration::from_secs(60), 2.0)
    }

    /// Outbound notifications: providers throttle, so back off harder and
    /// give up sooner than critical work.
    pub fn notification_event_policy() -> Self {
        Self::preset(4, Duration::from_secs(2), Duration::from_secs(120), 3.0)
    }

    /// Single attempt, no retries.
    pub fn no_retry() -> Self {
        Self::preset(1, Duration::ZERO, Duration::ZERO, 1.0)
    }

    fn preset(
        max_attempts: u32,
        initial_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f64,
    ) -> Self {
        Self {
            max_attempts,
            initial_delay,
            max_delay,
            backoff_multiplier,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn backoff_multiplier(&self) -> f64 {
        self.backoff_multiplier
    }

    /// Delay to wait after the given (1-indexed) failed attempt.
    ///
    /// `min(initial_delay * backoff_multiplier^(attempt-1), max_delay)`.
    /// Attempt 0 is treated as attempt 1.
    pub fn compute_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let base_nanos = self.initial_delay.as_nanos() as f64;
        let max_nanos = self.max_delay.as_nanos() as f64;

        let delay_nanos = base_nanos * self.backoff_multiplier.powi(exponent);
        if !delay_nanos.is_finite() || delay_nanos >= max_nanos {
            return self.max_delay;
        }
        Duration::from_nanos(delay_nanos as u64)
    }

    /// Whether `attempt` is the final one this policy allows.
    pub fn is_last_attempt(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::default_policy()
    }
}

/// Wire form; converted through `RetryPolicy::new` so persisted policies are
/// re-validated on load.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawRetryPolicy {
    max_attempts: u32,
    initial_delay_ms: u64,
    max_delay_ms: u64,
    backoff_multiplier: f64,
}

impl TryFrom<RawRetryPolicy> for RetryPolicy {
    type Error = InvalidPolicyError;

    fn try_from(raw: RawRetryPolicy) -> Result<Self, Self::Error> {
        RetryPolicy::new(
            raw.max_attempts,
            Duration::from_millis(raw.initial_delay_ms),
            Duration::from_millis(raw.max_delay_ms),
            raw.backoff_multiplier,
        )
    }
}

impl From<RetryPolicy> for RawRetryPolicy {
    fn from(policy: RetryPolicy) -> Self {
        Self {
            max_attempts: policy.max_attempts,
            initial_delay_ms: policy.initial_delay.as_millis() as u64,
            max_delay_ms: policy.max_delay.as_millis() as u64,
            backoff_multiplier: policy.backoff_multiplier,
        }
    }
}
