//! Per-sequence retry state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use storefront_core::EventId;

use super::policy::RetryPolicy;

/// Lifecycle of one retry sequence.
///
/// `Pending → Attempting → {Succeeded | Attempting (retry) | DeadLettered}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SequenceState {
    /// Submitted, first attempt not started yet
    Pending,
    /// An attempt is running or the sequence waits for its next attempt
    Attempting,
    /// Processor succeeded
    Succeeded,
    /// Attempts exhausted (or cancelled), event handed to the dead-letter sink
    DeadLettered,
}

impl SequenceState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SequenceState::Succeeded | SequenceState::DeadLettered)
    }
}

/// Why a sequence was cut short before exhausting its attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    /// The executor is shutting down
    Shutdown,
    /// An operator cancelled the event explicitly
    Operator,
}

/// The error that ended (or most recently interrupted) a sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "snake_case", tag = "kind", content = "detail")]
pub enum RetryFailure {
    /// The processor returned an error (or panicked).
    #[error("{0}")]
    Processor(String),
    /// The wait before the next attempt was cancelled.
    #[error("retry cancelled ({0:?})")]
    Cancelled(CancelReason),
}

impl RetryFailure {
    pub fn processor(message: impl Into<String>) -> Self {
        Self::Processor(message.into())
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, RetryFailure::Cancelled(_))
    }
}

/// Terminal result of a retry sequence, delivered to observers that opted in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum RetryOutcome {
    Succeeded { attempts: u32 },
    DeadLettered { attempts: u32, error: RetryFailure },
}

impl RetryOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RetryOutcome::Succeeded { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            RetryOutcome::Succeeded { attempts } | RetryOutcome::DeadLettered { attempts, .. } => {
                *attempts
            }
        }
    }
}

/// In-memory state of one `execute_with_retry` sequence.
///
/// Owned by the executor while the sequence runs and dropped once a
/// terminal state is reached; only its effects are persisted.
#[derive(Debug, Clone)]
pub struct RetryContext {
    event_id: EventId,
    event_type: String,
    policy: RetryPolicy,
    attempt_count: u32,
    created_at: DateTime<Utc>,
    last_attempt_at: Option<DateTime<Utc>>,
    last_error: Option<RetryFailure>,
    state: SequenceState,
}

impl RetryContext {
    pub fn new(event_id: EventId, event_type: impl Into<String>, policy: RetryPolicy) -> Self {
        Self {
            event_id,
            event_type: event_type.into(),
            policy,
            attempt_count: 0,
            created_at: Utc::now(),
            last_attempt_at: None,
            last_error: None,
            state: SequenceState::Pending,
        }
    }

    pub fn event_id(&self) -> EventId {
        self.event_id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_attempt_at(&self) -> Option<DateTime<Utc>> {
        self.last_attempt_at
    }

    pub fn last_error(&self) -> Option<&RetryFailure> {
        self.last_error.as_ref()
    }

    pub fn state(&self) -> SequenceState {
        self.state
    }

    /// Start the next attempt; returns its 1-indexed number.
    pub fn begin_attempt(&mut self, at: DateTime<Utc>) -> u32 {
        self.attempt_count += 1;
        self.last_attempt_at = Some(at);
        self.state = SequenceState::Attempting;
        self.attempt_count
    }

    pub fn record_error(&mut self, error: RetryFailure) {
        self.last_error = Some(error);
    }

    /// No attempts left under the policy.
    pub fn is_exhausted(&self) -> bool {
        self.policy.is_last_attempt(self.attempt_count)
    }

    /// Backoff to wait after the attempt that just failed.
    pub fn next_delay(&self) -> std::time::Duration {
        self.policy.compute_delay(self.attempt_count)
    }

    pub fn mark_succeeded(&mut self) -> RetryOutcome {
        self.state = SequenceState::Succeeded;
        RetryOutcome::Succeeded {
            attempts: self.attempt_count,
        }
    }

    /// Transition to `DeadLettered`; the last recorded error is the terminal one.
    pub fn mark_dead_lettered(&mut self) -> RetryOutcome {
        self.state = SequenceState::DeadLettered;
        let error = self
            .last_error
            .clone()
            .unwrap_or_else(|| RetryFailure::processor("retry sequence ended without an error"));
        RetryOutcome::DeadLettered {
            attempts: self.attempt_count,
            error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(max_attempts: u32) -> RetryContext {
        let policy = RetryPolicy::new(
            max_attempts,
            std::time::Duration::from_millis(10),
            std::time::Duration::from_millis(100),
            2.0,
        )
        .unwrap();
        RetryContext::new(EventId::new(), "orders.placed", policy)
    }

    #[test]
    fn attempts_advance_through_states() {
        let mut c = ctx(2);
        assert_eq!(c.state(), SequenceState::Pending);
        assert!(c.last_attempt_at().is_none());

        let now = Utc::now();
        assert_eq!(c.begin_attempt(now), 1);
        assert_eq!(c.state(), SequenceState::Attempting);
        assert_eq!(c.last_attempt_at(), Some(now));
        assert!(!c.is_exhausted());
        assert_eq!(c.next_delay(), std::time::Duration::from_millis(10));

        c.record_error(RetryFailure::processor("smtp timeout"));
        assert_eq!(c.begin_attempt(Utc::now()), 2);
        assert!(c.is_exhausted());

        let outcome = c.mark_succeeded();
        assert_eq!(outcome, RetryOutcome::Succeeded { attempts: 2 });
        assert!(c.state().is_terminal());
    }

    #[test]
    fn dead_lettering_carries_last_error() {
        let mut c = ctx(3);
        c.begin_attempt(Utc::now());
        c.record_error(RetryFailure::processor("boom"));
        c.record_error(RetryFailure::Cancelled(CancelReason::Shutdown));

        let outcome = c.mark_dead_lettered();
        assert_eq!(c.state(), SequenceState::DeadLettered);
        assert_eq!(outcome.attempts(), 1);
        assert!(!outcome.is_success());
        match outcome {
            RetryOutcome::DeadLettered { error, .. } => assert!(error.is_cancellation()),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn failures_render_for_records() {
        assert_eq!(RetryFailure::processor("cache down").to_string(), "cache down");
        assert_eq!(
            RetryFailure::Cancelled(CancelReason::Operator).to_string(),
            "retry cancelled (Operator)"
        );
    }
}
