//! Persisted retry bookkeeping.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use storefront_core::EventId;

use super::policy::RetryPolicy;

/// Status of a persisted retry record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    /// Sequence still running (or waiting for its next attempt)
    Active,
    /// Processor succeeded; such rows are normally removed right away
    Succeeded,
    /// Attempts exhausted, event dead-lettered; retained for audit/manual retry
    Failed,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Active => "active",
            RecordStatus::Succeeded => "succeeded",
            RecordStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(RecordStatus::Active),
            "succeeded" => Some(RecordStatus::Succeeded),
            "failed" => Some(RecordStatus::Failed),
            _ => None,
        }
    }
}

/// One attempt in a record's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryAttempt {
    pub attempt_number: u32,
    pub attempted_at: DateTime<Utc>,
    pub error_message: Option<String>,
    pub failed_at: Option<DateTime<Utc>>,
}

impl RetryAttempt {
    pub fn started(attempt_number: u32, attempted_at: DateTime<Utc>) -> Self {
        Self {
            attempt_number,
            attempted_at,
            error_message: None,
            failed_at: None,
        }
    }
}

/// What a store needs to open a record on the first attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySubject {
    pub event_id: EventId,
    pub event_type: String,
    /// Snapshot of the event, so an operator can re-trigger it later.
    pub payload: Option<JsonValue>,
    pub policy: Option<RetryPolicy>,
}

impl RetrySubject {
    pub fn new(event_id: EventId, event_type: impl Into<String>) -> Self {
        Self {
            event_id,
            event_type: event_type.into(),
            payload: None,
            policy: None,
        }
    }

    pub fn with_payload(mut self, payload: JsonValue) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = Some(policy);
        self
    }
}

/// Audit trail of one event's retry sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryRecord {
    pub event_id: EventId,
    pub event_type: String,
    /// Ordered by `attempt_number`.
    pub attempts: Vec<RetryAttempt>,
    pub status: RecordStatus,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub failed_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub payload: Option<JsonValue>,
    pub policy: Option<RetryPolicy>,
}

impl RetryRecord {
    /// Open a record for a subject's first recorded attempt.
    pub fn open(subject: &RetrySubject, at: DateTime<Utc>) -> Self {
        Self {
            event_id: subject.event_id,
            event_type: subject.event_type.clone(),
            attempts: Vec::new(),
            status: RecordStatus::Active,
            created_at: at,
            last_activity_at: at,
            failed_at: None,
            failure_reason: None,
            payload: subject.payload.clone(),
            policy: subject.policy.clone(),
        }
    }

    /// Insert or refresh the entry for `attempt_number`, keeping order.
    pub fn upsert_attempt(&mut self, attempt_number: u32, at: DateTime<Utc>) {
        match self
            .attempts
            .binary_search_by_key(&attempt_number, |a| a.attempt_number)
        {
            Ok(idx) => self.attempts[idx].attempted_at = at,
            Err(idx) => self
                .attempts
                .insert(idx, RetryAttempt::started(attempt_number, at)),
        }
        self.touch(at);
    }

    /// Attach failure detail to an attempt (creating the entry if missing).
    pub fn fail_attempt(&mut self, attempt_number: u32, message: &str, at: DateTime<Utc>) {
        let idx = match self
            .attempts
            .binary_search_by_key(&attempt_number, |a| a.attempt_number)
        {
            Ok(idx) => idx,
            Err(idx) => {
                self.attempts
                    .insert(idx, RetryAttempt::started(attempt_number, at));
                idx
            }
        };
        let entry = &mut self.attempts[idx];
        entry.error_message = Some(message.to_string());
        entry.failed_at = Some(at);
        self.touch(at);
    }

    pub fn mark_failed(&mut self, reason: &str, at: DateTime<Utc>) {
        self.status = RecordStatus::Failed;
        self.failed_at = Some(at);
        self.failure_reason = Some(reason.to_string());
        self.touch(at);
    }

    /// Reset a failed record so a manually re-triggered sequence starts clean.
    pub fn reopen(&mut self, at: DateTime<Utc>) {
        self.status = RecordStatus::Active;
        self.attempts.clear();
        self.failed_at = None;
        self.failure_reason = None;
        self.touch(at);
    }

    /// Start a new sequence on a retained record: same reset as
    /// [`reopen`](Self::reopen), with the new subject's snapshot taking over.
    pub fn restart(&mut self, subject: &RetrySubject, at: DateTime<Utc>) {
        self.reopen(at);
        self.event_type = subject.event_type.clone();
        if subject.payload.is_some() {
            self.payload = subject.payload.clone();
        }
        if subject.policy.is_some() {
            self.policy = subject.policy.clone();
        }
    }

    pub fn attempt_count(&self) -> usize {
        self.attempts.len()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.attempts
            .iter()
            .rev()
            .find_map(|a| a.error_message.as_deref())
    }

    fn touch(&mut self, at: DateTime<Utc>) {
        if at > self.last_activity_at {
            self.last_activity_at = at;
        }
    }
}

/// Aggregate view over the retry records, computed on demand.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryStatistics {
    /// Rows whose sequence is still running.
    pub active: u64,
    /// Sequences that succeeded and had their row cleared (not visible as rows).
    pub succeeded: u64,
    /// Rows retained after dead-lettering.
    pub failed: u64,
    /// Attempt entries across all retained rows.
    pub total_attempts: u64,
    /// Rows currently retained.
    pub total_records: u64,
}
