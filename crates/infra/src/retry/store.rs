//! Retry record storage.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};

use storefront_core::EventId;

use super::record::{RecordStatus, RetryRecord, RetryStatistics, RetrySubject};

/// Persistence contract for retry attempts and outcomes.
///
/// Every operation is idempotent with respect to re-applying the same
/// `(event_id, attempt_number)` pair. Implementations must tolerate
/// concurrent writers working on different event ids.
pub trait RetryRecordStore: Send + Sync {
    /// Append-or-upsert an attempt entry, creating the record if absent.
    fn record_attempt(
        &self,
        subject: &RetrySubject,
        attempt_number: u32,
        at: DateTime<Utc>,
    ) -> Result<(), RetryStoreError>;

    /// Attach failure detail to an attempt entry.
    fn record_failure(
        &self,
        event_id: EventId,
        attempt_number: u32,
        message: &str,
        at: DateTime<Utc>,
    ) -> Result<(), RetryStoreError>;

    /// Delete the record after terminal success.
    ///
    /// Returns whether a row was removed; only removals count as successes
    /// in the statistics.
    fn remove_record(&self, event_id: EventId) -> Result<bool, RetryStoreError>;

    /// Finalize the record as failed; it is retained for audit and manual retry.
    fn mark_as_failed(
        &self,
        event_id: EventId,
        message: &str,
        at: DateTime<Utc>,
    ) -> Result<(), RetryStoreError>;

    /// Reset a failed record to active with an empty history.
    fn reopen(&self, event_id: EventId, at: DateTime<Utc>) -> Result<(), RetryStoreError>;

    fn find_by_event_id(&self, event_id: EventId) -> Result<Option<RetryRecord>, RetryStoreError>;

    /// Failed records, oldest failure first.
    fn list_failed(&self, limit: usize) -> Result<Vec<RetryRecord>, RetryStoreError>;

    fn get_statistics(&self) -> Result<RetryStatistics, RetryStoreError>;

    /// Bulk-delete records whose last activity predates `cutoff`.
    ///
    /// Returns the exact number of rows removed.
    fn delete_old_records(&self, cutoff: DateTime<Utc>) -> Result<u64, RetryStoreError>;
}

/// Retry store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RetryStoreError {
    #[error("retry record not found: {0}")]
    NotFound(EventId),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl<S> RetryRecordStore for Arc<S>
where
    S: RetryRecordStore + ?Sized,
{
    fn record_attempt(
        &self,
        subject: &RetrySubject,
        attempt_number: u32,
        at: DateTime<Utc>,
    ) -> Result<(), RetryStoreError> {
        (**self).record_attempt(subject, attempt_number, at)
    }

    fn record_failure(
        &self,
        event_id: EventId,
        attempt_number: u32,
        message: &str,
        at: DateTime<Utc>,
    ) -> Result<(), RetryStoreError> {
        (**self).record_failure(event_id, attempt_number, message, at)
    }

    fn remove_record(&self, event_id: EventId) -> Result<bool, RetryStoreError> {
        (**self).remove_record(event_id)
    }

    fn mark_as_failed(
        &self,
        event_id: EventId,
        message: &str,
        at: DateTime<Utc>,
    ) -> Result<(), RetryStoreError> {
        (**self).mark_as_failed(event_id, message, at)
    }

    fn reopen(&self, event_id: EventId, at: DateTime<Utc>) -> Result<(), RetryStoreError> {
        (**self).reopen(event_id, at)
    }

    fn find_by_event_id(&self, event_id: EventId) -> Result<Option<RetryRecord>, RetryStoreError> {
        (**self).find_by_event_id(event_id)
    }

    fn list_failed(&self, limit: usize) -> Result<Vec<RetryRecord>, RetryStoreError> {
        (**self).list_failed(limit)
    }

    fn get_statistics(&self) -> Result<RetryStatistics, RetryStoreError> {
        (**self).get_statistics()
    }

    fn delete_old_records(&self, cutoff: DateTime<Utc>) -> Result<u64, RetryStoreError> {
        (**self).delete_old_records(cutoff)
    }
}

/// In-memory retry store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryRetryRecordStore {
    records: RwLock<HashMap<EventId, RetryRecord>>,
    cleared_on_success: AtomicU64,
}

impl InMemoryRetryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Number of rows currently retained.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<EventId, RetryRecord>> {
        self.records.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<EventId, RetryRecord>> {
        self.records.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl RetryRecordStore for InMemoryRetryRecordStore {
    fn record_attempt(
        &self,
        subject: &RetrySubject,
        attempt_number: u32,
        at: DateTime<Utc>,
    ) -> Result<(), RetryStoreError> {
        let mut records = self.write();
        let record = records
            .entry(subject.event_id)
            .or_insert_with(|| RetryRecord::open(subject, at));
        // A first attempt on a retained row is a new sequence for the same event.
        if attempt_number == 1 && record.status != RecordStatus::Active {
            record.restart(subject, at);
        }
        record.upsert_attempt(attempt_number, at);
        Ok(())
    }

    fn record_failure(
        &self,
        event_id: EventId,
        attempt_number: u32,
        message: &str,
        at: DateTime<Utc>,
    ) -> Result<(), RetryStoreError> {
        let mut records = self.write();
        let record = records
            .get_mut(&event_id)
            .ok_or(RetryStoreError::NotFound(event_id))?;
        record.fail_attempt(attempt_number, message, at);
        Ok(())
    }

    fn remove_record(&self, event_id: EventId) -> Result<bool, RetryStoreError> {
        let removed = self.write().remove(&event_id).is_some();
        if removed {
            self.cleared_on_success.fetch_add(1, Ordering::Relaxed);
        }
        Ok(removed)
    }

    fn mark_as_failed(
        &self,
        event_id: EventId,
        message: &str,
        at: DateTime<Utc>,
    ) -> Result<(), RetryStoreError> {
        let mut records = self.write();
        let record = records
            .get_mut(&event_id)
            .ok_or(RetryStoreError::NotFound(event_id))?;
        record.mark_failed(message, at);
        Ok(())
    }

    fn reopen(&self, event_id: EventId, at: DateTime<Utc>) -> Result<(), RetryStoreError> {
        let mut records = self.write();
        let record = records
            .get_mut(&event_id)
            .ok_or(RetryStoreError::NotFound(event_id))?;
        record.reopen(at);
        Ok(())
    }

    fn find_by_event_id(&self, event_id: EventId) -> Result<Option<RetryRecord>, RetryStoreError> {
        Ok(self.read().get(&event_id).cloned())
    }

    fn list_failed(&self, limit: usize) -> Result<Vec<RetryRecord>, RetryStoreError> {
        let records = self.read();
        let mut failed: Vec<_> = records
            .values()
            .filter(|r| r.status == RecordStatus::Failed)
            .cloned()
            .collect();

        failed.sort_by_key(|r| (r.failed_at, r.event_id));
        failed.truncate(limit);
        Ok(failed)
    }

    fn get_statistics(&self) -> Result<RetryStatistics, RetryStoreError> {
        let records = self.read();

        let mut stats = RetryStatistics {
            succeeded: self.cleared_on_success.load(Ordering::Relaxed),
            total_records: records.len() as u64,
            ..RetryStatistics::default()
        };

        for record in records.values() {
            match record.status {
                RecordStatus::Active => stats.active += 1,
                RecordStatus::Succeeded => stats.succeeded += 1,
                RecordStatus::Failed => stats.failed += 1,
            }
            stats.total_attempts += record.attempts.len() as u64;
        }

        Ok(stats)
    }

    fn delete_old_records(&self, cutoff: DateTime<Utc>) -> Result<u64, RetryStoreError> {
        let mut records = self.write();
        let before = records.len();
        records.retain(|_, r| r.last_activity_at >= cutoff);
        Ok((before - records.len()) as u64)
    }
}
