//! Operator-facing retry administration.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{info, warn};

use storefront_core::EventId;
use storefront_events::{Event, EventProcessor};

use super::executor::{CompletionHandle, RetryExecutor, SubmitError};
use super::record::{RecordStatus, RetryRecord, RetryStatistics};
use super::store::{RetryRecordStore, RetryStoreError};

/// Manual retry rejected.
#[derive(Debug, thiserror::Error)]
pub enum ManualRetryError {
    #[error("no retry record for event {0}")]
    RecordNotFound(EventId),
    #[error("retry record for event {0} has not failed")]
    NotFailed(EventId),
    #[error("retry record for event {0} has no payload snapshot")]
    PayloadMissing(EventId),
    #[error("payload snapshot for event {event_id} could not be decoded: {reason}")]
    PayloadDecode { event_id: EventId, reason: String },
    #[error(transparent)]
    Store(#[from] RetryStoreError),
    #[error(transparent)]
    Submit(#[from] SubmitError),
}

/// Cutoff for records idle for `days_old` days as of `now`.
///
/// Clamps to the earliest representable time, which matches no record.
pub fn retention_cutoff(now: DateTime<Utc>, days_old: u32) -> DateTime<Utc> {
    Duration::try_days(i64::from(days_old))
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Delete records whose last activity is older than `days_old` days.
pub fn cleanup_old_records(
    store: &dyn RetryRecordStore,
    days_old: u32,
) -> Result<u64, RetryStoreError> {
    let cutoff = retention_cutoff(Utc::now(), days_old);
    let deleted = store.delete_old_records(cutoff)?;
    info!(days_old, cutoff = %cutoff, deleted, "old retry records cleaned up");
    Ok(deleted)
}

/// Administrative surface over the retry store and executor.
pub struct RetryAdmin<E: Event> {
    store: Arc<dyn RetryRecordStore>,
    executor: Arc<RetryExecutor<E>>,
}

impl<E> RetryAdmin<E>
where
    E: Event + Serialize + DeserializeOwned,
{
    pub fn new(store: Arc<dyn RetryRecordStore>, executor: Arc<RetryExecutor<E>>) -> Self {
        Self { store, executor }
    }

    pub fn get_retry_statistics(&self) -> Result<RetryStatistics, RetryStoreError> {
        self.store.get_statistics()
    }

    /// Returns the number of records deleted.
    pub fn cleanup_old_retry_records(&self, days_old: u32) -> Result<u64, RetryStoreError> {
        cleanup_old_records(&*self.store, days_old)
    }

    /// Failed records, oldest failure first.
    pub fn failed_records(&self, limit: usize) -> Result<Vec<RetryRecord>, RetryStoreError> {
        self.store.list_failed(limit)
    }

    /// Re-run a dead-lettered event from its stored payload snapshot.
    ///
    /// The record is reset to active with an empty attempt history and the
    /// event is resubmitted with the policy it originally ran under.
    pub fn retry_event<P>(
        &self,
        event_id: EventId,
        processor: P,
    ) -> Result<CompletionHandle, ManualRetryError>
    where
        P: EventProcessor<E> + 'static,
    {
        let record = self
            .store
            .find_by_event_id(event_id)?
            .ok_or(ManualRetryError::RecordNotFound(event_id))?;

        if record.status != RecordStatus::Failed {
            return Err(ManualRetryError::NotFailed(event_id));
        }

        let payload = record
            .payload
            .clone()
            .ok_or(ManualRetryError::PayloadMissing(event_id))?;
        let event: E =
            serde_json::from_value(payload).map_err(|e| ManualRetryError::PayloadDecode {
                event_id,
                reason: e.to_string(),
            })?;
        if event.event_id() != event_id {
            return Err(ManualRetryError::PayloadDecode {
                event_id,
                reason: format!("snapshot carries event id {}", event.event_id()),
            });
        }

        let policy = record
            .policy
            .clone()
            .unwrap_or_else(|| self.executor.default_policy().clone());

        self.store.reopen(event_id, Utc::now())?;

        match self.executor.execute_with_retry(event, processor, policy) {
            Ok(handle) => {
                info!(event_id = %event_id, event_type = %record.event_type, "manual retry submitted");
                Ok(handle)
            }
            Err(err) => {
                let reason = record.failure_reason.as_deref().unwrap_or("manual retry rejected");
                if let Err(e) = self.store.mark_as_failed(event_id, reason, Utc::now()) {
                    warn!(event_id = %event_id, error = %e, "failed to restore failed status after rejected retry");
                }
                Err(err.into())
            }
        }
    }

    /// Cancel an in-flight sequence; see [`RetryExecutor::cancel`].
    pub fn cancel_event(&self, event_id: EventId) -> bool {
        self.executor.cancel(event_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    use storefront_events::{EventEnvelope, ProcessingError};
    use storefront_observability::NoopMetrics;

    use crate::retry::dead_letter::InMemoryDeadLetterQueue;
    use crate::retry::executor::RetryExecutorConfig;
    use crate::retry::policy::RetryPolicy;
    use crate::retry::record::RetrySubject;
    use crate::retry::store::InMemoryRetryRecordStore;

    type TestEvent = EventEnvelope<serde_json::Value>;

    fn admin() -> (Arc<InMemoryRetryRecordStore>, RetryAdmin<TestEvent>) {
        let store = InMemoryRetryRecordStore::arc();
        let executor = RetryExecutor::start(
            RetryExecutorConfig::default().with_workers(1),
            store.clone(),
            InMemoryDeadLetterQueue::<TestEvent>::arc(),
            Arc::new(NoopMetrics),
        )
        .unwrap();
        (store.clone(), RetryAdmin::new(store, Arc::new(executor)))
    }

    fn ok(_ev: &TestEvent) -> Result<(), ProcessingError> {
        Ok(())
    }

    #[test]
    fn cutoff_is_days_before_now() {
        let now = Utc::now();
        assert_eq!(retention_cutoff(now, 7), now - Duration::days(7));
        assert_eq!(retention_cutoff(now, 0), now);
    }

    #[test]
    fn oversized_retention_deletes_nothing() {
        let (store, admin) = admin();
        let subject = RetrySubject::new(EventId::new(), "orders.placed");
        store
            .record_attempt(&subject, 1, Utc::now() - Duration::days(400))
            .unwrap();

        assert_eq!(retention_cutoff(Utc::now(), u32::MAX), DateTime::<Utc>::MIN_UTC);
        assert_eq!(cleanup_old_records(&*store, u32::MAX).unwrap(), 0);
        assert_eq!(admin.cleanup_old_retry_records(u32::MAX).unwrap(), 0);
        assert!(store.find_by_event_id(subject.event_id).unwrap().is_some());
    }

    #[test]
    fn unknown_event_is_not_found() {
        let (_store, admin) = admin();
        let id = EventId::new();
        assert!(matches!(
            admin.retry_event(id, ok),
            Err(ManualRetryError::RecordNotFound(found)) if found == id
        ));
    }

    #[test]
    fn active_record_cannot_be_retried() {
        let (store, admin) = admin();
        let subject = RetrySubject::new(EventId::new(), "orders.placed");
        store.record_attempt(&subject, 1, Utc::now()).unwrap();

        assert!(matches!(
            admin.retry_event(subject.event_id, ok),
            Err(ManualRetryError::NotFailed(_))
        ));
    }

    #[test]
    fn missing_or_foreign_payload_is_rejected() {
        let (store, admin) = admin();
        let now = Utc::now();

        let bare = RetrySubject::new(EventId::new(), "orders.placed");
        store.record_attempt(&bare, 1, now).unwrap();
        store.mark_as_failed(bare.event_id, "boom", now).unwrap();
        assert!(matches!(
            admin.retry_event(bare.event_id, ok),
            Err(ManualRetryError::PayloadMissing(_))
        ));

        let other = EventEnvelope::new("orders.placed", serde_json::json!({}));
        let foreign = RetrySubject::new(EventId::new(), "orders.placed")
            .with_payload(serde_json::to_value(&other).unwrap());
        store.record_attempt(&foreign, 1, now).unwrap();
        store.mark_as_failed(foreign.event_id, "boom", now).unwrap();
        assert!(matches!(
            admin.retry_event(foreign.event_id, ok),
            Err(ManualRetryError::PayloadDecode { .. })
        ));

        let garbled = RetrySubject::new(EventId::new(), "orders.placed")
            .with_payload(serde_json::json!({"not": "an envelope"}));
        store.record_attempt(&garbled, 1, now).unwrap();
        store.mark_as_failed(garbled.event_id, "boom", now).unwrap();
        assert!(matches!(
            admin.retry_event(garbled.event_id, ok),
            Err(ManualRetryError::PayloadDecode { .. })
        ));
    }

    #[test]
    fn failed_record_is_rerun_from_snapshot() {
        let (store, admin) = admin();
        let now = Utc::now();
        let event = EventEnvelope::new("orders.placed", serde_json::json!({"order_id": 9}));
        let subject = RetrySubject::new(event.event_id(), "orders.placed")
            .with_payload(serde_json::to_value(&event).unwrap())
            .with_policy(RetryPolicy::no_retry());
        store.record_attempt(&subject, 1, now).unwrap();
        store.mark_as_failed(subject.event_id, "inventory offline", now).unwrap();

        let handle = admin.retry_event(subject.event_id, ok).unwrap();
        assert!(handle.wait_timeout(StdDuration::from_secs(5)));

        assert!(store.find_by_event_id(subject.event_id).unwrap().is_none());
        assert_eq!(admin.get_retry_statistics().unwrap().succeeded, 1);
    }

    #[test]
    fn cleanup_deletes_only_stale_records() {
        let (store, admin) = admin();
        let now = Utc::now();
        let stale = RetrySubject::new(EventId::new(), "orders.placed");
        let fresh = RetrySubject::new(EventId::new(), "orders.placed");
        store.record_attempt(&stale, 1, now - Duration::days(40)).unwrap();
        store.record_attempt(&fresh, 1, now - Duration::days(2)).unwrap();

        assert_eq!(admin.cleanup_old_retry_records(30).unwrap(), 1);
        assert!(store.find_by_event_id(fresh.event_id).unwrap().is_some());
        assert!(admin.failed_records(10).unwrap().is_empty());
    }
}
