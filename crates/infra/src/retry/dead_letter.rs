//! Dead-letter destinations for events that exhausted their retries.

use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::error;

use storefront_core::EventId;
use storefront_events::Event;

use super::context::RetryFailure;

/// Terminal destination for permanently failing events.
///
/// `send` cannot fail from the caller's point of view: a sink logs and
/// absorbs its own delivery problems. The executor finalizes the retry
/// record whether or not delivery worked.
pub trait DeadLetterSink<E>: Send + Sync {
    fn send(&self, event: &E, last_error: &RetryFailure, attempts_made: u32);
}

impl<E, S> DeadLetterSink<E> for Arc<S>
where
    S: DeadLetterSink<E> + ?Sized,
{
    fn send(&self, event: &E, last_error: &RetryFailure, attempts_made: u32) {
        (**self).send(event, last_error, attempts_made)
    }
}

/// Entry in the dead-letter queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter<E> {
    pub event: E,
    pub error: RetryFailure,
    pub attempts_made: u32,
    pub dead_lettered_at: DateTime<Utc>,
}

/// In-memory dead-letter queue for tests/dev and operator inspection.
#[derive(Debug)]
pub struct InMemoryDeadLetterQueue<E> {
    entries: Mutex<Vec<DeadLetter<E>>>,
}

impl<E> InMemoryDeadLetterQueue<E> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<DeadLetter<E>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<E: Event> InMemoryDeadLetterQueue<E> {
    /// All entries, oldest first.
    pub fn list(&self) -> Vec<DeadLetter<E>> {
        self.lock().clone()
    }

    /// Most recent entry for an event.
    pub fn get(&self, event_id: EventId) -> Option<DeadLetter<E>> {
        self.lock()
            .iter()
            .rev()
            .find(|e| e.event.event_id() == event_id)
            .cloned()
    }

    /// Remove and return every entry for an event (e.g. before replaying it).
    pub fn take(&self, event_id: EventId) -> Vec<DeadLetter<E>> {
        let mut entries = self.lock();
        let (taken, kept): (Vec<_>, Vec<_>) = entries
            .drain(..)
            .partition(|e| e.event.event_id() == event_id);
        *entries = kept;
        taken
    }
}

impl<E> Default for InMemoryDeadLetterQueue<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Event> DeadLetterSink<E> for InMemoryDeadLetterQueue<E> {
    fn send(&self, event: &E, last_error: &RetryFailure, attempts_made: u32) {
        self.lock().push(DeadLetter {
            event: event.clone(),
            error: last_error.clone(),
            attempts_made,
            dead_lettered_at: Utc::now(),
        });
    }
}

/// Writes dead-lettered events to the error log only.
///
/// Useful where an external log pipeline is the dead-letter store.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingDeadLetterSink;

impl<E: Event> DeadLetterSink<E> for TracingDeadLetterSink {
    fn send(&self, event: &E, last_error: &RetryFailure, attempts_made: u32) {
        error!(
            event_id = %event.event_id(),
            event_type = event.event_type(),
            attempts = attempts_made,
            error = %last_error,
            "event dead-lettered"
        );
    }
}
