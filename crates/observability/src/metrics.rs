//! Event processing metrics.
//!
//! The retry pipeline reports one data point per terminal outcome of an
//! event's processing (never one per attempt). Exporters adapt this contract
//! to whatever backend the deployment uses.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tracing::info;

/// Sink for event processing outcomes.
pub trait EventMetrics: Send + Sync {
    /// Record the terminal outcome of processing one event.
    fn record_event_processed(&self, event_type: &str, success: bool);
}

impl<M> EventMetrics for Arc<M>
where
    M: EventMetrics + ?Sized,
{
    fn record_event_processed(&self, event_type: &str, success: bool) {
        (**self).record_event_processed(event_type, success)
    }
}

/// Discards every data point.
#[derive(Debug, Default, Copy, Clone)]
pub struct NoopMetrics;

impl EventMetrics for NoopMetrics {
    fn record_event_processed(&self, _event_type: &str, _success: bool) {}
}

/// Emits every outcome as a structured log line (`metric = "event_processed"`).
#[derive(Debug, Default, Copy, Clone)]
pub struct TracingEventMetrics;

impl EventMetrics for TracingEventMetrics {
    fn record_event_processed(&self, event_type: &str, success: bool) {
        info!(metric = "event_processed", event_type, success, "event processed");
    }
}

/// Success/failure counters for one event type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutcomeCounts {
    pub succeeded: u64,
    pub failed: u64,
}

impl OutcomeCounts {
    pub fn total(&self) -> u64 {
        self.succeeded + self.failed
    }
}

/// In-memory counters keyed by event type, for tests/dev and admin views.
#[derive(Debug, Default)]
pub struct InMemoryEventMetrics {
    counts: Mutex<BTreeMap<String, OutcomeCounts>>,
}

impl InMemoryEventMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Counters for a single event type (zero if never seen).
    pub fn counts_for(&self, event_type: &str) -> OutcomeCounts {
        self.lock().get(event_type).copied().unwrap_or_default()
    }

    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> BTreeMap<String, OutcomeCounts> {
        self.lock().clone()
    }

    /// Sum over all event types.
    pub fn totals(&self) -> OutcomeCounts {
        self.lock().values().fold(OutcomeCounts::default(), |acc, c| OutcomeCounts {
            succeeded: acc.succeeded + c.succeeded,
            failed: acc.failed + c.failed,
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, OutcomeCounts>> {
        // Counters stay meaningful even if a recording thread panicked.
        self.counts.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl EventMetrics for InMemoryEventMetrics {
    fn record_event_processed(&self, event_type: &str, success: bool) {
        let mut counts = self.lock();
        let entry = counts.entry(event_type.to_string()).or_default();
        if success {
            entry.succeeded += 1;
        } else {
            entry.failed += 1;
        }
    }
}
