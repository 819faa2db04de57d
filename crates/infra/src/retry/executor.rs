//! Retry executor: runs event processors with backoff and dead-lettering.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use storefront_core::EventId;
use storefront_events::{Event, EventProcessor};
use storefront_observability::EventMetrics;

use super::context::{CancelReason, RetryContext, RetryFailure, RetryOutcome};
use super::dead_letter::DeadLetterSink;
use super::policy::RetryPolicy;
use super::record::RetrySubject;
use super::scheduler::DelayQueue;
use super::store::RetryRecordStore;

/// Retry executor configuration.
#[derive(Debug, Clone)]
pub struct RetryExecutorConfig {
    /// Name for logging and worker thread names
    pub name: String,
    /// Size of the worker pool (attempts running at the same time)
    pub workers: usize,
    /// Policy used when a caller does not pick one
    pub default_policy: RetryPolicy,
}

impl Default for RetryExecutorConfig {
    fn default() -> Self {
        Self {
            name: "event-retry".to_string(),
            workers: 4,
            default_policy: RetryPolicy::default_policy(),
        }
    }
}

impl RetryExecutorConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_default_policy(mut self, policy: RetryPolicy) -> Self {
        self.default_policy = policy;
        self
    }
}

/// Submission rejected before any attempt was made.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    #[error("retry executor is shut down")]
    ShutDown,
}

/// Executor runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutorStats {
    pub sequences_started: u64,
    pub submissions_merged: u64,
    pub attempts: u64,
    pub succeeded: u64,
    pub dead_lettered: u64,
    pub cancelled: u64,
    pub in_flight: usize,
    pub waiting: usize,
    pub uptime_secs: u64,
}

/// Completion handle for fire-and-forget submissions.
///
/// Completes once the sequence reached a terminal state. It never reveals
/// whether processing succeeded; that is visible through the retry store,
/// metrics and logs. Dropping the handle does not affect the sequence.
#[derive(Debug)]
pub struct CompletionHandle {
    event_id: EventId,
    rx: mpsc::Receiver<RetryOutcome>,
}

impl CompletionHandle {
    pub fn event_id(&self) -> EventId {
        self.event_id
    }

    /// Block until the sequence has finished.
    pub fn wait(self) {
        let _ = self.rx.recv();
    }

    /// Block for up to `timeout`; returns whether the sequence finished.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        !matches!(
            self.rx.recv_timeout(timeout),
            Err(mpsc::RecvTimeoutError::Timeout)
        )
    }
}

/// Handle for callers that opted into observing the terminal outcome.
#[derive(Debug)]
pub struct OutcomeHandle {
    event_id: EventId,
    rx: mpsc::Receiver<RetryOutcome>,
}

impl OutcomeHandle {
    pub fn event_id(&self) -> EventId {
        self.event_id
    }

    /// Block until the outcome is known.
    ///
    /// `None` if the executor went away without reporting one.
    pub fn wait(self) -> Option<RetryOutcome> {
        self.rx.recv().ok()
    }

    /// Block for up to `timeout`; `None` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<RetryOutcome> {
        self.rx.recv_timeout(timeout).ok()
    }
}

/// One retry sequence travelling between the delay queue and the workers.
struct RetrySequence<E> {
    event: E,
    processor: Arc<dyn EventProcessor<E>>,
    context: RetryContext,
    subject: RetrySubject,
}

impl<E> RetrySequence<E> {
    fn event_id(&self) -> EventId {
        self.context.event_id()
    }
}

/// Bookkeeping for an event id whose sequence has not finished yet.
struct InFlight<E> {
    waiters: Vec<mpsc::Sender<RetryOutcome>>,
    cancel: Option<CancelReason>,
    // Set once the sequence has reached its terminal state. Submissions
    // arriving after that start `next` instead of joining.
    finalizing: bool,
    next: Option<Successor<E>>,
}

impl<E> InFlight<E> {
    fn new(waiters: Vec<mpsc::Sender<RetryOutcome>>) -> Self {
        Self {
            waiters,
            cancel: None,
            finalizing: false,
            next: None,
        }
    }
}

/// A sequence submitted while its predecessor was finalizing; scheduled by `finish`.
struct Successor<E> {
    sequence: RetrySequence<E>,
    waiters: Vec<mpsc::Sender<RetryOutcome>>,
    cancel: Option<CancelReason>,
}

struct Shared<E> {
    name: String,
    default_policy: RetryPolicy,
    store: Arc<dyn RetryRecordStore>,
    dead_letters: Arc<dyn DeadLetterSink<E>>,
    metrics: Arc<dyn EventMetrics>,
    queue: DelayQueue<RetrySequence<E>>,
    // Lock order: `in_flight` before the queue's internal lock.
    in_flight: Mutex<HashMap<EventId, InFlight<E>>>,
    accepting: AtomicBool,
    stats: Mutex<ExecutorStats>,
    started_at: Instant,
}

/// Runs event processors with exponential backoff on a bounded worker pool.
///
/// - each submission becomes a retry sequence; attempts within a sequence
///   are strictly sequential
/// - backoff waits park the sequence in a delay queue, releasing the worker
/// - concurrent submissions for the same event id join the sequence already
///   in flight instead of starting a second one
/// - exhausted (or cancelled) sequences go to the dead-letter sink and their
///   retry record is finalized as failed
///
/// Processing errors never reach the submitter. Dropping the executor shuts
/// it down.
pub struct RetryExecutor<E: Event> {
    shared: Arc<Shared<E>>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl<E> RetryExecutor<E>
where
    E: Event + Serialize,
{
    /// Start the worker pool.
    pub fn start(
        config: RetryExecutorConfig,
        store: Arc<dyn RetryRecordStore>,
        dead_letters: Arc<dyn DeadLetterSink<E>>,
        metrics: Arc<dyn EventMetrics>,
    ) -> std::io::Result<Self> {
        let shared = Arc::new(Shared {
            name: config.name.clone(),
            default_policy: config.default_policy,
            store,
            dead_letters,
            metrics,
            queue: DelayQueue::new(),
            in_flight: Mutex::new(HashMap::new()),
            accepting: AtomicBool::new(true),
            stats: Mutex::new(ExecutorStats::default()),
            started_at: Instant::now(),
        });

        let executor = Self {
            shared,
            workers: Mutex::new(Vec::new()),
        };

        for idx in 0..config.workers.max(1) {
            let shared = executor.shared.clone();
            let join = thread::Builder::new()
                .name(format!("{}-{}", config.name, idx))
                .spawn(move || worker_loop(shared))?;
            executor.lock_workers().push(join);
        }

        info!(executor = %config.name, workers = config.workers.max(1), "retry executor started");
        Ok(executor)
    }

    /// Policy applied by [`RetryExecutor::execute`].
    pub fn default_policy(&self) -> &RetryPolicy {
        &self.shared.default_policy
    }

    /// Submit an event for processing with retries (fire-and-forget).
    pub fn execute_with_retry<P>(
        &self,
        event: E,
        processor: P,
        policy: RetryPolicy,
    ) -> Result<CompletionHandle, SubmitError>
    where
        P: EventProcessor<E> + 'static,
    {
        let event_id = event.event_id();
        let rx = self.submit(event, Arc::new(processor), policy)?;
        Ok(CompletionHandle { event_id, rx })
    }

    /// Submit with the executor's default policy.
    pub fn execute<P>(&self, event: E, processor: P) -> Result<CompletionHandle, SubmitError>
    where
        P: EventProcessor<E> + 'static,
    {
        let policy = self.shared.default_policy.clone();
        self.execute_with_retry(event, processor, policy)
    }

    /// Submit and keep a handle that reports the terminal outcome.
    pub fn execute_observed<P>(
        &self,
        event: E,
        processor: P,
        policy: RetryPolicy,
    ) -> Result<OutcomeHandle, SubmitError>
    where
        P: EventProcessor<E> + 'static,
    {
        let event_id = event.event_id();
        let rx = self.submit(event, Arc::new(processor), policy)?;
        Ok(OutcomeHandle { event_id, rx })
    }

    /// Cancel the sequence for `event_id`.
    ///
    /// A sequence waiting for its next attempt is dead-lettered right away; one
    /// whose attempt is running is dead-lettered if that attempt fails.
    /// Returns `false` when nothing was in flight for the id.
    pub fn cancel(&self, event_id: EventId) -> bool {
        let waiting = {
            let mut in_flight = self.shared.lock_in_flight();
            let Some(entry) = in_flight.get_mut(&event_id) else {
                return false;
            };
            entry.cancel = Some(CancelReason::Operator);
            if let Some(next) = entry.next.as_mut() {
                next.cancel = Some(CancelReason::Operator);
            }
            self.shared.queue.remove_where(|s| s.event_id() == event_id)
        };

        for sequence in waiting {
            self.shared.cancel_sequence(sequence, CancelReason::Operator);
        }
        true
    }

    /// Whether a sequence for `event_id` has not reached a terminal state yet.
    pub fn is_in_flight(&self, event_id: EventId) -> bool {
        self.shared.lock_in_flight().contains_key(&event_id)
    }

    pub fn stats(&self) -> ExecutorStats {
        let mut stats = self.shared.lock_stats().clone();
        stats.in_flight = self.shared.lock_in_flight().len();
        stats.waiting = self.shared.queue.len();
        stats.uptime_secs = self.shared.started_at.elapsed().as_secs();
        stats
    }

    fn submit(
        &self,
        event: E,
        processor: Arc<dyn EventProcessor<E>>,
        policy: RetryPolicy,
    ) -> Result<mpsc::Receiver<RetryOutcome>, SubmitError> {
        if !self.shared.accepting.load(Ordering::SeqCst) {
            return Err(SubmitError::ShutDown);
        }

        let event_id = event.event_id();
        let (tx, rx) = mpsc::channel();
        let mut in_flight = self.shared.lock_in_flight();

        if let Some(entry) = in_flight.get_mut(&event_id) {
            if entry.finalizing {
                match entry.next.as_mut() {
                    Some(next) => next.waiters.push(tx),
                    None => {
                        entry.next = Some(Successor {
                            sequence: self.shared.new_sequence(event, processor, policy),
                            waiters: vec![tx],
                            cancel: None,
                        });
                        drop(in_flight);
                        self.shared.lock_stats().sequences_started += 1;
                        debug!(
                            executor = %self.shared.name,
                            event_id = %event_id,
                            "previous sequence finalizing; new sequence queued behind it"
                        );
                        return Ok(rx);
                    }
                }
                drop(in_flight);
                self.shared.lock_stats().submissions_merged += 1;
                return Ok(rx);
            }
            entry.waiters.push(tx);
            drop(in_flight);
            self.shared.lock_stats().submissions_merged += 1;
            debug!(
                executor = %self.shared.name,
                event_id = %event_id,
                "joined retry sequence already in flight"
            );
            return Ok(rx);
        }

        let sequence = self.shared.new_sequence(event, processor, policy);
        if self.shared.queue.schedule(sequence, Duration::ZERO).is_err() {
            return Err(SubmitError::ShutDown);
        }
        in_flight.insert(event_id, InFlight::new(vec![tx]));
        drop(in_flight);

        self.shared.lock_stats().sequences_started += 1;
        Ok(rx)
    }
}

impl<E: Event> RetryExecutor<E> {
    /// Stop accepting submissions and wind down the pool.
    ///
    /// Sequences waiting for their next attempt are dead-lettered with a
    /// cancellation error; running attempts finish first (a failing one is
    /// dead-lettered instead of rescheduled). Idempotent.
    pub fn shutdown(&self) {
        if !self.shared.accepting.swap(false, Ordering::SeqCst) {
            return;
        }

        let waiting = {
            // Serialize with in-progress submissions.
            let _in_flight = self.shared.lock_in_flight();
            self.shared.queue.close()
        };
        let cancelled = waiting.len();
        for sequence in waiting {
            self.shared.cancel_sequence(sequence, CancelReason::Shutdown);
        }

        let workers: Vec<_> = self.lock_workers().drain(..).collect();
        for join in workers {
            if join.join().is_err() {
                error!(executor = %self.shared.name, "retry worker panicked");
            }
        }

        info!(executor = %self.shared.name, cancelled, "retry executor stopped");
    }

    fn lock_workers(&self) -> MutexGuard<'_, Vec<thread::JoinHandle<()>>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<E: Event> Drop for RetryExecutor<E> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop<E: Event>(shared: Arc<Shared<E>>) {
    while let Some(sequence) = shared.queue.pop() {
        shared.run_attempt(sequence);
    }
}

impl<E: Event> Shared<E> {
    fn new_sequence(
        &self,
        event: E,
        processor: Arc<dyn EventProcessor<E>>,
        policy: RetryPolicy,
    ) -> RetrySequence<E>
    where
        E: Serialize,
    {
        let event_id = event.event_id();
        let event_type = event.event_type().to_string();

        let mut subject = RetrySubject::new(event_id, event_type.clone()).with_policy(policy.clone());
        match serde_json::to_value(&event) {
            Ok(payload) => subject = subject.with_payload(payload),
            Err(e) => warn!(
                executor = %self.name,
                event_id = %event_id,
                error = %e,
                "event payload not serializable; manual retry will be unavailable"
            ),
        }

        RetrySequence {
            event,
            processor,
            context: RetryContext::new(event_id, event_type, policy),
            subject,
        }
    }

    fn run_attempt(&self, mut sequence: RetrySequence<E>) {
        let event_id = sequence.event_id();
        let started_at = Utc::now();
        let attempt = sequence.context.begin_attempt(started_at);
        self.lock_stats().attempts += 1;

        if let Err(e) = self.store.record_attempt(&sequence.subject, attempt, started_at) {
            warn!(executor = %self.name, event_id = %event_id, attempt, error = %e, "failed to record attempt");
        }

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            sequence.processor.process(&sequence.event)
        }));

        let failure = match result {
            Ok(Ok(())) => {
                self.complete(sequence);
                return;
            }
            Ok(Err(err)) => RetryFailure::processor(format!("{err:#}")),
            Err(payload) => RetryFailure::processor(format!("processor panicked: {}", panic_message(&*payload))),
        };

        if let Err(e) = self
            .store
            .record_failure(event_id, attempt, &failure.to_string(), Utc::now())
        {
            warn!(executor = %self.name, event_id = %event_id, attempt, error = %e, "failed to record attempt failure");
        }
        sequence.context.record_error(failure);

        if sequence.context.is_exhausted() {
            self.escalate(sequence);
            return;
        }

        let delay = sequence.context.next_delay();
        let rejected = {
            let in_flight = self.lock_in_flight();
            match in_flight.get(&event_id).and_then(|f| f.cancel) {
                Some(reason) => Some((sequence, reason)),
                None => self
                    .queue
                    .schedule(sequence, delay)
                    .err()
                    .map(|s| (s, CancelReason::Shutdown)),
            }
        };

        match rejected {
            Some((sequence, reason)) => self.cancel_sequence(sequence, reason),
            None => debug!(
                executor = %self.name,
                event_id = %event_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "attempt failed; retry scheduled"
            ),
        }
    }

    fn complete(&self, mut sequence: RetrySequence<E>) {
        let event_id = sequence.event_id();
        self.begin_finalizing(event_id);
        if let Err(e) = self.store.remove_record(event_id) {
            warn!(executor = %self.name, event_id = %event_id, error = %e, "failed to clear retry record");
        }
        self.metrics
            .record_event_processed(sequence.context.event_type(), true);

        let outcome = sequence.context.mark_succeeded();
        debug!(
            executor = %self.name,
            event_id = %event_id,
            attempts = outcome.attempts(),
            "event processed"
        );
        self.lock_stats().succeeded += 1;
        self.finish(event_id, outcome);
    }

    fn cancel_sequence(&self, mut sequence: RetrySequence<E>, reason: CancelReason) {
        sequence.context.record_error(RetryFailure::Cancelled(reason));
        self.lock_stats().cancelled += 1;
        self.escalate(sequence);
    }

    fn escalate(&self, mut sequence: RetrySequence<E>) {
        let event_id = sequence.event_id();
        self.begin_finalizing(event_id);
        let attempts = sequence.context.attempt_count();
        let outcome = sequence.context.mark_dead_lettered();
        let RetryOutcome::DeadLettered { error: last_error, .. } = &outcome else {
            return;
        };

        let sent = panic::catch_unwind(AssertUnwindSafe(|| {
            self.dead_letters.send(&sequence.event, last_error, attempts)
        }));
        if sent.is_err() {
            error!(executor = %self.name, event_id = %event_id, "dead-letter sink panicked; continuing");
        }

        // A sequence cancelled before its first attempt never opened a record.
        if attempts > 0 {
            if let Err(e) = self
                .store
                .mark_as_failed(event_id, &last_error.to_string(), Utc::now())
            {
                warn!(executor = %self.name, event_id = %event_id, error = %e, "failed to mark retry record as failed");
            }
        }

        self.metrics
            .record_event_processed(sequence.context.event_type(), false);
        warn!(
            executor = %self.name,
            event_id = %event_id,
            event_type = sequence.context.event_type(),
            attempts,
            error = %last_error,
            "event dead-lettered"
        );

        self.lock_stats().dead_lettered += 1;
        self.finish(event_id, outcome);
    }

    /// Stop merging submissions into the sequence for `event_id`.
    ///
    /// Must run before the store sees the terminal state, otherwise a caller
    /// reading that state could join a sequence that will never run again.
    fn begin_finalizing(&self, event_id: EventId) {
        if let Some(entry) = self.lock_in_flight().get_mut(&event_id) {
            entry.finalizing = true;
        }
    }

    fn finish(&self, event_id: EventId, outcome: RetryOutcome) {
        let (waiters, rejected) = {
            let mut in_flight = self.lock_in_flight();
            let Some(entry) = in_flight.remove(&event_id) else {
                return;
            };

            let rejected = match entry.next {
                Some(Successor { sequence, waiters, cancel }) => {
                    in_flight.insert(event_id, InFlight::new(waiters));
                    match cancel {
                        Some(reason) => Some((sequence, reason)),
                        None => self
                            .queue
                            .schedule(sequence, Duration::ZERO)
                            .err()
                            .map(|s| (s, CancelReason::Shutdown)),
                    }
                }
                None => None,
            };
            (entry.waiters, rejected)
        };

        for waiter in waiters {
            // Receivers dropped by fire-and-forget callers are fine.
            let _ = waiter.send(outcome.clone());
        }

        if let Some((sequence, reason)) = rejected {
            self.cancel_sequence(sequence, reason);
        }
    }

    fn lock_in_flight(&self) -> MutexGuard<'_, HashMap<EventId, InFlight<E>>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_stats(&self) -> MutexGuard<'_, ExecutorStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    use storefront_events::{EventEnvelope, ProcessingError};
    use storefront_observability::InMemoryEventMetrics;

    use crate::retry::dead_letter::InMemoryDeadLetterQueue;
    use crate::retry::record::RecordStatus;
    use crate::retry::store::InMemoryRetryRecordStore;

    type TestEvent = EventEnvelope<serde_json::Value>;

    struct Harness {
        store: Arc<InMemoryRetryRecordStore>,
        dlq: Arc<InMemoryDeadLetterQueue<TestEvent>>,
        metrics: Arc<InMemoryEventMetrics>,
        executor: RetryExecutor<TestEvent>,
    }

    fn harness(workers: usize) -> Harness {
        let store = InMemoryRetryRecordStore::arc();
        let dlq = InMemoryDeadLetterQueue::arc();
        let metrics = InMemoryEventMetrics::arc();
        let executor = RetryExecutor::start(
            RetryExecutorConfig::default()
                .with_name("test-retry")
                .with_workers(workers),
            store.clone(),
            dlq.clone(),
            metrics.clone(),
        )
        .unwrap();
        Harness {
            store,
            dlq,
            metrics,
            executor,
        }
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(
            max_attempts,
            Duration::from_millis(1),
            Duration::from_millis(4),
            2.0,
        )
        .unwrap()
    }

    fn event() -> TestEvent {
        EventEnvelope::new("orders.placed", serde_json::json!({"order_id": 42}))
    }

    fn failing_times(
        failures: u32,
        calls: Arc<AtomicU32>,
    ) -> impl Fn(&TestEvent) -> Result<(), ProcessingError> + Send + Sync + 'static {
        move |_ev| {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= failures {
                Err(anyhow::anyhow!("transient failure #{n}"))
            } else {
                Ok(())
            }
        }
    }

    const WAIT: Duration = Duration::from_secs(5);

    fn wait_for_first_failure(store: &InMemoryRetryRecordStore, event_id: EventId) {
        let deadline = Instant::now() + WAIT;
        loop {
            let failed = store
                .find_by_event_id(event_id)
                .unwrap()
                .is_some_and(|r| r.last_error().is_some());
            if failed || Instant::now() > deadline {
                return;
            }
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn success_on_first_attempt_clears_record() {
        let h = harness(2);
        let calls = Arc::new(AtomicU32::new(0));
        let ev = event();

        let outcome = h
            .executor
            .execute_observed(ev.clone(), failing_times(0, calls.clone()), fast_policy(3))
            .unwrap()
            .wait_timeout(WAIT)
            .unwrap();

        assert_eq!(outcome, RetryOutcome::Succeeded { attempts: 1 });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(h.store.find_by_event_id(ev.event_id()).unwrap().is_none());
        assert_eq!(h.metrics.counts_for("orders.placed").succeeded, 1);
        assert!(h.dlq.is_empty());
    }

    #[test]
    fn exhausted_sequence_is_dead_lettered() {
        let h = harness(2);
        let calls = Arc::new(AtomicU32::new(0));
        let ev = event();

        let outcome = h
            .executor
            .execute_observed(ev.clone(), failing_times(u32::MAX, calls.clone()), fast_policy(3))
            .unwrap()
            .wait_timeout(WAIT)
            .unwrap();

        assert_eq!(
            outcome,
            RetryOutcome::DeadLettered {
                attempts: 3,
                error: RetryFailure::processor("transient failure #3"),
            }
        );
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let record = h.store.find_by_event_id(ev.event_id()).unwrap().unwrap();
        assert_eq!(record.status, RecordStatus::Failed);
        assert_eq!(record.attempt_count(), 3);
        assert_eq!(record.failure_reason.as_deref(), Some("transient failure #3"));

        let dead = h.dlq.get(ev.event_id()).unwrap();
        assert_eq!(dead.attempts_made, 3);
        assert_eq!(h.metrics.counts_for("orders.placed").failed, 1);
        assert_eq!(h.metrics.counts_for("orders.placed").succeeded, 0);
    }

    #[test]
    fn fire_and_forget_handle_completes_without_error() {
        let h = harness(1);
        let handle = h
            .executor
            .execute_with_retry(event(), failing_times(u32::MAX, Arc::default()), fast_policy(2))
            .unwrap();

        assert!(handle.wait_timeout(WAIT));
        assert_eq!(h.dlq.len(), 1);
    }

    #[test]
    fn panicking_processor_counts_as_failure() {
        let h = harness(1);
        let outcome = h
            .executor
            .execute_observed(
                event(),
                |_ev: &TestEvent| -> Result<(), ProcessingError> { panic!("cache exploded") },
                fast_policy(2),
            )
            .unwrap()
            .wait_timeout(WAIT)
            .unwrap();

        match outcome {
            RetryOutcome::DeadLettered { attempts, error } => {
                assert_eq!(attempts, 2);
                assert_eq!(error, RetryFailure::processor("processor panicked: cache exploded"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn backoff_does_not_pin_the_only_worker() {
        let h = harness(1);
        let slow_policy =
            RetryPolicy::new(2, Duration::from_secs(30), Duration::from_secs(30), 2.0).unwrap();
        let stuck = event();

        h.executor
            .execute_with_retry(stuck.clone(), failing_times(1, Arc::default()), slow_policy)
            .unwrap();

        // The first sequence now waits 30s for its retry; the single worker
        // must still pick up new work.
        let quick = h
            .executor
            .execute_observed(event(), failing_times(0, Arc::default()), fast_policy(1))
            .unwrap()
            .wait_timeout(WAIT)
            .unwrap();
        assert!(quick.is_success());
        assert!(h.executor.is_in_flight(stuck.event_id()));
    }

    #[test]
    fn shutdown_dead_letters_waiting_sequences() {
        let h = harness(1);
        let slow_policy =
            RetryPolicy::new(3, Duration::from_secs(60), Duration::from_secs(60), 2.0).unwrap();
        let ev = event();

        let handle = h
            .executor
            .execute_observed(ev.clone(), failing_times(u32::MAX, Arc::default()), slow_policy)
            .unwrap();

        wait_for_first_failure(&h.store, ev.event_id());
        h.executor.shutdown();

        let outcome = handle.wait_timeout(WAIT).unwrap();
        assert_eq!(
            outcome,
            RetryOutcome::DeadLettered {
                attempts: 1,
                error: RetryFailure::Cancelled(CancelReason::Shutdown),
            }
        );
        let record = h.store.find_by_event_id(ev.event_id()).unwrap().unwrap();
        assert_eq!(record.status, RecordStatus::Failed);
        assert_eq!(h.dlq.get(ev.event_id()).unwrap().error, RetryFailure::Cancelled(CancelReason::Shutdown));

        assert_eq!(
            h.executor
                .execute(event(), failing_times(0, Arc::default()))
                .unwrap_err(),
            SubmitError::ShutDown
        );
    }

    #[test]
    fn operator_cancel_dead_letters_immediately() {
        let h = harness(1);
        let slow_policy =
            RetryPolicy::new(3, Duration::from_secs(60), Duration::from_secs(60), 2.0).unwrap();
        let ev = event();

        let handle = h
            .executor
            .execute_observed(ev.clone(), failing_times(u32::MAX, Arc::default()), slow_policy)
            .unwrap();

        wait_for_first_failure(&h.store, ev.event_id());
        assert!(h.executor.cancel(ev.event_id()));
        let outcome = handle.wait_timeout(WAIT).unwrap();
        assert!(matches!(
            outcome,
            RetryOutcome::DeadLettered { error: RetryFailure::Cancelled(CancelReason::Operator), .. }
        ));
        assert!(!h.executor.cancel(ev.event_id()));
        assert_eq!(h.executor.stats().cancelled, 1);
    }

    #[test]
    fn panicking_dead_letter_sink_still_finalizes_record() {
        struct ExplodingSink;
        impl DeadLetterSink<TestEvent> for ExplodingSink {
            fn send(&self, _event: &TestEvent, _err: &RetryFailure, _attempts: u32) {
                panic!("dlq unavailable");
            }
        }

        let store = InMemoryRetryRecordStore::arc();
        let metrics = InMemoryEventMetrics::arc();
        let executor = RetryExecutor::start(
            RetryExecutorConfig::default().with_workers(1),
            store.clone(),
            Arc::new(ExplodingSink),
            metrics.clone(),
        )
        .unwrap();
        let ev = event();

        let outcome = executor
            .execute_observed(ev.clone(), failing_times(u32::MAX, Arc::default()), fast_policy(1))
            .unwrap()
            .wait_timeout(WAIT)
            .unwrap();

        assert!(!outcome.is_success());
        let record = store.find_by_event_id(ev.event_id()).unwrap().unwrap();
        assert_eq!(record.status, RecordStatus::Failed);
        assert_eq!(metrics.counts_for("orders.placed").failed, 1);
    }

    /// Holds the terminal failure path open so submissions can race it.
    struct SlowFailureMetrics(Duration);

    impl EventMetrics for SlowFailureMetrics {
        fn record_event_processed(&self, _event_type: &str, success: bool) {
            if !success {
                thread::sleep(self.0);
            }
        }
    }

    fn wait_for_status(store: &InMemoryRetryRecordStore, event_id: EventId, status: RecordStatus) {
        let deadline = Instant::now() + WAIT;
        while Instant::now() < deadline {
            if store
                .find_by_event_id(event_id)
                .unwrap()
                .is_some_and(|r| r.status == status)
            {
                return;
            }
            thread::sleep(Duration::from_millis(2));
        }
        panic!("record for {event_id} never reached {status:?}");
    }

    #[test]
    fn submission_while_finalizing_runs_a_fresh_sequence() {
        let store = InMemoryRetryRecordStore::arc();
        let executor = RetryExecutor::start(
            RetryExecutorConfig::default().with_workers(1),
            store.clone(),
            InMemoryDeadLetterQueue::<TestEvent>::arc(),
            Arc::new(SlowFailureMetrics(Duration::from_millis(300))),
        )
        .unwrap();
        let ev = event();

        let first = executor
            .execute_observed(ev.clone(), failing_times(u32::MAX, Arc::default()), RetryPolicy::no_retry())
            .unwrap();
        wait_for_status(&store, ev.event_id(), RecordStatus::Failed);
        assert!(executor.is_in_flight(ev.event_id()));

        let calls = Arc::new(AtomicU32::new(0));
        let second = executor
            .execute_observed(ev.clone(), failing_times(0, calls.clone()), RetryPolicy::no_retry())
            .unwrap();

        assert!(!first.wait_timeout(WAIT).unwrap().is_success());
        assert_eq!(second.wait_timeout(WAIT).unwrap(), RetryOutcome::Succeeded { attempts: 1 });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(store.find_by_event_id(ev.event_id()).unwrap().is_none());
        assert!(!executor.is_in_flight(ev.event_id()));
        assert_eq!(executor.stats().sequences_started, 2);
    }

    #[test]
    fn cancel_reaches_sequence_queued_behind_finalizing_one() {
        let store = InMemoryRetryRecordStore::arc();
        let executor = RetryExecutor::start(
            RetryExecutorConfig::default().with_workers(1),
            store.clone(),
            InMemoryDeadLetterQueue::<TestEvent>::arc(),
            Arc::new(SlowFailureMetrics(Duration::from_millis(300))),
        )
        .unwrap();
        let ev = event();

        executor
            .execute_with_retry(ev.clone(), failing_times(u32::MAX, Arc::default()), RetryPolicy::no_retry())
            .unwrap();
        wait_for_status(&store, ev.event_id(), RecordStatus::Failed);

        let calls = Arc::new(AtomicU32::new(0));
        let queued = executor
            .execute_observed(ev.clone(), failing_times(0, calls.clone()), RetryPolicy::no_retry())
            .unwrap();
        assert!(executor.cancel(ev.event_id()));

        assert_eq!(
            queued.wait_timeout(WAIT).unwrap(),
            RetryOutcome::DeadLettered {
                attempts: 0,
                error: RetryFailure::Cancelled(CancelReason::Operator),
            }
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unbounded_backoff_keeps_the_pool_alive() {
        let h = harness(1);
        let endless = RetryPolicy::new(2, Duration::MAX, Duration::MAX, 1.0).unwrap();
        let parked = event();

        let handle = h
            .executor
            .execute_observed(parked.clone(), failing_times(u32::MAX, Arc::default()), endless)
            .unwrap();
        wait_for_first_failure(&h.store, parked.event_id());

        let quick = h
            .executor
            .execute_observed(event(), failing_times(0, Arc::default()), RetryPolicy::no_retry())
            .unwrap()
            .wait_timeout(WAIT)
            .unwrap();
        assert!(quick.is_success());
        assert_eq!(h.executor.stats().waiting, 1);

        assert!(h.executor.cancel(parked.event_id()));
        assert!(matches!(
            handle.wait_timeout(WAIT).unwrap(),
            RetryOutcome::DeadLettered { attempts: 1, .. }
        ));
    }

    #[test]
    fn attempt_shares_one_timestamp_with_its_record() {
        let h = harness(1);
        let slow_policy =
            RetryPolicy::new(2, Duration::from_secs(60), Duration::from_secs(60), 2.0).unwrap();
        let ev = event();

        h.executor
            .execute_with_retry(ev.clone(), failing_times(u32::MAX, Arc::default()), slow_policy)
            .unwrap();
        wait_for_first_failure(&h.store, ev.event_id());

        let record = h.store.find_by_event_id(ev.event_id()).unwrap().unwrap();
        assert_eq!(record.attempts[0].attempted_at, record.created_at);
        h.executor.cancel(ev.event_id());
    }

    #[test]
    fn stats_track_sequences_and_attempts() {
        let h = harness(2);
        let ok = h
            .executor
            .execute_observed(event(), failing_times(1, Arc::default()), fast_policy(3))
            .unwrap();
        let bad = h
            .executor
            .execute_observed(event(), failing_times(u32::MAX, Arc::default()), fast_policy(2))
            .unwrap();
        ok.wait_timeout(WAIT).unwrap();
        bad.wait_timeout(WAIT).unwrap();

        let stats = h.executor.stats();
        assert_eq!(stats.sequences_started, 2);
        assert_eq!(stats.attempts, 4);
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.dead_lettered, 1);
        assert_eq!(stats.in_flight, 0);
    }
}
