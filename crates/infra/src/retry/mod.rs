//! Event retry pipeline with exponential backoff and dead-letter handling.
//!
//! ## Design
//!
//! - A submitted event becomes a retry sequence run by a bounded worker pool
//! - Failed attempts wait in a delay queue, not on a worker
//! - Every attempt and failure is persisted through a `RetryRecordStore`
//! - Exhausted sequences are handed to a `DeadLetterSink` and kept as failed
//!   records for audit and manual retry
//!
//! ## Components
//!
//! - `RetryPolicy`: attempt budget and backoff schedule
//! - `RetryExecutor`: runs sequences; handles shutdown and cancellation
//! - `RetryRecordStore`: persistence (in-memory or Postgres)
//! - `DeadLetterSink`: terminal failures
//! - `RetryAdmin`: statistics, cleanup and manual re-triggering

pub mod admin;
pub mod context;
pub mod dead_letter;
pub mod executor;
pub mod policy;
pub mod postgres;
pub mod record;
pub mod scheduler;
pub mod store;

pub use admin::{cleanup_old_records, retention_cutoff, ManualRetryError, RetryAdmin};
pub use context::{CancelReason, RetryContext, RetryFailure, RetryOutcome, SequenceState};
pub use dead_letter::{DeadLetter, DeadLetterSink, InMemoryDeadLetterQueue, TracingDeadLetterSink};
pub use executor::{
    CompletionHandle, ExecutorStats, OutcomeHandle, RetryExecutor, RetryExecutorConfig, SubmitError,
};
pub use policy::{InvalidPolicyError, RetryPolicy};
pub use postgres::PostgresRetryRecordStore;
pub use record::{RecordStatus, RetryAttempt, RetryRecord, RetryStatistics, RetrySubject};
pub use scheduler::DelayQueue;
pub use store::{InMemoryRetryRecordStore, RetryRecordStore, RetryStoreError};
