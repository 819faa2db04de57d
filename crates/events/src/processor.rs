//! The processor contract: the caller-supplied side effect for an event.

/// Error reported by a processor.
///
/// Processors wrap arbitrary business logic (sending an email, refreshing a
/// cache entry, ...), so failures are carried as an opaque `anyhow::Error`.
pub type ProcessingError = anyhow::Error;

/// Performs the side effect for one event.
///
/// Invoked synchronously and fully for every attempt; only whole-attempt
/// success or failure is observed. Implementations backed by async code must
/// block until their future has resolved.
pub trait EventProcessor<E>: Send + Sync {
    fn process(&self, event: &E) -> Result<(), ProcessingError>;
}

impl<E, F> EventProcessor<E> for F
where
    F: Fn(&E) -> Result<(), ProcessingError> + Send + Sync,
{
    fn process(&self, event: &E) -> Result<(), ProcessingError> {
        self(event)
    }
}
