//! Domain events and the contract for processing them.
//!
//! The shapes of concrete events live with their owning services; this crate
//! only fixes what the retry pipeline needs to know about them.

pub mod envelope;
pub mod event;
pub mod processor;

pub use envelope::EventEnvelope;
pub use event::Event;
pub use processor::{EventProcessor, ProcessingError};
