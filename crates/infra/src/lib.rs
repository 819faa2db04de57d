//! Infrastructure layer: retry pipeline, persistence, config, background workers.

pub mod config;
pub mod retry;
pub mod workers;

pub use config::RetrySettings;
