use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{info, warn};

use crate::retry::{cleanup_old_records, RetryRecordStore};

/// Handle to control and join a background worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl WorkerHandle {
    /// Request graceful shutdown and wait for the worker to stop.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

/// Periodic retention cleanup for retry records.
///
/// - Runs a cleanup pass right away, then once per `interval`
/// - Deletes records idle for more than `retention_days`
/// - Store errors are logged; the next tick tries again
#[derive(Debug)]
pub struct CleanupWorker;

impl CleanupWorker {
    pub fn spawn(
        name: &str,
        store: Arc<dyn RetryRecordStore>,
        interval: Duration,
        retention_days: u32,
    ) -> std::io::Result<WorkerHandle> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let worker_name = name.to_string();

        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || worker_loop(&worker_name, &*store, shutdown_rx, interval, retention_days))?;

        Ok(WorkerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
        })
    }
}

fn worker_loop(
    name: &str,
    store: &dyn RetryRecordStore,
    shutdown_rx: mpsc::Receiver<()>,
    interval: Duration,
    retention_days: u32,
) {
    info!(worker = name, retention_days, interval_secs = interval.as_secs(), "cleanup worker started");

    loop {
        if let Err(err) = cleanup_old_records(store, retention_days) {
            warn!(worker = name, error = %err, "retry record cleanup failed");
        }

        match shutdown_rx.recv_timeout(interval) {
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    info!(worker = name, "cleanup worker stopped");
}
