use crate::error::{BackupError, Result};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

const MAX_DEFAULT_WORKERS: usize = 4;

/// Bounds concurrent heavy work: a shared pool for backups and restores and
/// a single slot for snapshot exports.
#[derive(Clone)]
pub struct WorkerGate {
    workers: Arc<Semaphore>,
    export: Arc<Semaphore>,
    size: usize,
}

impl WorkerGate {
    pub fn new(size: Option<usize>) -> Self {
        let size = size.filter(|n| *n > 0).unwrap_or_else(default_worker_count);
        Self {
            workers: Arc::new(Semaphore::new(size)),
            export: Arc::new(Semaphore::new(1)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Waits for a worker slot.
    pub async fn acquire_worker(&self) -> Result<OwnedSemaphorePermit> {
        self.workers
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| BackupError::execution("backup workers are shutting down"))
    }

    /// Exports never queue: a second concurrent request is refused.
    pub fn try_acquire_export(&self) -> Result<OwnedSemaphorePermit> {
        self.export
            .clone()
            .try_acquire_owned()
            .map_err(|_| BackupError::Conflict("another snapshot export is already running; please wait".into()))
    }
}

/// Half the CPUs, between 1 and 4.
pub fn default_worker_count() -> usize {
    let cpus = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    (cpus / 2).clamp(1, MAX_DEFAULT_WORKERS)
}
