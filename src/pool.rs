use std::sync::Arc;

use serde::Deserialize;
use tokio::sync::{Semaphore, TryAcquireError};

use crate::error::OpenmuxError;

pub const DEFAULT_WORKERS: usize = 4;
pub const DEFAULT_QUEUE_LIMIT: usize = 64;
/// Largest `workers + queue_limit` a pool can be built with.
pub const MAX_CAPACITY: usize = Semaphore::MAX_PERMITS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PoolLimits {
    /// Jobs running at once.
    pub workers: usize,
    /// Jobs admitted but waiting for a worker.
    pub queue_limit: usize,
}

impl Default for PoolLimits {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            queue_limit: DEFAULT_QUEUE_LIMIT,
        }
    }
}

impl PoolLimits {
    pub fn capacity(&self) -> usize {
        self.workers.saturating_add(self.queue_limit)
    }

    /// `None` when the total does not fit in [`MAX_CAPACITY`].
    pub fn checked_capacity(&self) -> Option<usize> {
        self.workers
            .checked_add(self.queue_limit)
            .filter(|total| *total <= MAX_CAPACITY)
    }

    /// At least one worker, and a total that fits in [`MAX_CAPACITY`].
    fn clamped(self) -> Self {
        let workers = self.workers.clamp(1, MAX_CAPACITY);
        Self {
            workers,
            queue_limit: self.queue_limit.min(MAX_CAPACITY - workers),
        }
    }
}

/// Bounded executor for blocking backend calls.
///
/// Two semaphores: `admission` caps outstanding jobs (running + queued) and is
/// tried without waiting, so a full pool rejects with `Overloaded` instead of
/// queueing forever. `workers` caps concurrency; jobs wait on it in FIFO order.
///
/// Once admitted, a job runs to completion even if the caller drops its future
/// or the pool is closed. There is no cancellation path.
pub struct BlockingPool {
    admission: Arc<Semaphore>,
    workers: Arc<Semaphore>,
    limits: PoolLimits,
}

impl std::fmt::Debug for BlockingPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingPool")
            .field("limits", &self.limits)
            .field("outstanding", &self.outstanding())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl BlockingPool {
    pub fn new(limits: PoolLimits) -> Self {
        let limits = limits.clamped();
        Self {
            admission: Arc::new(Semaphore::new(limits.capacity())),
            workers: Arc::new(Semaphore::new(limits.workers)),
            limits,
        }
    }

    pub fn limits(&self) -> PoolLimits {
        self.limits
    }

    /// Run `job` on a blocking thread and suspend until it finishes.
    pub async fn run<F, T>(&self, job: F) -> Result<T, OpenmuxError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let ticket = match Arc::clone(&self.admission).try_acquire_owned() {
            Ok(ticket) => ticket,
            Err(TryAcquireError::Closed) => return Err(OpenmuxError::PoolClosed),
            Err(TryAcquireError::NoPermits) => {
                return Err(OpenmuxError::Overloaded {
                    limit: self.limits.capacity(),
                });
            }
        };

        let workers = Arc::clone(&self.workers);
        let handle = tokio::spawn(async move {
            let _ticket = ticket;
            let _worker = workers
                .acquire_owned()
                .await
                .map_err(|_| OpenmuxError::PoolClosed)?;
            tokio::task::spawn_blocking(job)
                .await
                .map_err(|e| OpenmuxError::WorkerFailed(e.to_string()))
        });

        handle
            .await
            .map_err(|e| OpenmuxError::WorkerFailed(e.to_string()))?
    }

    /// Stop admitting jobs. Does not wait for admitted jobs. Idempotent.
    pub fn close(&self) {
        self.admission.close();
    }

    pub fn is_closed(&self) -> bool {
        self.admission.is_closed()
    }

    /// Jobs admitted and not yet finished.
    pub fn outstanding(&self) -> usize {
        self.limits.capacity() - self.admission.available_permits()
    }
}
