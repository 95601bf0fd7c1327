//! Bounded background pool for cache rebuilds.
//!
//! A fixed set of tokio worker tasks drains a bounded queue. Submission never
//! waits: a job for a key that is already queued or running is dropped, and
//! a full queue is reported as `Error::ExecutorSaturated`. A failing or
//! panicking job is logged and the worker moves on.

use crate::config::ExecutorConfig;
use crate::error::{Error, Result};
use dashmap::DashMap;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;

/// A rebuild unit of work.
pub type RebuildJob = Pin<Box<dyn Future<Output = Result<()>> + Send + 'static>>;

struct QueuedJob {
    key: String,
    job: RebuildJob,
}

/// Counters exposed for monitoring and tests.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorStats {
    pub completed: u64,
    pub failed: u64,
    pub panicked: u64,
    pub rejected: u64,
    pub deduplicated: u64,
}

#[derive(Default)]
struct Shared {
    /// Keys queued or running
    pending: DashMap<String, ()>,
    idle: Notify,
    completed: AtomicU64,
    failed: AtomicU64,
    panicked: AtomicU64,
    rejected: AtomicU64,
    deduplicated: AtomicU64,
}

impl Shared {
    fn finish(&self, key: &str) {
        self.pending.remove(key);
        if self.pending.is_empty() {
            self.idle.notify_waiters();
        }
    }
}

/// Fixed-size worker pool with a bounded queue.
///
/// Workers stop once the executor is dropped and the queue has drained.
pub struct RebuildExecutor {
    tx: mpsc::Sender<QueuedJob>,
    shared: Arc<Shared>,
    capacity: usize,
    workers: Vec<JoinHandle<()>>,
}

impl RebuildExecutor {
    /// Start the workers on the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn new(config: ExecutorConfig) -> Self {
        let workers = config.workers.max(1);
        let capacity = config.queue_capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let rx = Arc::new(Mutex::new(rx));
        let shared = Arc::new(Shared::default());

        let handles = (0..workers)
            .map(|id| tokio::spawn(worker_loop(id, rx.clone(), shared.clone())))
            .collect();

        info!(
            "✓ Rebuild executor started ({} workers, queue capacity {})",
            workers, capacity
        );

        RebuildExecutor {
            tx,
            shared,
            capacity,
            workers: handles,
        }
    }

    /// Queue a rebuild for `key`.
    ///
    /// Returns `Ok(false)` without queuing when a job for the same key is
    /// already pending. The rejected job is dropped, which releases any lock
    /// guard it captured.
    ///
    /// # Errors
    ///
    /// `Error::ExecutorSaturated` when the queue is full.
    pub fn submit<F>(&self, key: impl Into<String>, job: F) -> Result<bool>
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let key = key.into();
        if self.shared.pending.insert(key.clone(), ()).is_some() {
            self.shared.deduplicated.fetch_add(1, Ordering::Relaxed);
            debug!("Rebuild for {} already pending, skipping", key);
            return Ok(false);
        }

        let queued = QueuedJob {
            key: key.clone(),
            job: Box::pin(job),
        };

        match self.tx.try_send(queued) {
            Ok(()) => {
                debug!("Queued rebuild for {}", key);
                Ok(true)
            }
            Err(TrySendError::Full(_)) => {
                self.shared.rejected.fetch_add(1, Ordering::Relaxed);
                self.shared.finish(&key);
                Err(Error::ExecutorSaturated {
                    capacity: self.capacity,
                })
            }
            Err(TrySendError::Closed(_)) => {
                self.shared.finish(&key);
                Err(Error::RebuildFailure {
                    key,
                    reason: "executor is shut down".to_string(),
                })
            }
        }
    }

    /// Whether a job for `key` is queued or running.
    pub fn is_pending(&self, key: &str) -> bool {
        self.shared.pending.contains_key(key)
    }

    pub fn pending_count(&self) -> usize {
        self.shared.pending.len()
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn stats(&self) -> ExecutorStats {
        ExecutorStats {
            completed: self.shared.completed.load(Ordering::Relaxed),
            failed: self.shared.failed.load(Ordering::Relaxed),
            panicked: self.shared.panicked.load(Ordering::Relaxed),
            rejected: self.shared.rejected.load(Ordering::Relaxed),
            deduplicated: self.shared.deduplicated.load(Ordering::Relaxed),
        }
    }

    /// Wait until no rebuild is queued or running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.shared.idle.notified();
            if self.shared.pending.is_empty() {
                return;
            }
            notified.await;
        }
    }
}

async fn worker_loop(id: usize, rx: Arc<Mutex<mpsc::Receiver<QueuedJob>>>, shared: Arc<Shared>) {
    loop {
        let next = { rx.lock().await.recv().await };
        let Some(QueuedJob { key, job }) = next else {
            debug!("Rebuild worker {} stopping", id);
            return;
        };

        match AssertUnwindSafe(job).catch_unwind().await {
            Ok(Ok(())) => {
                shared.completed.fetch_add(1, Ordering::Relaxed);
                debug!("✓ Rebuild for {} finished on worker {}", key, id);
            }
            Ok(Err(e)) => {
                shared.failed.fetch_add(1, Ordering::Relaxed);
                warn!("Rebuild for {} failed: {}", key, e);
            }
            Err(_) => {
                shared.panicked.fetch_add(1, Ordering::Relaxed);
                error!("Rebuild for {} panicked on worker {}", key, id);
            }
        }

        shared.finish(&key);
    }
}
