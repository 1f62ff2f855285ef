//! The worker pool.
//!
//! A fixed set of workers drains the task queue. Nothing here preempts a
//! task: cancellation is cooperative, via the token each task body gets,
//! and shutdown abandons workers that outlive the grace period (the
//! Index re-surfaces their incomplete work on the next start).

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::task::JoinHandle;

use crate::queue::{FairQueue, Outcome, TaskCtx};

pub struct WorkerPool {
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Starts `num_workers` workers draining `queue`.
    pub fn start(num_workers: usize, queue: Arc<FairQueue>) -> Self {
        let workers = (0..num_workers)
            .map(|index| {
                let queue = queue.clone();
                tokio::spawn(worker_main(index, queue))
            })
            .collect();

        Self { workers }
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Waits for the workers to drain their in-progress tasks.
    ///
    /// The queue's shutdown token must already be cancelled. Workers
    /// still busy after `grace` are aborted.
    pub async fn shutdown(self, grace: Duration) {
        let deadline = tokio::time::Instant::now() + grace;

        for (index, handle) in self.workers.into_iter().enumerate() {
            let abort = handle.abort_handle();
            if tokio::time::timeout_at(deadline, handle).await.is_err() {
                tracing::warn!("Worker {} did not drain in time; abandoning its task.", index);
                abort.abort();
            }
        }
    }
}

async fn worker_main(index: usize, queue: Arc<FairQueue>) {
    tracing::debug!("Worker {} started.", index);

    let shutdown = queue.shutdown_token();

    while let Some(mut task) = queue.get().await {
        let ctx = TaskCtx {
            attempt: task.attempt(),
            shutdown: shutdown.clone(),
        };

        tracing::info!("Beginning task: {}", task);
        let body = task.body();
        let outcome = AssertUnwindSafe(body(ctx)).catch_unwind().await;

        queue.task_done(&task);

        match outcome {
            Ok(Outcome::Done) => {
                tracing::info!("Finished task: {}", task);
                task.finish();
            }
            Ok(Outcome::Requeue(delay)) => {
                tracing::info!("Deferring task for {:?}: {}", delay, task);
                queue.defer(task, delay);
            }
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                tracing::error!("Task panicked ({}): {}", reason, task);
                task.finish();
            }
        }
    }

    tracing::debug!("Worker {} exiting.", index);
}
