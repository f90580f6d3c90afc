//! Bounded background worker pool
//!
//! A fixed set of workers drains a queue of boxed task futures. Admin
//! triggers enqueue work here instead of blocking their request; the
//! tasks themselves report progress through the job tracker.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// A queued unit of background work
pub type TaskFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Queue slots; submits beyond this push back on the caller
const QUEUE_DEPTH: usize = 64;

/// Fixed-size pool of background workers
pub struct WorkerPool {
    queue: mpsc::Sender<TaskFuture>,
    workers: JoinSet<()>,
    cancel: CancellationToken,
}

impl WorkerPool {
    /// Start `worker_count` workers draining a shared queue
    pub fn start(worker_count: usize, cancel: CancellationToken) -> Self {
        let (queue, rx) = mpsc::channel::<TaskFuture>(QUEUE_DEPTH);
        let rx = Arc::new(Mutex::new(rx));

        let mut workers = JoinSet::new();
        for worker_id in 0..worker_count {
            let rx = Arc::clone(&rx);
            let token = cancel.clone();
            workers.spawn(async move {
                debug!("background worker {worker_id} starting");
                loop {
                    let task = {
                        let mut rx = rx.lock().await;
                        tokio::select! {
                            task = rx.recv() => task,
                            () = token.cancelled() => None,
                        }
                    };
                    let Some(task) = task else {
                        break;
                    };
                    task.await;
                }
                debug!("background worker {worker_id} stopping");
            });
        }

        info!(worker_count, "background worker pool started");
        Self {
            queue,
            workers,
            cancel,
        }
    }

    /// Enqueue one task, waiting when the queue is full
    ///
    /// Returns `false` when the pool has already shut down.
    pub async fn submit(&self, task: TaskFuture) -> bool {
        if let Err(e) = self.queue.send(task).await {
            error!(error = %e, "worker pool queue closed");
            return false;
        }
        true
    }

    /// Stop accepting work and drain within the timeout
    ///
    /// Queued tasks that have not started by the deadline are dropped;
    /// running tasks past the deadline are aborted.
    pub async fn shutdown(mut self, drain: Duration) {
        // Closing the queue lets workers finish what is already queued
        drop(self.queue);

        let all_done = async {
            while self.workers.join_next().await.is_some() {}
        };
        if tokio::time::timeout(drain, all_done).await.is_err() {
            warn!("worker drain timeout elapsed, aborting tasks");
            self.cancel.cancel();
            self.workers.abort_all();
            while self.workers.join_next().await.is_some() {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn tasks_run_and_drain_on_shutdown() {
        let counter = Arc::new(AtomicUsize::new(0));
        let pool = WorkerPool::start(2, CancellationToken::new());

        for _ in 0..5 {
            let counter = Arc::clone(&counter);
            let accepted = pool
                .submit(Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }))
                .await;
            assert!(accepted);
        }

        pool.shutdown(Duration::from_secs(5)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn slow_tasks_are_aborted_past_the_deadline() {
        let pool = WorkerPool::start(1, CancellationToken::new());

        let accepted = pool
            .submit(Box::pin(async {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }))
            .await;
        assert!(accepted);

        // Returns promptly despite the sleeping task
        let start = std::time::Instant::now();
        pool.shutdown(Duration::from_millis(50)).await;
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
