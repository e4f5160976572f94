//! Bounded pool of file-transfer executors.
//!
//! Keeps up to `size` executors in flight; `start` applies backpressure by
//! first reaping a finished task when every slot is busy. `join` drains the
//! pool and returns the sum of per-executor scheduled-file counts. The
//! pool's token is handed to each executor so `interrupt` stops them
//! cooperatively; worker processes already launched are left alone.

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

pub struct ExecutorPool {
    tasks: JoinSet<usize>,
    size: usize,
    cancel: CancellationToken,
    scheduled: usize,
}

impl ExecutorPool {
    pub fn new(size: usize, parent: &CancellationToken) -> Self {
        ExecutorPool {
            tasks: JoinSet::new(),
            size: size.max(1),
            cancel: parent.child_token(),
            scheduled: 0,
        }
    }

    /// Token executors poll for cooperative cancellation.
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Number of executors currently in flight.
    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    /// Submit one executor. Returns immediately while a slot is free and
    /// otherwise waits for one executor to finish first, folding its
    /// result into the running total.
    pub async fn start<F>(&mut self, task: F)
    where
        F: std::future::Future<Output = usize> + Send + 'static,
    {
        while self.tasks.len() >= self.size {
            match self.tasks.join_next().await {
                Some(Ok(count)) => self.scheduled += count,
                Some(Err(err)) => tracing::warn!("executor task failed: {err}"),
                None => break,
            }
        }
        self.tasks.spawn(task);
    }

    /// Ask in-flight executors to stop. Does not kill launched processes.
    pub fn interrupt(&self) {
        self.cancel.cancel();
    }

    /// Wait for all submitted work and return the total number of files
    /// the pool's executors scheduled.
    pub async fn join(mut self) -> usize {
        while let Some(result) = self.tasks.join_next().await {
            match result {
                Ok(count) => self.scheduled += count,
                Err(err) => tracing::warn!("executor task failed: {err}"),
            }
        }
        self.scheduled
    }
}
