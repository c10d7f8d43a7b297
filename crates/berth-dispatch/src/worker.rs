//! Bounded worker pool draining a [`DispatchQueue`].
//!
//! Each worker runs one task to completion before taking the next, so the
//! number of workers is the global concurrency ceiling. Handlers run in
//! their own tokio task: a panicking handler costs that task only. The
//! task is requeued with a growing delay, so its work is not lost.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::error::{DispatchError, DispatchResult};
use crate::queue::DispatchQueue;
use crate::task::{Task, TaskOutcome};

pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = TaskOutcome> + Send + 'a>>;

/// Executes one task. Failures are expressed through the outcome (for
/// instance a delayed requeue), never by returning early.
pub trait TaskHandler: Send + Sync + 'static {
    fn handle<'a>(&'a self, task: &'a Task) -> HandlerFuture<'a>;
}

/// Delay before a crashed task runs again: `base * 2^requeues`, capped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrashBackoff {
    pub base: Duration,
    pub max: Duration,
}

impl Default for CrashBackoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(5),
            max: Duration::from_secs(300),
        }
    }
}

impl CrashBackoff {
    pub fn delay(&self, requeues: u32) -> Duration {
        self.base.saturating_mul(1u32 << requeues.min(20)).min(self.max)
    }
}

pub struct WorkerPool {
    queue: Arc<DispatchQueue>,
    handler: Arc<dyn TaskHandler>,
    workers: usize,
    crash_backoff: CrashBackoff,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<DispatchQueue>,
        handler: Arc<dyn TaskHandler>,
        workers: usize,
    ) -> DispatchResult<Self> {
        if workers == 0 {
            return Err(DispatchError::NoWorkers);
        }
        Ok(Self {
            queue,
            handler,
            workers,
            crash_backoff: CrashBackoff::default(),
        })
    }

    pub fn with_crash_backoff(mut self, crash_backoff: CrashBackoff) -> Self {
        self.crash_backoff = crash_backoff;
        self
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Run until `shutdown` flips. Tasks already started run to the end.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        info!(workers = self.workers, "worker pool started");

        let mut set = JoinSet::new();
        for worker in 0..self.workers {
            set.spawn(worker_loop(
                worker,
                Arc::clone(&self.queue),
                Arc::clone(&self.handler),
                self.crash_backoff,
                shutdown.clone(),
            ));
        }
        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "worker exited abnormally");
            }
        }

        info!("worker pool stopped");
    }
}

async fn worker_loop(
    worker: usize,
    queue: Arc<DispatchQueue>,
    handler: Arc<dyn TaskHandler>,
    crash_backoff: CrashBackoff,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(worker, "worker started");

    while let Some(task) = queue.next(&mut shutdown).await {
        let started = Instant::now();
        debug!(worker, seq = task.seq, instance_id = %task.instance_id, op = %task.op, "task started");

        let run = {
            let handler = Arc::clone(&handler);
            let task = task.clone();
            tokio::spawn(async move { handler.handle(&task).await })
        };
        let outcome = match run.await {
            Ok(outcome) => outcome,
            Err(e) => {
                let delay = crash_backoff.delay(task.requeues);
                error!(
                    worker,
                    instance_id = %task.instance_id,
                    op = %task.op,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "task handler crashed, requeueing"
                );
                TaskOutcome::requeue(task.op.clone(), delay)
            }
        };

        debug!(
            worker,
            seq = task.seq,
            instance_id = %task.instance_id,
            op = %task.op,
            elapsed_ms = started.elapsed().as_millis() as u64,
            outcome = ?outcome,
            "task finished"
        );
        queue.finish(&task, outcome);
    }

    debug!(worker, "worker stopped");
}
