//! Fixed-size worker pool.
//!
//! Each idle worker registers a one-shot intake channel with the pool; the
//! dispatcher hands a task to whichever registration it receives first.
//! The pool is owned by its dispatcher, there is no process-wide registry.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use super::task::Task;
use super::worker::Worker;
use crate::workflow::WorkflowEngine;

/// Registration of one idle worker.
pub type Intake = oneshot::Sender<Task>;

pub struct WorkerPool {
    intake: mpsc::Receiver<Intake>,
    workers: JoinSet<()>,
    size: usize,
}

impl WorkerPool {
    /// Spawns `size` workers. They stop once idle after `shutdown` fires.
    ///
    /// `cancel_poll_wait` bounds each blocking read of a task's cancellation flag.
    pub fn start(
        size: usize,
        engine: WorkflowEngine,
        cancel_poll_wait: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        let (tx, intake) = mpsc::channel(size.max(1));
        let mut workers = JoinSet::new();
        for id in 0..size {
            let worker = Worker::new(
                id,
                engine.clone(),
                tx.clone(),
                cancel_poll_wait,
                shutdown.clone(),
            );
            workers.spawn(worker.run());
        }
        debug!(size, "worker pool started");
        Self {
            intake,
            workers,
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Waits for an idle worker. `None` once every worker has exited.
    pub async fn next_worker(&mut self) -> Option<Intake> {
        self.intake.recv().await
    }

    /// Closes the intake and waits for every worker to finish its current task.
    pub async fn join(self) {
        let Self {
            intake,
            mut workers,
            ..
        } = self;
        drop(intake);
        while let Some(res) = workers.join_next().await {
            if let Err(e) = res {
                error!(error = %e, "worker panicked");
            }
        }
        debug!("worker pool stopped");
    }
}
