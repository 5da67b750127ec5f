//! Dispatcher: discovers INITIAL tasks and hands them to the worker pool.
//!
//! One dispatcher runs per orchestrator instance. Mutual exclusion between
//! instances comes only from the per-task processing lock; the task status
//! is checked again once the lock is held so a task finished by another
//! instance in the meantime is never run twice.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::pool::WorkerPool;
use super::task::Task;
use crate::config::Config;
use crate::core::keys::{base, PROCESSING_LOCK};
use crate::core::task::{TaskId, TaskStatus, TaskType};
use crate::error::{Error, Result};
use crate::events::EventPublisher;
use crate::store::{Lock, LockOptions, QueryOptions};
use crate::tasks::TaskStore;

pub struct Dispatcher {
    tasks: TaskStore,
    events: Arc<dyn EventPublisher>,
    config: Config,
    pool: WorkerPool,
    shutdown: CancellationToken,
}

/// What the polling loop does after a handoff attempt.
enum Handoff {
    Continue,
    Stop,
}

impl Dispatcher {
    pub fn new(
        tasks: TaskStore,
        events: Arc<dyn EventPublisher>,
        config: Config,
        pool: WorkerPool,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            tasks,
            events,
            config,
            pool,
            shutdown,
        }
    }

    /// Polls for tasks until shutdown, then waits for the workers.
    pub async fn run(mut self) {
        info!(
            node = %self.config.node_name,
            workers = self.pool.size(),
            "dispatcher started"
        );
        let prefix = format!("{}/", self.tasks.keys().tasks());
        let mut wait_index = 0;
        'poll: loop {
            let opts = QueryOptions::blocking(wait_index, self.config.long_poll_wait);
            let listed = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                res = self.tasks.kv().keys(&prefix, Some('/'), &opts) => res,
            };
            let (keys, meta) = match listed {
                Ok(listed) => listed,
                Err(e) => {
                    warn!(error = %e, "failed to list tasks");
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.handoff_backoff) => continue,
                    }
                }
            };
            if meta.last_index == wait_index {
                continue;
            }
            wait_index = meta.last_index;

            for key in keys {
                if self.shutdown.is_cancelled() {
                    break 'poll;
                }
                let id: TaskId = match base(&key).parse() {
                    Ok(id) => id,
                    Err(_) => {
                        debug!(key = %key, "ignoring malformed task key");
                        continue;
                    }
                };
                let task = match self.claim(&id).await {
                    Ok(Some(task)) => task,
                    Ok(None) => continue,
                    Err(e) => {
                        warn!(task = %id.short(), error = %e, "failed to claim task");
                        continue;
                    }
                };
                if let Handoff::Stop = self.hand_off(task).await {
                    break 'poll;
                }
            }
        }
        info!("dispatcher stopping, waiting for workers");
        self.pool.join().await;
        info!("dispatcher stopped");
    }

    /// Takes the processing lock of an INITIAL task. `None` when the task
    /// is not claimable by this instance.
    #[instrument(skip_all, fields(task = %id.short()))]
    async fn claim(&self, id: &TaskId) -> Result<Option<Task>> {
        if !self.wait_for_creation(id).await? {
            debug!("creation lock still held, skipping");
            return Ok(None);
        }
        if !self.is_initial(id).await? {
            return Ok(None);
        }

        let opts = LockOptions::try_once(
            self.tasks.keys().task_field(id, PROCESSING_LOCK),
            self.config.node_name.as_bytes(),
            self.config.lock_wait_time,
        );
        let Some(lock) = Lock::acquire(Arc::clone(self.tasks.kv()), opts).await? else {
            debug!("processing lock held elsewhere");
            return Ok(None);
        };

        // Another instance may have run the task between the first check and the lock.
        let checked = match self.is_initial(id).await {
            Ok(true) => self.identity(id).await.map(Some),
            Ok(false) => Ok(None),
            Err(e) => Err(e),
        };
        match checked {
            Ok(Some((target_id, task_type))) => {
                debug!(target = %target_id, %task_type, "task claimed");
                Ok(Some(Task::new(
                    *id,
                    target_id,
                    task_type,
                    lock,
                    self.tasks.clone(),
                    Arc::clone(&self.events),
                )))
            }
            Ok(None) => {
                debug!("task no longer initial");
                lock.release().await?;
                Ok(None)
            }
            Err(e) => {
                if let Err(release) = lock.release().await {
                    warn!(error = %release, "failed to release processing lock");
                }
                Err(e)
            }
        }
    }

    /// Waits until no collector is writing the task. `false` after
    /// `create_lock_max_retries` polls.
    async fn wait_for_creation(&self, id: &TaskId) -> Result<bool> {
        for _ in 0..=self.config.create_lock_max_retries {
            if !self.tasks.is_being_created(id).await? {
                return Ok(true);
            }
            tokio::time::sleep(self.config.create_lock_poll_interval).await;
        }
        Ok(false)
    }

    async fn is_initial(&self, id: &TaskId) -> Result<bool> {
        match self.tasks.status(id).await {
            Ok(status) => Ok(status == TaskStatus::Initial),
            // Deleted concurrently.
            Err(Error::MissingKey { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn identity(&self, id: &TaskId) -> Result<(String, TaskType)> {
        let target_id = self.tasks.target(id).await?;
        let task_type = self.tasks.task_type(id).await?;
        Ok((target_id, task_type))
    }

    /// Hands a claimed task to the first idle worker.
    async fn hand_off(&mut self, task: Task) -> Handoff {
        let leadership = task.leadership();
        let id = task.id;
        tokio::select! {
            worker = self.pool.next_worker() => match worker {
                Some(worker) => match worker.send(task) {
                    Ok(()) => {
                        debug!(task = %id.short(), "task handed off");
                        Handoff::Continue
                    }
                    Err(task) => {
                        debug!(task = %id.short(), "worker went away before handoff");
                        task.release().await;
                        Handoff::Continue
                    }
                },
                None => {
                    task.release().await;
                    Handoff::Stop
                }
            },
            _ = leadership.cancelled() => {
                warn!(task = %id.short(), "processing lock lost before handoff");
                task.release().await;
                Handoff::Continue
            }
            _ = self.shutdown.cancelled() => {
                task.release().await;
                Handoff::Stop
            }
            _ = tokio::time::sleep(self.config.handoff_timeout) => {
                warn!(
                    task = %id.short(),
                    timeout = ?self.config.handoff_timeout,
                    "no idle worker, releasing task"
                );
                task.release().await;
                tokio::time::sleep(self.config.handoff_backoff).await;
                Handoff::Continue
            }
        }
    }
}
