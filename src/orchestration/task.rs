//! A claimed task, bound to the processing lock that makes its holder the
//! only executor.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::core::task::{TaskId, TaskStatus, TaskType};
use crate::error::Result;
use crate::events::{emit_task_event, EventPublisher};
use crate::store::Lock;
use crate::tasks::TaskStore;

/// Handed from the dispatcher to a worker. Owns the processing lock.
pub struct Task {
    pub id: TaskId,
    pub target_id: String,
    pub task_type: TaskType,
    lock: Lock,
    tasks: TaskStore,
    events: Arc<dyn EventPublisher>,
}

impl Task {
    pub(crate) fn new(
        id: TaskId,
        target_id: String,
        task_type: TaskType,
        lock: Lock,
        tasks: TaskStore,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            id,
            target_id,
            task_type,
            lock,
            tasks,
            events,
        }
    }

    /// Persists a status change and publishes the matching task event.
    pub async fn set_status(&self, status: TaskStatus) -> Result<()> {
        self.tasks.set_status(&self.id, status).await?;
        emit_task_event(
            self.events.as_ref(),
            &self.target_id,
            &self.id,
            self.task_type,
            status,
        )
        .await;
        Ok(())
    }

    /// Fires when the processing lock's session is lost.
    pub fn leadership(&self) -> CancellationToken {
        self.lock.leadership()
    }

    pub fn has_leadership(&self) -> bool {
        !self.lock.is_lost()
    }

    /// Releases and destroys the processing lock. Failures are logged.
    pub async fn release(self) {
        let id = self.id;
        if let Err(e) = self.lock.release().await {
            warn!(task = %id.short(), error = %e, "failed to release processing lock");
        }
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("target_id", &self.target_id)
            .field("task_type", &self.task_type)
            .field("lock", &self.lock)
            .finish()
    }
}
