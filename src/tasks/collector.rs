//! Atomic task creation.

use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use super::TaskStore;
use crate::core::keys::CREATE_LOCK;
use crate::core::task::{TaskId, TaskType};
use crate::error::{Error, Result};
use crate::store::{Lock, LockOptions};

/// Registers new tasks.
///
/// Fields are written while holding a per-task creation lock, so a
/// dispatcher that honors the lock never reads a half-written task.
#[derive(Debug, Clone)]
pub struct Collector {
    tasks: TaskStore,
    node_name: String,
}

impl Collector {
    pub fn new(tasks: TaskStore) -> Self {
        Self {
            tasks,
            node_name: "collector".to_string(),
        }
    }

    /// Identity written as the creation lock value.
    pub fn with_node_name(mut self, node_name: impl Into<String>) -> Self {
        self.node_name = node_name.into();
        self
    }

    pub async fn register_task(&self, target_id: &str, task_type: TaskType) -> Result<TaskId> {
        self.register_task_with_data(target_id, task_type, &[]).await
    }

    /// Registers a task together with auxiliary data (`inputs/<name>`,
    /// `nodes/<node>`, `workflowName`, ...), written under the same lock.
    ///
    /// Fails with [`Error::LivingTaskExists`] if the target already has an
    /// INITIAL or RUNNING task. The check is advisory: two collectors racing
    /// on one target can both pass it.
    #[instrument(skip(self, data), fields(target = target_id, kind = %task_type))]
    pub async fn register_task_with_data(
        &self,
        target_id: &str,
        task_type: TaskType,
        data: &[(&str, &str)],
    ) -> Result<TaskId> {
        if let Some((task_id, status)) = self.tasks.has_living_task(target_id).await? {
            return Err(Error::LivingTaskExists {
                task_id,
                target_id: target_id.to_string(),
                status: status.to_string(),
            });
        }

        let id = TaskId::new();
        let lock_key = self.tasks.keys().task_field(&id, CREATE_LOCK);
        let lock = Lock::acquire(
            self.tasks.kv().clone(),
            LockOptions::blocking(lock_key, self.node_name.as_bytes()),
        )
        .await?
        .ok_or_else(|| {
            Error::store(
                format!("register task {id}"),
                "failed to acquire creation lock",
            )
        })?;

        let written = self.write(&id, target_id, task_type, data).await;

        debug!(task = %id.short(), "unlocking newly created task");
        if let Err(e) = lock.release().await {
            warn!(task = %id.short(), error = %e, "can't release creation lock");
        }

        written?;
        info!(task = %id.short(), "task registered");
        Ok(id)
    }

    async fn write(
        &self,
        id: &TaskId,
        target_id: &str,
        task_type: TaskType,
        data: &[(&str, &str)],
    ) -> Result<()> {
        self.tasks.write_identity(id, target_id, task_type).await?;
        self.tasks.set_creation_date(id, Utc::now()).await?;
        for (name, value) in data {
            self.tasks.set_data(id, name, value).await?;
        }
        Ok(())
    }
}
