//! Task persistence on top of the coordination store.
//!
//! Every operation is a single-key read or write; nothing here assumes
//! multi-key transactions. Missing optional data surfaces as
//! [`Error::TaskDataNotFound`], distinct from store failures.

use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use tracing::{debug, instrument, warn};

use crate::core::keys::{
    base, Keys, CANCELED_FLAG, CREATE_LOCK, CREATION_DATE, INPUTS, NODES, RESULT_SET, STATUS,
    TARGET_ID, TYPE,
};
use crate::core::task::{DeploymentStatus, StepStatus, TaskId, TaskStatus, TaskStep, TaskType};
use crate::error::{Error, Result};
use crate::provision::Topology;
use crate::store::{KvPair, KvStore, QueryOptions};

/// Handle over the task namespace of a coordination store.
#[derive(Clone)]
pub struct TaskStore {
    store: Arc<dyn KvStore>,
    keys: Keys,
}

impl std::fmt::Debug for TaskStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskStore").field("keys", &self.keys).finish()
    }
}

impl TaskStore {
    pub fn new(store: Arc<dyn KvStore>, keys: Keys) -> Self {
        Self { store, keys }
    }

    pub fn kv(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    pub fn keys(&self) -> &Keys {
        &self.keys
    }

    /// Creates a task through a default [`Collector`](super::Collector).
    pub async fn create(&self, target_id: &str, task_type: TaskType) -> Result<TaskId> {
        super::Collector::new(self.clone())
            .register_task(target_id, task_type)
            .await
    }

    /// Reads a required, non-empty task field.
    async fn required(&self, id: &TaskId, field: &str) -> Result<String> {
        let key = self.keys.task_field(id, field);
        match self.store.get(&key).await? {
            Some(kv) if !kv.value.is_empty() => Ok(kv.value_str()),
            _ => Err(Error::MissingKey { key }),
        }
    }

    pub async fn status(&self, id: &TaskId) -> Result<TaskStatus> {
        let raw = self.required(id, STATUS).await?;
        TaskStatus::parse(&self.keys.task_field(id, STATUS), &raw)
    }

    #[instrument(skip(self), fields(task = %id.short()))]
    pub async fn set_status(&self, id: &TaskId, status: TaskStatus) -> Result<()> {
        debug!(%status, "setting task status");
        self.store
            .put(
                &self.keys.task_field(id, STATUS),
                status.code().to_string().as_bytes(),
            )
            .await
    }

    pub async fn task_type(&self, id: &TaskId) -> Result<TaskType> {
        let raw = self.required(id, TYPE).await?;
        TaskType::parse(&self.keys.task_field(id, TYPE), &raw)
    }

    pub async fn target(&self, id: &TaskId) -> Result<String> {
        self.required(id, TARGET_ID).await
    }

    pub async fn creation_date(&self, id: &TaskId) -> Result<DateTime<Utc>> {
        let raw = self.required(id, CREATION_DATE).await?;
        DateTime::parse_from_rfc3339(raw.trim())
            .map(|d| d.with_timezone(&Utc))
            .map_err(|e| {
                Error::invalid(self.keys.task_field(id, CREATION_DATE), raw, e.to_string())
            })
    }

    pub async fn set_creation_date(&self, id: &TaskId, date: DateTime<Utc>) -> Result<()> {
        let encoded = date.to_rfc3339_opts(SecondsFormat::Nanos, true);
        self.store
            .put(&self.keys.task_field(id, CREATION_DATE), encoded.as_bytes())
            .await
    }

    /// Writes the three identity fields of a new task.
    pub(crate) async fn write_identity(
        &self,
        id: &TaskId,
        target_id: &str,
        task_type: TaskType,
    ) -> Result<()> {
        self.store
            .put(&self.keys.task_field(id, TARGET_ID), target_id.as_bytes())
            .await?;
        self.set_status(id, TaskStatus::Initial).await?;
        self.store
            .put(
                &self.keys.task_field(id, TYPE),
                task_type.code().to_string().as_bytes(),
            )
            .await
    }

    pub async fn exists(&self, id: &TaskId) -> Result<bool> {
        Ok(self
            .store
            .get(&self.keys.task_field(id, TARGET_ID))
            .await?
            .is_some_and(|kv| !kv.value.is_empty()))
    }

    /// Sets the cancellation flag. Status is left untouched.
    pub async fn cancel(&self, id: &TaskId) -> Result<()> {
        debug!(task = %id.short(), "cancel requested");
        self.store
            .put(&self.keys.task_field(id, CANCELED_FLAG), b"true")
            .await
    }

    pub async fn is_canceled(&self, id: &TaskId) -> Result<bool> {
        Ok(self
            .store
            .get(&self.keys.task_field(id, CANCELED_FLAG))
            .await?
            .is_some_and(|kv| kv.value_str().trim().eq_ignore_ascii_case("true")))
    }

    /// Puts a FAILED task back to INITIAL so that a dispatcher claims it
    /// again. Any other status is rejected with [`Error::Validation`].
    ///
    /// The cancellation flag is cleared, otherwise the next run would stop
    /// immediately.
    pub async fn resume(&self, id: &TaskId) -> Result<()> {
        let status = self.status(id).await?;
        if status != TaskStatus::Failed {
            return Err(Error::Validation(format!(
                "task {id} is {status}, only failed tasks can be resumed"
            )));
        }
        self.store
            .delete(&self.keys.task_field(id, CANCELED_FLAG))
            .await?;
        self.set_status(id, TaskStatus::Initial).await
    }

    pub async fn delete(&self, id: &TaskId) -> Result<()> {
        self.store
            .delete_tree(&format!("{}/", self.keys.task(id)))
            .await
    }

    /// Ids of every stored task, in store listing order.
    pub async fn task_ids(&self) -> Result<Vec<TaskId>> {
        let (keys, _) = self
            .store
            .keys(&format!("{}/", self.keys.tasks()), Some('/'), &QueryOptions::default())
            .await?;
        Ok(keys
            .iter()
            .filter_map(|k| match base(k).parse() {
                Ok(id) => Some(id),
                Err(_) => {
                    warn!(key = %k, "ignoring malformed task key");
                    None
                }
            })
            .collect())
    }

    pub async fn tasks_for_target(&self, target_id: &str) -> Result<Vec<TaskId>> {
        let mut found = Vec::new();
        for id in self.task_ids().await? {
            if self.target_matches(&id, target_id).await? {
                found.push(id);
            }
        }
        Ok(found)
    }

    async fn target_matches(&self, id: &TaskId, target_id: &str) -> Result<bool> {
        Ok(self
            .store
            .get(&self.keys.task_field(id, TARGET_ID))
            .await?
            .is_some_and(|kv| kv.value == target_id.as_bytes()))
    }

    /// True while a collector holds the task's creation lock.
    pub async fn is_being_created(&self, id: &TaskId) -> Result<bool> {
        Ok(self
            .store
            .get(&self.keys.task_field(id, CREATE_LOCK))
            .await?
            .is_some())
    }

    /// First task of `target_id` that is INITIAL or RUNNING, if any.
    ///
    /// Scans every task: O(total tasks).
    pub async fn has_living_task(&self, target_id: &str) -> Result<Option<(TaskId, TaskStatus)>> {
        for id in self.task_ids().await? {
            if !self.target_matches(&id, target_id).await? {
                continue;
            }
            let status = match self.status(&id).await {
                Ok(status) => status,
                // Still being written by a collector: it will be INITIAL.
                Err(Error::MissingKey { .. }) if self.is_being_created(&id).await? => {
                    TaskStatus::Initial
                }
                Err(e) => return Err(e),
            };
            if status.is_living() {
                return Ok(Some((id, status)));
            }
        }
        Ok(None)
    }

    /// Reads auxiliary task data stored under `name` (may contain `/`).
    pub async fn data(&self, id: &TaskId, name: &str) -> Result<String> {
        match self.store.get(&self.keys.task_field(id, name)).await? {
            Some(kv) => Ok(kv.value_str()),
            None => Err(Error::TaskDataNotFound {
                name: name.to_string(),
                task_id: id.to_string(),
            }),
        }
    }

    pub async fn set_data(&self, id: &TaskId, name: &str, value: &str) -> Result<()> {
        self.store
            .put(&self.keys.task_field(id, name), value.as_bytes())
            .await
    }

    pub async fn input(&self, id: &TaskId, name: &str) -> Result<String> {
        self.data(id, &format!("{INPUTS}/{name}")).await
    }

    pub async fn set_input(&self, id: &TaskId, name: &str, value: &str) -> Result<()> {
        self.set_data(id, &format!("{INPUTS}/{name}"), value).await
    }

    /// Nodes this task is restricted to. Empty for unrestricted tasks.
    pub async fn related_nodes(&self, id: &TaskId) -> Result<Vec<String>> {
        let prefix = format!("{}/{}/", self.keys.task(id), NODES);
        let (keys, _) = self
            .store
            .keys(&prefix, Some('/'), &QueryOptions::default())
            .await?;
        Ok(keys.iter().map(|k| base(k).to_string()).collect())
    }

    /// Restricts the task to `node`, optionally overriding its instance list.
    pub async fn set_related_node(&self, id: &TaskId, node: &str, instances: &[String]) -> Result<()> {
        self.store
            .put(&self.keys.task_node(id, node), instances.join(",").as_bytes())
            .await
    }

    pub async fn is_related_node(&self, id: &TaskId, node: &str) -> Result<bool> {
        Ok(self.store.get(&self.keys.task_node(id, node)).await?.is_some())
    }

    /// Instances of `node` in the scope of this task: the task's own
    /// override if set, otherwise every instance known to the topology.
    pub async fn instances(
        &self,
        id: &TaskId,
        deployment_id: &str,
        node: &str,
        topology: &dyn Topology,
    ) -> Result<Vec<String>> {
        match self.store.get(&self.keys.task_node(id, node)).await? {
            Some(kv) if !kv.value.is_empty() => Ok(kv
                .value_str()
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()),
            _ => topology.node_instances(deployment_id, node).await,
        }
    }

    pub async fn result_set(&self, id: &TaskId) -> Result<Option<String>> {
        Ok(self
            .store
            .get(&self.keys.task_field(id, RESULT_SET))
            .await?
            .map(|kv| kv.value_str()))
    }

    pub async fn set_result_set(&self, id: &TaskId, result: &str) -> Result<()> {
        self.store
            .put(&self.keys.task_field(id, RESULT_SET), result.as_bytes())
            .await
    }

    /// Steps recorded for the task's workflow, in key order.
    pub async fn related_steps(&self, id: &TaskId) -> Result<Vec<TaskStep>> {
        let pairs = self
            .store
            .list(&format!("{}/", self.keys.task_steps(id)))
            .await?;
        Ok(pairs.iter().map(to_step).collect())
    }

    pub async fn step_exists(&self, id: &TaskId, step: &str) -> Result<Option<TaskStep>> {
        Ok(self
            .store
            .get(&self.keys.task_step(id, step))
            .await?
            .filter(|kv| !kv.value.is_empty())
            .map(|kv| TaskStep {
                name: step.to_string(),
                status: kv.value_str(),
            }))
    }

    pub async fn update_step_status(&self, id: &TaskId, step: &TaskStep) -> Result<()> {
        self.store
            .put(&self.keys.task_step(id, &step.name), step.status.as_bytes())
            .await
    }

    pub async fn set_step_status(&self, id: &TaskId, step: &str, status: StepStatus) -> Result<()> {
        self.store
            .put(&self.keys.task_step(id, step), status.as_str().as_bytes())
            .await
    }

    pub async fn step_status(&self, id: &TaskId, step: &str) -> Result<Option<StepStatus>> {
        match self.store.get(&self.keys.task_step(id, step)).await? {
            Some(kv) => Ok(Some(kv.value_str().parse()?)),
            None => Ok(None),
        }
    }

    pub async fn deployment_status(&self, deployment_id: &str) -> Result<Option<String>> {
        Ok(self
            .store
            .get(&self.keys.deployment_status(deployment_id))
            .await?
            .map(|kv| kv.value_str()))
    }

    pub async fn set_deployment_status(
        &self,
        deployment_id: &str,
        status: DeploymentStatus,
    ) -> Result<()> {
        self.store
            .put(
                &self.keys.deployment_status(deployment_id),
                status.to_string().as_bytes(),
            )
            .await
    }
}

fn to_step(kv: &KvPair) -> TaskStep {
    TaskStep {
        name: base(&kv.key).to_string(),
        status: kv.value_str(),
    }
}

/// Whether a manual step status change is allowed.
///
/// Only ERROR to DONE is accepted, so an operator can mark a step fixed by
/// hand before resuming. Identical statuses are an error.
pub fn check_step_status_change(before: &str, after: &str) -> Result<bool> {
    if before == after {
        return Err(Error::Validation(
            "final and initial status are identical: nothing to do".into(),
        ));
    }
    let before: StepStatus = before.parse()?;
    let after: StepStatus = after.parse()?;
    Ok(before == StepStatus::Error && after == StepStatus::Done)
}
