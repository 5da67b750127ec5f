//! Status-change events.
//!
//! Events are fire-and-forget from the engine's point of view: publishing
//! failures are logged by [`emit_task_event`] and never fail a task.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::core::keys::{base, Keys};
use crate::core::task::{TaskId, TaskStatus, TaskType};
use crate::error::{Error, Result};
use crate::store::KvStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    InstanceStatusChange,
    DeploymentStatusChange,
    CustomCommandStatusChange,
    ScalingStatusChange,
    WorkflowStatusChange,
}

/// A persisted status change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdate {
    #[serde(skip)]
    pub timestamp: String,
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub status: String,
}

impl StatusUpdate {
    fn new(kind: EventKind, status: &str) -> Self {
        Self {
            timestamp: String::new(),
            kind,
            node: None,
            instance: None,
            task_id: None,
            status: status.to_string(),
        }
    }

    fn for_task(kind: EventKind, task_id: &TaskId, status: &str) -> Self {
        Self {
            task_id: Some(task_id.to_string()),
            ..Self::new(kind, status)
        }
    }
}

/// Sink for status-change events. Each method returns the event id.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn deployment_status_change(&self, deployment_id: &str, status: &str) -> Result<String>;

    async fn instance_status_change(
        &self,
        deployment_id: &str,
        node: &str,
        instance: &str,
        status: &str,
    ) -> Result<String>;

    async fn workflow_status_change(
        &self,
        deployment_id: &str,
        task_id: &TaskId,
        status: &str,
    ) -> Result<String>;

    async fn scaling_status_change(
        &self,
        deployment_id: &str,
        task_id: &TaskId,
        status: &str,
    ) -> Result<String>;

    async fn custom_command_status_change(
        &self,
        deployment_id: &str,
        task_id: &TaskId,
        status: &str,
    ) -> Result<String>;
}

/// Publisher persisting events under `<prefix>/events/<deployment>/<timestamp>`.
pub struct StoreEventPublisher {
    store: Arc<dyn KvStore>,
    keys: Keys,
    /// Last timestamp handed out; keeps event keys strictly increasing.
    last: Mutex<DateTime<Utc>>,
}

impl StoreEventPublisher {
    pub fn new(store: Arc<dyn KvStore>, keys: Keys) -> Self {
        Self {
            store,
            keys,
            last: Mutex::new(DateTime::<Utc>::MIN_UTC),
        }
    }

    fn next_timestamp(&self) -> Result<String> {
        let mut last = self
            .last
            .lock()
            .map_err(|_| Error::store("publish event", "timestamp lock poisoned"))?;
        let mut now = Utc::now();
        if now <= *last {
            now = *last + chrono::Duration::nanoseconds(1);
        }
        *last = now;
        Ok(now.to_rfc3339_opts(SecondsFormat::Nanos, true))
    }

    async fn publish(&self, deployment_id: &str, update: StatusUpdate) -> Result<String> {
        let id = self.next_timestamp()?;
        let key = format!("{}/{}", self.keys.events(deployment_id), id);
        self.store
            .put(&key, &serde_json::to_vec(&update)?)
            .await?;
        info!(
            deployment = deployment_id,
            kind = ?update.kind,
            status = %update.status,
            "status changed"
        );
        Ok(id)
    }

    /// Every event of a deployment, oldest first.
    pub async fn status_events(&self, deployment_id: &str) -> Result<Vec<StatusUpdate>> {
        let pairs = self
            .store
            .list(&format!("{}/", self.keys.events(deployment_id)))
            .await?;
        pairs
            .iter()
            .map(|kv| {
                let mut update: StatusUpdate = serde_json::from_slice(&kv.value)?;
                update.timestamp = base(&kv.key).to_string();
                Ok(update)
            })
            .collect()
    }
}

#[async_trait]
impl EventPublisher for StoreEventPublisher {
    async fn deployment_status_change(&self, deployment_id: &str, status: &str) -> Result<String> {
        self.publish(
            deployment_id,
            StatusUpdate::new(EventKind::DeploymentStatusChange, status),
        )
        .await
    }

    async fn instance_status_change(
        &self,
        deployment_id: &str,
        node: &str,
        instance: &str,
        status: &str,
    ) -> Result<String> {
        let update = StatusUpdate {
            node: Some(node.to_string()),
            instance: Some(instance.to_string()),
            ..StatusUpdate::new(EventKind::InstanceStatusChange, status)
        };
        self.publish(deployment_id, update).await
    }

    async fn workflow_status_change(
        &self,
        deployment_id: &str,
        task_id: &TaskId,
        status: &str,
    ) -> Result<String> {
        self.publish(
            deployment_id,
            StatusUpdate::for_task(EventKind::WorkflowStatusChange, task_id, status),
        )
        .await
    }

    async fn scaling_status_change(
        &self,
        deployment_id: &str,
        task_id: &TaskId,
        status: &str,
    ) -> Result<String> {
        self.publish(
            deployment_id,
            StatusUpdate::for_task(EventKind::ScalingStatusChange, task_id, status),
        )
        .await
    }

    async fn custom_command_status_change(
        &self,
        deployment_id: &str,
        task_id: &TaskId,
        status: &str,
    ) -> Result<String> {
        self.publish(
            deployment_id,
            StatusUpdate::for_task(EventKind::CustomCommandStatusChange, task_id, status),
        )
        .await
    }
}

/// Emits the task-level event matching `task_type`, if that type has one.
///
/// Returns the event id. Failures are logged, not returned.
pub async fn emit_task_event(
    publisher: &dyn EventPublisher,
    deployment_id: &str,
    task_id: &TaskId,
    task_type: TaskType,
    status: TaskStatus,
) -> Option<String> {
    let status = status.to_string().to_lowercase();
    let res = match task_type {
        TaskType::CustomCommand => {
            publisher
                .custom_command_status_change(deployment_id, task_id, &status)
                .await
        }
        TaskType::CustomWorkflow => {
            publisher
                .workflow_status_change(deployment_id, task_id, &status)
                .await
        }
        TaskType::ScaleOut | TaskType::ScaleIn => {
            publisher
                .scaling_status_change(deployment_id, task_id, &status)
                .await
        }
        TaskType::Deploy
        | TaskType::Undeploy
        | TaskType::Purge
        | TaskType::Query => return None,
    };
    match res {
        Ok(id) => Some(id),
        Err(e) => {
            warn!(task = %task_id.short(), error = %e, "failed to publish task event");
            None
        }
    }
}
