//! Collaborators invoked by step bodies.
//!
//! The engine never provisions anything itself: delegate and operation
//! activities are handed to a [`Provisioner`], and instance enumeration and
//! state tracking go through a [`Topology`].

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::core::keys::{base, Keys};
use crate::core::task::TaskId;
use crate::error::Result;
use crate::store::{KvStore, QueryOptions};

/// Everything a provisioner needs to act on one node for one step.
#[derive(Debug, Clone)]
pub struct OperationContext {
    pub task_id: TaskId,
    pub deployment_id: String,
    pub node: String,
    pub step: String,
    /// Instances of `node` in scope for this task.
    pub instances: Vec<String>,
    /// Fires when the task is canceled. Long-running operations should poll it.
    pub cancel: CancellationToken,
}

/// Technology-specific execution backend.
///
/// Errors built with [`crate::Error::retriable`] may be retried by the
/// engine; anything else fails the step.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Delegates a whole lifecycle operation (e.g. `install`) for a node.
    async fn exec_delegate(&self, ctx: &OperationContext, operation: &str) -> Result<()>;

    /// Runs one interface operation (e.g. `standard.create`) on a node.
    async fn exec_operation(&self, ctx: &OperationContext, operation: &str) -> Result<()>;

    /// Answers a query task; the result is stored verbatim as the task's result set.
    async fn exec_query(&self, task_id: &TaskId, deployment_id: &str, query: &str)
        -> Result<String>;
}

/// Topology lookups needed by the engine.
#[async_trait]
pub trait Topology: Send + Sync {
    async fn node_instances(&self, deployment_id: &str, node: &str) -> Result<Vec<String>>;

    async fn set_instance_state(
        &self,
        deployment_id: &str,
        node: &str,
        instance: &str,
        state: &str,
    ) -> Result<()>;
}

/// Topology backed by the coordination store instance tree.
#[derive(Clone)]
pub struct StoreTopology {
    store: Arc<dyn KvStore>,
    keys: Keys,
}

impl StoreTopology {
    pub fn new(store: Arc<dyn KvStore>, keys: Keys) -> Self {
        Self { store, keys }
    }

    /// Declares the instances of a node, with an initial state.
    pub async fn add_instances(&self, deployment_id: &str, node: &str, instances: &[&str]) -> Result<()> {
        for instance in instances {
            self.set_instance_state(deployment_id, node, instance, "initial")
                .await?;
        }
        Ok(())
    }

    pub async fn instance_state(
        &self,
        deployment_id: &str,
        node: &str,
        instance: &str,
    ) -> Result<Option<String>> {
        let key = self.keys.instance_state(deployment_id, node, instance);
        Ok(self.store.get(&key).await?.map(|kv| kv.value_str()))
    }
}

#[async_trait]
impl Topology for StoreTopology {
    async fn node_instances(&self, deployment_id: &str, node: &str) -> Result<Vec<String>> {
        let prefix = format!("{}/", self.keys.node_instances(deployment_id, node));
        let (keys, _) = self
            .store
            .keys(&prefix, Some('/'), &QueryOptions::default())
            .await?;
        Ok(keys.iter().map(|k| base(k).to_string()).collect())
    }

    async fn set_instance_state(
        &self,
        deployment_id: &str,
        node: &str,
        instance: &str,
        state: &str,
    ) -> Result<()> {
        let key = self.keys.instance_state(deployment_id, node, instance);
        self.store.put(&key, state.as_bytes()).await
    }
}
