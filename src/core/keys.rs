//! Coordination store key layout.
//!
//! ```text
//! <prefix>/tasks/<taskId>/{targetId,status,type,creationDate}
//! <prefix>/tasks/<taskId>/{.canceledFlag,.createLock,.processingLock}
//! <prefix>/tasks/<taskId>/nodes/<nodeName>
//! <prefix>/tasks/<taskId>/inputs/<inputName>
//! <prefix>/workflows/<taskId>/<stepName>
//! <prefix>/deployments/<deploymentId>/status
//! <prefix>/deployments/<deploymentId>/workflows/<name>/steps/<stepName>/...
//! <prefix>/deployments/<deploymentId>/topology/instances/<node>/<instance>/attributes/state
//! <prefix>/events/<deploymentId>/<timestamp>
//! ```

use crate::core::task::TaskId;

pub const DEFAULT_PREFIX: &str = "_corvid";

pub const TARGET_ID: &str = "targetId";
pub const STATUS: &str = "status";
pub const TYPE: &str = "type";
pub const CREATION_DATE: &str = "creationDate";
pub const CANCELED_FLAG: &str = ".canceledFlag";
pub const CREATE_LOCK: &str = ".createLock";
pub const PROCESSING_LOCK: &str = ".processingLock";
pub const NODES: &str = "nodes";
pub const INPUTS: &str = "inputs";
pub const RESULT_SET: &str = "resultSet";

// Task data read by workers.
pub const WORKFLOW_NAME: &str = "workflowName";
pub const NODE_NAME: &str = "nodeName";
pub const COMMAND_NAME: &str = "commandName";
pub const QUERY: &str = "query";

/// Builds keys below a configurable root prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keys {
    prefix: String,
}

impl Default for Keys {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX)
    }
}

impl Keys {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.trim_end_matches('/').to_string(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn tasks(&self) -> String {
        format!("{}/tasks", self.prefix)
    }

    pub fn task(&self, id: &TaskId) -> String {
        format!("{}/tasks/{}", self.prefix, id)
    }

    pub fn task_field(&self, id: &TaskId, field: &str) -> String {
        format!("{}/tasks/{}/{}", self.prefix, id, field)
    }

    pub fn task_node(&self, id: &TaskId, node: &str) -> String {
        format!("{}/tasks/{}/{}/{}", self.prefix, id, NODES, node)
    }

    pub fn workflows(&self) -> String {
        format!("{}/workflows", self.prefix)
    }

    pub fn task_steps(&self, id: &TaskId) -> String {
        format!("{}/workflows/{}", self.prefix, id)
    }

    pub fn task_step(&self, id: &TaskId, step: &str) -> String {
        format!("{}/workflows/{}/{}", self.prefix, id, step)
    }

    pub fn deployment(&self, deployment_id: &str) -> String {
        format!("{}/deployments/{}", self.prefix, deployment_id)
    }

    pub fn deployment_status(&self, deployment_id: &str) -> String {
        format!("{}/deployments/{}/status", self.prefix, deployment_id)
    }

    pub fn workflow_definition(&self, deployment_id: &str, name: &str) -> String {
        format!("{}/deployments/{}/workflows/{}", self.prefix, deployment_id, name)
    }

    pub fn node_instances(&self, deployment_id: &str, node: &str) -> String {
        format!(
            "{}/deployments/{}/topology/instances/{}",
            self.prefix, deployment_id, node
        )
    }

    pub fn instance_state(&self, deployment_id: &str, node: &str, instance: &str) -> String {
        format!(
            "{}/deployments/{}/topology/instances/{}/{}/attributes/state",
            self.prefix, deployment_id, node, instance
        )
    }

    pub fn events(&self, deployment_id: &str) -> String {
        format!("{}/events/{}", self.prefix, deployment_id)
    }
}

/// Last non-empty path segment of a key, e.g. the task id of `.../tasks/<id>/`.
pub fn base(key: &str) -> &str {
    key.trim_end_matches('/').rsplit('/').next().unwrap_or("")
}
