use thiserror::Error;

use crate::core::task::TaskId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Coordination store error ({context}): {message}")]
    Store { context: String, message: String },

    #[error("Missing value for key {key:?}")]
    MissingKey { key: String },

    #[error("Invalid value {value:?} for key {key:?}: {reason}")]
    InvalidData {
        key: String,
        value: String,
        reason: String,
    },

    #[error("Data {name:?} not found for task {task_id:?}")]
    TaskDataNotFound { name: String, task_id: String },

    #[error("Task with id {task_id:?} and status {status:?} already exists for target {target_id:?}")]
    LivingTaskExists {
        task_id: TaskId,
        target_id: String,
        status: String,
    },

    #[error("Workflow {name:?} not found for deployment {deployment_id:?}")]
    WorkflowNotFound { deployment_id: String, name: String },

    #[error("Step {step:?} failed on node {node:?} (task {task_id}): {source}")]
    Step {
        task_id: TaskId,
        step: String,
        node: String,
        #[source]
        source: Box<Error>,
    },

    #[error("Provisioner error: {message}")]
    Provisioner { message: String, retriable: bool },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Execution canceled")]
    Canceled,
}

impl Error {
    /// Wrap a coordination store failure with the operation that triggered it.
    pub fn store(context: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Error::Store {
            context: context.into(),
            message: message.to_string(),
        }
    }

    pub fn invalid(key: impl Into<String>, value: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::InvalidData {
            key: key.into(),
            value: value.into(),
            reason: reason.into(),
        }
    }

    /// Build a fatal provisioner error.
    pub fn provisioner(message: impl Into<String>) -> Self {
        Error::Provisioner {
            message: message.into(),
            retriable: false,
        }
    }

    /// Build a provisioner error the caller may retry.
    pub fn retriable(message: impl Into<String>) -> Self {
        Error::Provisioner {
            message: message.into(),
            retriable: true,
        }
    }

    /// True for absent optional data, as opposed to a failure to reach the store.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::TaskDataNotFound { .. })
    }

    pub fn is_retriable(&self) -> bool {
        matches!(self, Error::Provisioner { retriable: true, .. })
    }

    /// Returns the id of the conflicting task for living-task conflicts.
    pub fn living_task_id(&self) -> Option<TaskId> {
        match self {
            Error::LivingTaskExists { task_id, .. } => Some(*task_id),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
