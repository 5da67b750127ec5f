//! Task data model for the orchestration engine.
//!
//! A task is a persisted unit of operator intent acting on a target
//! (deployment). Status and type are stored in the coordination store as
//! stringified integers; step statuses are stored as lowercase text.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Unique identifier for a task.
///
/// Uses UUID v4 for generation and provides a short form display
/// for human-readable output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Create a new unique task identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// The kind of intent a task carries.
///
/// The integer codes are the persisted representation and must stay stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Deploy,
    Undeploy,
    ScaleOut,
    ScaleIn,
    Purge,
    CustomCommand,
    CustomWorkflow,
    Query,
}

/// How a worker executes a task of a given type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskHandler {
    /// Run a named workflow of the target deployment.
    Workflow {
        name: &'static str,
        /// Restrict the workflow to the task's related nodes.
        scoped: bool,
    },
    /// Run the workflow named by the task's `workflowName` data.
    CustomWorkflow,
    /// Run a single operation on one node.
    CustomCommand,
    /// Remove every trace of the deployment.
    Purge,
    /// Ask the provisioner for a result set.
    Query,
}

impl TaskType {
    pub const ALL: [TaskType; 8] = [
        TaskType::Deploy,
        TaskType::Undeploy,
        TaskType::ScaleOut,
        TaskType::ScaleIn,
        TaskType::Purge,
        TaskType::CustomCommand,
        TaskType::CustomWorkflow,
        TaskType::Query,
    ];

    pub fn code(&self) -> u8 {
        match self {
            TaskType::Deploy => 0,
            TaskType::Undeploy => 1,
            TaskType::ScaleOut => 2,
            TaskType::ScaleIn => 3,
            TaskType::Purge => 4,
            TaskType::CustomCommand => 5,
            TaskType::CustomWorkflow => 6,
            TaskType::Query => 7,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.get(code as usize).copied()
    }

    /// Parse the stored representation of a task type.
    pub fn parse(key: &str, raw: &str) -> Result<Self> {
        let code: i64 = raw
            .trim()
            .parse()
            .map_err(|_| Error::invalid(key, raw, "task type is not an integer"))?;
        u8::try_from(code)
            .ok()
            .and_then(Self::from_code)
            .ok_or_else(|| Error::invalid(key, raw, "task type out of range"))
    }

    /// Handler lookup; adding a type forces a decision here.
    pub fn handler(&self) -> TaskHandler {
        match self {
            TaskType::Deploy => TaskHandler::Workflow {
                name: "install",
                scoped: false,
            },
            TaskType::Undeploy => TaskHandler::Workflow {
                name: "uninstall",
                scoped: false,
            },
            TaskType::ScaleOut => TaskHandler::Workflow {
                name: "install",
                scoped: true,
            },
            TaskType::ScaleIn => TaskHandler::Workflow {
                name: "uninstall",
                scoped: true,
            },
            TaskType::CustomWorkflow => TaskHandler::CustomWorkflow,
            TaskType::CustomCommand => TaskHandler::CustomCommand,
            TaskType::Purge => TaskHandler::Purge,
            TaskType::Query => TaskHandler::Query,
        }
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskType::Deploy => write!(f, "Deploy"),
            TaskType::Undeploy => write!(f, "UnDeploy"),
            TaskType::ScaleOut => write!(f, "ScaleOut"),
            TaskType::ScaleIn => write!(f, "ScaleIn"),
            TaskType::Purge => write!(f, "Purge"),
            TaskType::CustomCommand => write!(f, "CustomCommand"),
            TaskType::CustomWorkflow => write!(f, "CustomWorkflow"),
            TaskType::Query => write!(f, "Query"),
        }
    }
}

/// Task status in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskStatus {
    /// Created, waiting for a dispatcher to claim it.
    #[default]
    Initial,
    /// Claimed and being executed by a worker.
    Running,
    Done,
    Failed,
    Canceled,
}

impl TaskStatus {
    pub fn code(&self) -> u8 {
        match self {
            TaskStatus::Initial => 0,
            TaskStatus::Running => 1,
            TaskStatus::Done => 2,
            TaskStatus::Failed => 3,
            TaskStatus::Canceled => 4,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(TaskStatus::Initial),
            1 => Some(TaskStatus::Running),
            2 => Some(TaskStatus::Done),
            3 => Some(TaskStatus::Failed),
            4 => Some(TaskStatus::Canceled),
            _ => None,
        }
    }

    /// Parse the stored representation of a task status.
    pub fn parse(key: &str, raw: &str) -> Result<Self> {
        let code: i64 = raw
            .trim()
            .parse()
            .map_err(|_| Error::invalid(key, raw, "task status is not an integer"))?;
        u8::try_from(code)
            .ok()
            .and_then(Self::from_code)
            .ok_or_else(|| Error::invalid(key, raw, "task status out of range"))
    }

    /// INITIAL or RUNNING.
    pub fn is_living(&self) -> bool {
        matches!(self, TaskStatus::Initial | TaskStatus::Running)
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            TaskStatus::Done | TaskStatus::Failed | TaskStatus::Canceled
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Initial => write!(f, "INITIAL"),
            TaskStatus::Running => write!(f, "RUNNING"),
            TaskStatus::Done => write!(f, "DONE"),
            TaskStatus::Failed => write!(f, "FAILED"),
            TaskStatus::Canceled => write!(f, "CANCELED"),
        }
    }
}

/// Status of a single workflow step for one task execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    #[default]
    Initial,
    Running,
    Done,
    Error,
    Canceled,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Initial => "initial",
            StepStatus::Running => "running",
            StepStatus::Done => "done",
            StepStatus::Error => "error",
            StepStatus::Canceled => "canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Done | StepStatus::Error | StepStatus::Canceled
        )
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StepStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "initial" => Ok(StepStatus::Initial),
            "running" => Ok(StepStatus::Running),
            "done" => Ok(StepStatus::Done),
            "error" => Ok(StepStatus::Error),
            "canceled" => Ok(StepStatus::Canceled),
            _ => Err(Error::invalid("step status", s, "unknown step status")),
        }
    }
}

/// A step of the workflow related to a task, as exposed for inspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStep {
    pub name: String,
    pub status: String,
}

/// Deployment-level status maintained by workers while tasks run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    DeploymentInProgress,
    Deployed,
    DeploymentFailed,
    UndeploymentInProgress,
    Undeployed,
    UndeploymentFailed,
    ScalingInProgress,
    Scaled,
    ScalingFailed,
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DeploymentStatus::DeploymentInProgress => "deployment_in_progress",
            DeploymentStatus::Deployed => "deployed",
            DeploymentStatus::DeploymentFailed => "deployment_failed",
            DeploymentStatus::UndeploymentInProgress => "undeployment_in_progress",
            DeploymentStatus::Undeployed => "undeployed",
            DeploymentStatus::UndeploymentFailed => "undeployment_failed",
            DeploymentStatus::ScalingInProgress => "scaling_in_progress",
            DeploymentStatus::Scaled => "scaled",
            DeploymentStatus::ScalingFailed => "scaling_failed",
        };
        f.write_str(s)
    }
}
