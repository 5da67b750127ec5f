//! Core domain models for corvid orchestration.
//!
//! This module contains the task data model shared by the task store,
//! dispatcher, workers and workflow engine, plus the coordination store
//! key layout.

pub mod keys;
pub mod task;

pub use keys::Keys;
pub use task::{DeploymentStatus, StepStatus, TaskHandler, TaskId, TaskStatus, TaskStep, TaskType};
