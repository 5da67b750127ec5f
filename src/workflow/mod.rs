//! Workflow definitions and their execution.

pub mod definition;
pub mod engine;
mod step;

pub use definition::{read_workflow, store_workflow, Activity, StepDefinition, Workflow, WorkflowBuilder};
pub use engine::WorkflowEngine;
