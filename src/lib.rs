//! Distributed task scheduling and workflow execution over a shared
//! coordination store.

pub mod config;
pub mod core;
pub mod error;
pub mod events;
pub mod log;
pub mod orchestration;
pub mod provision;
pub mod store;
pub mod tasks;
pub mod workflow;

pub use config::Config;
pub use error::{Error, Result};
pub use orchestration::{Orchestrator, OrchestratorHandle};
