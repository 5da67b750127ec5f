//! Task persistence and creation.

pub mod collector;
pub mod store;

pub use collector::Collector;
pub use store::{check_step_status_change, TaskStore};
