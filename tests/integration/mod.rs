//! Integration test suite for corvid.
//!
//! These tests run complete orchestrator instances against a shared
//! in-memory coordination store and a recording provisioner.
//!
//! # Test Categories
//!
//! - `dispatch`: task claiming, at-most-once processing, handoff
//! - `lifecycle`: end-to-end task execution, failure, resume, cancellation
//! - `handlers`: non-workflow task types and scoped workflows
//! - `creation`: task creation atomicity and store data integrity


mod creation;
mod dispatch;
mod handlers;
mod lifecycle;
