//! End-to-end task lifecycle tests.
//!
//! These tests drive deploy tasks through a running orchestrator and check
//! task status, step statuses, deployment status and emitted events.

use std::time::Duration;

use corvid::core::keys::PROCESSING_LOCK;
use corvid::core::{StepStatus, TaskStatus, TaskType};
use corvid::events::EventKind;

use crate::fixtures::{
    blocking_install_workflow, diamond_workflow, install_workflow, Harness, TestProvisioner,
};

/// Test: End-to-end deploy
/// Given workflow "install" with ComputeCreate -> AppInstall
/// When a Deploy task for dep1 is registered and claimed
/// Then it goes INITIAL -> RUNNING -> DONE with both steps done
#[tokio::test]
async fn test_deploy_end_to_end() {
    let harness = Harness::new();
    harness.install("dep1", &blocking_install_workflow()).await;
    let provisioner = TestProvisioner::new();

    let id = harness
        .collector()
        .register_task("dep1", TaskType::Deploy)
        .await
        .unwrap();
    assert_eq!(harness.tasks.status(&id).await.unwrap(), TaskStatus::Initial);

    let handle = harness.start("node-a", provisioner.clone());
    provisioner.wait_started("ComputeCreate").await;
    assert_eq!(harness.tasks.status(&id).await.unwrap(), TaskStatus::Running);
    assert_eq!(harness.step(&id, "ComputeCreate").await, Some(StepStatus::Running));
    assert_eq!(
        harness.tasks.deployment_status("dep1").await.unwrap().as_deref(),
        Some("deployment_in_progress")
    );

    provisioner.open_gate();
    assert_eq!(harness.wait_finished(&id).await, TaskStatus::Done);
    assert_eq!(harness.step(&id, "ComputeCreate").await, Some(StepStatus::Done));
    assert_eq!(harness.step(&id, "AppInstall").await, Some(StepStatus::Done));
    assert_eq!(
        harness.tasks.deployment_status("dep1").await.unwrap().as_deref(),
        Some("deployed")
    );

    let steps = harness.tasks.related_steps(&id).await.unwrap();
    assert_eq!(steps.len(), 2);
    assert!(steps.iter().all(|s| s.status == "done"));

    let events = harness.events().status_events("dep1").await.unwrap();
    let statuses: Vec<_> = events
        .iter()
        .filter(|e| e.kind == EventKind::DeploymentStatusChange)
        .map(|e| e.status.as_str())
        .collect();
    assert_eq!(statuses, vec!["deployment_in_progress", "deployed"]);

    // The processing lock is gone once the worker is done.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let lock_key = harness.keys.task_field(&id, PROCESSING_LOCK);
    assert!(harness.store.lock_holder(&lock_key).unwrap().is_none());

    handle.stop().await;
}

/// Test: Workflow graph completion
/// Given the diamond A -> {B, C}, B -> D, C -> {D, E}
/// When the workflow runs through a worker
/// Then D runs exactly once, after both B and C finished
#[tokio::test]
async fn test_diamond_join_runs_once() {
    let harness = Harness::new();
    harness.install("dep1", &diamond_workflow("install")).await;
    let provisioner = TestProvisioner::with_delay(Duration::from_millis(10));
    let handle = harness.start("node-a", provisioner.clone());

    let id = harness
        .collector()
        .register_task("dep1", TaskType::Deploy)
        .await
        .unwrap();
    assert_eq!(harness.wait_finished(&id).await, TaskStatus::Done);

    assert_eq!(provisioner.started("dep1", "D"), 1);
    let d = provisioner.position("D", false).unwrap();
    assert!(d > provisioner.position("B", true).unwrap());
    assert!(d > provisioner.position("C", true).unwrap());

    handle.stop().await;
}

/// Test: Failure isolation
/// Given the diamond workflow where B fails
/// When the task runs
/// Then D never runs, C's other successor E completes and the task fails
#[tokio::test]
async fn test_failure_isolation() {
    let harness = Harness::new();
    harness.install("dep1", &diamond_workflow("install")).await;
    let provisioner = TestProvisioner::new();
    provisioner.fail_step("B");
    let handle = harness.start("node-a", provisioner.clone());

    let id = harness
        .collector()
        .register_task("dep1", TaskType::Deploy)
        .await
        .unwrap();
    assert_eq!(harness.wait_finished(&id).await, TaskStatus::Failed);

    assert_eq!(harness.step(&id, "B").await, Some(StepStatus::Error));
    assert_eq!(harness.step(&id, "C").await, Some(StepStatus::Done));
    assert_eq!(harness.step(&id, "E").await, Some(StepStatus::Done));
    assert_ne!(harness.step(&id, "D").await, Some(StepStatus::Done));
    assert_eq!(provisioner.started("dep1", "D"), 0);
    assert_eq!(
        harness.tasks.deployment_status("dep1").await.unwrap().as_deref(),
        Some("deployment_failed")
    );

    handle.stop().await;
}

/// Test: Resume transition
/// Given a task that failed on AppInstall
/// When the fault is fixed and the task is resumed
/// Then it is claimed again exactly once and completes
#[tokio::test]
async fn test_resume_failed_task() {
    let harness = Harness::new();
    harness.install("dep1", &install_workflow()).await;
    let provisioner = TestProvisioner::new();
    provisioner.fail_step("AppInstall");
    let handle = harness.start("node-a", provisioner.clone());

    let id = harness
        .collector()
        .register_task("dep1", TaskType::Deploy)
        .await
        .unwrap();
    assert_eq!(harness.wait_finished(&id).await, TaskStatus::Failed);
    assert_eq!(harness.step(&id, "AppInstall").await, Some(StepStatus::Error));

    // A failed task is not living: a new task on the target is allowed.
    assert!(harness.tasks.has_living_task("dep1").await.unwrap().is_none());

    provisioner.heal();
    harness.tasks.resume(&id).await.unwrap();
    assert_eq!(harness.wait_finished(&id).await, TaskStatus::Done);
    assert_eq!(harness.step(&id, "AppInstall").await, Some(StepStatus::Done));
    assert_eq!(provisioner.started("dep1", "AppInstall"), 2);
    assert_eq!(provisioner.started("dep1", "ComputeCreate"), 2);

    handle.stop().await;
}

/// Test: Cancellation flag is advisory
/// Given a registered task that is not running
/// When it is canceled
/// Then its status is unchanged
#[tokio::test]
async fn test_cancel_does_not_change_status() {
    let harness = Harness::new();
    let id = harness
        .collector()
        .register_task("dep1", TaskType::Deploy)
        .await
        .unwrap();

    harness.tasks.cancel(&id).await.unwrap();
    assert!(harness.tasks.is_canceled(&id).await.unwrap());
    assert_eq!(harness.tasks.status(&id).await.unwrap(), TaskStatus::Initial);
}

/// Test: Cancellation of a running task
/// Given a task whose first step does not poll for cancellation
/// When the task is canceled while that step runs
/// Then the step completes, its successor never starts and the task ends CANCELED
#[tokio::test]
async fn test_cancel_running_task() {
    let harness = Harness::new();
    harness.install("dep1", &blocking_install_workflow()).await;
    let provisioner = TestProvisioner::new();
    let handle = harness.start("node-a", provisioner.clone());

    let id = harness
        .collector()
        .register_task("dep1", TaskType::Deploy)
        .await
        .unwrap();
    provisioner.wait_started("ComputeCreate").await;

    harness.tasks.cancel(&id).await.unwrap();
    assert_eq!(harness.tasks.status(&id).await.unwrap(), TaskStatus::Running);
    tokio::time::sleep(Duration::from_millis(100)).await;
    provisioner.open_gate();

    assert_eq!(harness.wait_finished(&id).await, TaskStatus::Canceled);
    assert_eq!(harness.step(&id, "ComputeCreate").await, Some(StepStatus::Done));
    assert_eq!(harness.step(&id, "AppInstall").await, Some(StepStatus::Canceled));
    assert_eq!(provisioner.started("dep1", "AppInstall"), 0);

    handle.stop().await;
}

/// Test: Session loss during execution
/// Given a running task whose processing lock session is invalidated
/// When the workflow finishes
/// Then the worker does not record a final status for work it no longer owns
#[tokio::test]
async fn test_session_loss_skips_final_status() {
    let harness = Harness::new();
    harness.install("dep1", &blocking_install_workflow()).await;
    let provisioner = TestProvisioner::new();
    let handle = harness.start("node-a", provisioner.clone());

    let id = harness
        .collector()
        .register_task("dep1", TaskType::Deploy)
        .await
        .unwrap();
    provisioner.wait_started("ComputeCreate").await;

    let lock_key = harness.keys.task_field(&id, PROCESSING_LOCK);
    assert!(harness.store.invalidate_lock_holder(&lock_key).unwrap());
    provisioner.open_gate();

    // The workflow itself still runs to completion.
    let deadline = tokio::time::Instant::now() + crate::fixtures::TIMEOUT;
    while provisioner.finished("dep1", "AppInstall") == 0 {
        assert!(tokio::time::Instant::now() < deadline, "workflow did not finish");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(harness.tasks.status(&id).await.unwrap(), TaskStatus::Running);

    handle.stop().await;
}

/// Test: Living task conflict
/// Given a target with an INITIAL task
/// When a second task is registered for it
/// Then registration fails with a distinguishable conflict
#[tokio::test]
async fn test_living_task_conflict() {
    let harness = Harness::new();
    let first = harness
        .collector()
        .register_task("dep1", TaskType::Deploy)
        .await
        .unwrap();

    let err = harness
        .collector()
        .register_task("dep1", TaskType::Undeploy)
        .await
        .unwrap_err();
    assert_eq!(err.living_task_id(), Some(first));
    assert_eq!(harness.tasks.tasks_for_target("dep1").await.unwrap(), vec![first]);
}
