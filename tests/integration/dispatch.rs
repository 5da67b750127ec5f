//! Dispatcher integration tests.
//!
//! These tests verify that tasks are claimed through the processing lock,
//! that racing instances never run a task twice, and that a saturated
//! worker pool hands tasks back instead of stalling the polling loop.

use std::time::Duration;

use corvid::core::keys::PROCESSING_LOCK;
use corvid::core::{TaskStatus, TaskType};
use corvid::store::{Lock, LockOptions};

use crate::fixtures::{install_workflow, blocking_install_workflow, Harness, TestProvisioner};

/// Test: At-most-once processing across instances
/// Given three orchestrators sharing one store
/// When ten deploy tasks are registered
/// Then every task completes and each step ran exactly once
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_instances_process_each_task_once() {
    let harness = Harness::new();
    let provisioner = TestProvisioner::with_delay(Duration::from_millis(5));
    let handles: Vec<_> = ["node-a", "node-b", "node-c"]
        .iter()
        .map(|node| harness.start(node, provisioner.clone()))
        .collect();

    let mut ids = Vec::new();
    for i in 0..10 {
        let deployment = format!("dep{i}");
        harness.install(&deployment, &install_workflow()).await;
        let id = harness
            .collector()
            .register_task(&deployment, TaskType::Deploy)
            .await
            .unwrap();
        ids.push((deployment, id));
    }

    for (deployment, id) in &ids {
        assert_eq!(harness.wait_finished(id).await, TaskStatus::Done);
        assert_eq!(provisioner.started(deployment, "ComputeCreate"), 1);
        assert_eq!(provisioner.started(deployment, "AppInstall"), 1);
    }

    for handle in handles {
        handle.stop().await;
    }
}

/// Test: A held processing lock blocks every competitor
/// Given a processing lock held outside any orchestrator
/// When competing acquisitions and a dispatcher race for it
/// Then all attempts time out and the task stays INITIAL until release
#[tokio::test]
async fn test_pre_held_processing_lock() {
    let harness = Harness::new();
    harness.install("dep1", &install_workflow()).await;
    let id = harness
        .collector()
        .register_task("dep1", TaskType::Deploy)
        .await
        .unwrap();

    let key = harness.keys.task_field(&id, PROCESSING_LOCK);
    let held = Lock::acquire(
        harness.kv(),
        LockOptions::try_once(key.clone(), "outsider", Duration::from_millis(10)),
    )
    .await
    .unwrap()
    .expect("lock should be free");

    let mut attempts = tokio::task::JoinSet::new();
    for i in 0..5 {
        let kv = harness.kv();
        let key = key.clone();
        attempts.spawn(async move {
            Lock::acquire(
                kv,
                LockOptions::try_once(key, format!("competitor-{i}"), Duration::from_millis(50)),
            )
            .await
        });
    }
    while let Some(res) = attempts.join_next().await {
        assert!(res.unwrap().unwrap().is_none());
    }

    let provisioner = TestProvisioner::new();
    let handle = harness.start("node-a", provisioner.clone());
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(harness.tasks.status(&id).await.unwrap(), TaskStatus::Initial);
    assert!(provisioner.calls().is_empty());

    held.release().await.unwrap();
    assert_eq!(harness.wait_finished(&id).await, TaskStatus::Done);

    handle.stop().await;
}

/// Test: Handoff timeout with a saturated pool
/// Given a single worker blocked on a running task
/// When a second task is registered
/// Then it stays INITIAL with its processing lock released, and runs once the worker frees up
#[tokio::test]
async fn test_handoff_timeout_releases_task() {
    let harness = Harness::new();
    harness.install("dep1", &blocking_install_workflow()).await;
    harness.install("dep2", &install_workflow()).await;
    let provisioner = TestProvisioner::new();
    let mut config = crate::fixtures::fast_config("node-a");
    config.workers_number = 1;
    let handle = harness
        .orchestrator(config, provisioner.clone())
        .start()
        .unwrap();

    let first = harness
        .collector()
        .register_task("dep1", TaskType::Deploy)
        .await
        .unwrap();
    provisioner.wait_started("ComputeCreate").await;

    let second = harness
        .collector()
        .register_task("dep2", TaskType::Deploy)
        .await
        .unwrap();
    // Longer than one handoff timeout plus backoff.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(harness.tasks.status(&second).await.unwrap(), TaskStatus::Initial);
    assert_eq!(provisioner.started("dep2", "ComputeCreate"), 0);

    provisioner.open_gate();
    assert_eq!(harness.wait_finished(&first).await, TaskStatus::Done);
    assert_eq!(harness.wait_finished(&second).await, TaskStatus::Done);
    assert_eq!(provisioner.started("dep2", "ComputeCreate"), 1);

    handle.stop().await;
}

/// Test: Shutdown stops an idle instance
/// Given a running orchestrator with no tasks
/// When it is stopped
/// Then the dispatcher and workers exit promptly
#[tokio::test]
async fn test_shutdown_idle_instance() {
    let harness = Harness::new();
    let handle = harness.start("node-a", TestProvisioner::new());
    tokio::time::sleep(Duration::from_millis(50)).await;

    tokio::time::timeout(Duration::from_secs(2), handle.stop())
        .await
        .expect("orchestrator did not stop");
}

/// Test: Invalid configuration is rejected at start
#[tokio::test]
async fn test_start_rejects_zero_workers() {
    let harness = Harness::new();
    let mut config = crate::fixtures::fast_config("node-a");
    config.workers_number = 0;

    let res = harness.orchestrator(config, TestProvisioner::new()).start();
    assert!(matches!(res, Err(corvid::Error::Validation(_))));
}
