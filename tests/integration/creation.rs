//! Task creation and store integrity tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use corvid::core::keys::{STATUS, TYPE};
use corvid::core::{TaskStatus, TaskType};
use corvid::Error;

use crate::fixtures::Harness;

/// Test: Creation atomicity
/// Given a collector registering many tasks
/// When a reader scans tasks concurrently
/// Then any task without a creation lock has targetId, status and type
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_readers_never_see_partial_tasks() {
    let harness = Arc::new(Harness::new());
    let done = Arc::new(AtomicBool::new(false));

    let reader = {
        let harness = Arc::clone(&harness);
        let done = Arc::clone(&done);
        tokio::spawn(async move {
            let mut checked = 0usize;
            while !done.load(Ordering::SeqCst) {
                for id in harness.tasks.task_ids().await.unwrap() {
                    if harness.tasks.is_being_created(&id).await.unwrap() {
                        continue;
                    }
                    harness.tasks.target(&id).await.unwrap();
                    harness.tasks.status(&id).await.unwrap();
                    harness.tasks.task_type(&id).await.unwrap();
                    checked += 1;
                }
                tokio::task::yield_now().await;
            }
            checked
        })
    };

    let collector = harness.collector();
    for i in 0..50 {
        collector
            .register_task(&format!("dep{i}"), TaskType::Deploy)
            .await
            .unwrap();
    }
    done.store(true, Ordering::SeqCst);
    reader.await.unwrap();

    assert_eq!(harness.tasks.task_ids().await.unwrap().len(), 50);
}

/// Test: Status round-trip
/// Given a registered task
/// When its status is set to RUNNING
/// Then reading it back yields RUNNING, and corrupt values yield typed errors
#[tokio::test]
async fn test_status_round_trip_and_corruption() {
    let harness = Harness::new();
    let id = harness
        .collector()
        .register_task("dep1", TaskType::ScaleIn)
        .await
        .unwrap();

    harness.tasks.set_status(&id, TaskStatus::Running).await.unwrap();
    assert_eq!(harness.tasks.status(&id).await.unwrap(), TaskStatus::Running);
    assert_eq!(harness.tasks.task_type(&id).await.unwrap(), TaskType::ScaleIn);
    assert_eq!(harness.tasks.target(&id).await.unwrap(), "dep1");
    assert!(harness.tasks.creation_date(&id).await.is_ok());

    let kv = harness.kv();
    kv.put(&harness.keys.task_field(&id, STATUS), b"42").await.unwrap();
    assert!(matches!(
        harness.tasks.status(&id).await,
        Err(Error::InvalidData { .. })
    ));
    kv.put(&harness.keys.task_field(&id, TYPE), b"deploy").await.unwrap();
    assert!(matches!(
        harness.tasks.task_type(&id).await,
        Err(Error::InvalidData { .. })
    ));
}

/// Test: Delete removes every task key
#[tokio::test]
async fn test_delete_task() {
    let harness = Harness::new();
    let id = harness
        .collector()
        .register_task_with_data("dep1", TaskType::Query, &[("query", "q")])
        .await
        .unwrap();
    assert!(harness.tasks.exists(&id).await.unwrap());

    harness.tasks.delete(&id).await.unwrap();
    assert!(!harness.tasks.exists(&id).await.unwrap());
    assert!(matches!(
        harness.tasks.status(&id).await,
        Err(Error::MissingKey { .. })
    ));
    assert!(harness.tasks.data(&id, "query").await.unwrap_err().is_not_found());
}
