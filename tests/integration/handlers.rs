//! Task type handler tests.
//!
//! Each test registers one task of a non-deploy type and checks what the
//! worker did with it.

use corvid::core::keys::{COMMAND_NAME, NODE_NAME, QUERY, WORKFLOW_NAME};
use corvid::core::{StepStatus, TaskStatus, TaskType};
use corvid::events::{EventKind, EventPublisher};
use corvid::workflow::{StepDefinition, WorkflowBuilder};

use crate::fixtures::{diamond_workflow, install_workflow, Harness, TestProvisioner};

/// Test: Custom workflow
/// Given a deployment with a "maintenance" workflow
/// When a CustomWorkflow task names it
/// Then that workflow runs and workflow events are published
#[tokio::test]
async fn test_custom_workflow() {
    let harness = Harness::new();
    harness.install("dep1", &diamond_workflow("maintenance")).await;
    let provisioner = TestProvisioner::new();
    let handle = harness.start("node-a", provisioner.clone());

    let id = harness
        .collector()
        .register_task_with_data(
            "dep1",
            TaskType::CustomWorkflow,
            &[(WORKFLOW_NAME, "maintenance")],
        )
        .await
        .unwrap();
    assert_eq!(harness.wait_finished(&id).await, TaskStatus::Done);
    assert_eq!(harness.step(&id, "D").await, Some(StepStatus::Done));

    let events = harness.events().status_events("dep1").await.unwrap();
    let workflow_events: Vec<_> = events
        .iter()
        .filter(|e| e.kind == EventKind::WorkflowStatusChange)
        .map(|e| e.status.as_str())
        .collect();
    assert_eq!(workflow_events, vec!["running", "done"]);
    assert!(events
        .iter()
        .all(|e| e.kind != EventKind::DeploymentStatusChange));

    handle.stop().await;
}

/// Test: Custom workflow with an unknown name fails the task
#[tokio::test]
async fn test_custom_workflow_unknown_name() {
    let harness = Harness::new();
    let handle = harness.start("node-a", TestProvisioner::new());

    let id = harness
        .collector()
        .register_task_with_data("dep1", TaskType::CustomWorkflow, &[(WORKFLOW_NAME, "nope")])
        .await
        .unwrap();
    assert_eq!(harness.wait_finished(&id).await, TaskStatus::Failed);

    handle.stop().await;
}

/// Test: Custom command
/// Given a node with two instances
/// When a CustomCommand task targets it
/// Then one operation call covers both instances
#[tokio::test]
async fn test_custom_command() {
    let harness = Harness::new();
    harness
        .topology()
        .add_instances("dep1", "Compute", &["0", "1"])
        .await
        .unwrap();
    let provisioner = TestProvisioner::new();
    let handle = harness.start("node-a", provisioner.clone());

    let id = harness
        .collector()
        .register_task_with_data(
            "dep1",
            TaskType::CustomCommand,
            &[(NODE_NAME, "Compute"), (COMMAND_NAME, "restart")],
        )
        .await
        .unwrap();
    assert_eq!(harness.wait_finished(&id).await, TaskStatus::Done);

    let calls = provisioner.calls();
    let finished: Vec<_> = calls.iter().filter(|c| c.finished).collect();
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].operation, "restart");
    assert_eq!(finished[0].instances, vec!["0", "1"]);

    let events = harness.events().status_events("dep1").await.unwrap();
    assert!(events
        .iter()
        .any(|e| e.kind == EventKind::CustomCommandStatusChange && e.status == "done"));

    handle.stop().await;
}

/// Test: Custom command without a node name fails the task
#[tokio::test]
async fn test_custom_command_missing_data() {
    let harness = Harness::new();
    let provisioner = TestProvisioner::new();
    let handle = harness.start("node-a", provisioner.clone());

    let id = harness
        .collector()
        .register_task_with_data("dep1", TaskType::CustomCommand, &[(COMMAND_NAME, "restart")])
        .await
        .unwrap();
    assert_eq!(harness.wait_finished(&id).await, TaskStatus::Failed);
    assert!(provisioner.calls().is_empty());

    handle.stop().await;
}

/// Test: Scale out restricted to related nodes
/// Given an install workflow over Compute and App
/// When a ScaleOut task is related to App instance 1 only
/// Then only the App step calls the provisioner, with that instance
#[tokio::test]
async fn test_scale_out_restricted_to_related_nodes() {
    let harness = Harness::new();
    harness.install("dep1", &install_workflow()).await;
    harness
        .topology()
        .add_instances("dep1", "App", &["0", "1"])
        .await
        .unwrap();
    let provisioner = TestProvisioner::new();
    let handle = harness.start("node-a", provisioner.clone());

    let id = harness
        .collector()
        .register_task_with_data("dep1", TaskType::ScaleOut, &[("nodes/App", "1")])
        .await
        .unwrap();
    assert_eq!(harness.wait_finished(&id).await, TaskStatus::Done);

    assert_eq!(provisioner.started("dep1", "ComputeCreate"), 0);
    let app: Vec<_> = provisioner
        .calls()
        .into_iter()
        .filter(|c| c.step == "AppInstall" && c.finished)
        .collect();
    assert_eq!(app.len(), 1);
    assert_eq!(app[0].instances, vec!["1"]);
    assert_eq!(harness.step(&id, "ComputeCreate").await, Some(StepStatus::Done));
    assert_eq!(
        harness.tasks.deployment_status("dep1").await.unwrap().as_deref(),
        Some("scaled")
    );

    let events = harness.events().status_events("dep1").await.unwrap();
    assert!(events
        .iter()
        .any(|e| e.kind == EventKind::ScalingStatusChange && e.status == "done"));

    handle.stop().await;
}

/// Test: Set-state activities update instances
/// Given a workflow step setting Compute instances to "started"
/// When a Deploy task runs it
/// Then every instance state is updated and an instance event is published
#[tokio::test]
async fn test_set_state_activity() {
    let harness = Harness::new();
    let workflow = WorkflowBuilder::new("install")
        .step(StepDefinition::new("Start", "Compute").set_state("started"))
        .build()
        .unwrap();
    harness.install("dep1", &workflow).await;
    let topology = harness.topology();
    topology.add_instances("dep1", "Compute", &["0", "1"]).await.unwrap();
    let handle = harness.start("node-a", TestProvisioner::new());

    let id = harness
        .collector()
        .register_task("dep1", TaskType::Deploy)
        .await
        .unwrap();
    assert_eq!(harness.wait_finished(&id).await, TaskStatus::Done);

    for instance in ["0", "1"] {
        assert_eq!(
            topology.instance_state("dep1", "Compute", instance).await.unwrap().as_deref(),
            Some("started")
        );
    }
    let events = harness.events().status_events("dep1").await.unwrap();
    assert_eq!(
        events
            .iter()
            .filter(|e| e.kind == EventKind::InstanceStatusChange)
            .count(),
        2
    );

    handle.stop().await;
}

/// Test: Query
/// Given a Query task with query data
/// When it runs
/// Then the provisioner answer is stored as the result set
#[tokio::test]
async fn test_query_result_set() {
    let harness = Harness::new();
    let handle = harness.start("node-a", TestProvisioner::new());

    let id = harness
        .collector()
        .register_task_with_data("infra", TaskType::Query, &[(QUERY, "hosts_pool")])
        .await
        .unwrap();
    assert_eq!(harness.wait_finished(&id).await, TaskStatus::Done);
    assert_eq!(
        harness.tasks.result_set(&id).await.unwrap().as_deref(),
        Some("infra:hosts_pool")
    );

    handle.stop().await;
}

/// Test: Purge
/// Given a deployment with a status, a workflow and events
/// When a Purge task runs
/// Then the deployment tree and its events are gone
#[tokio::test]
async fn test_purge_deployment() {
    let harness = Harness::new();
    harness.install("dep1", &install_workflow()).await;
    harness
        .events()
        .deployment_status_change("dep1", "deployed")
        .await
        .unwrap();
    harness
        .tasks
        .set_deployment_status("dep1", corvid::core::DeploymentStatus::Deployed)
        .await
        .unwrap();
    let handle = harness.start("node-a", TestProvisioner::new());

    let id = harness
        .collector()
        .register_task("dep1", TaskType::Purge)
        .await
        .unwrap();
    assert_eq!(harness.wait_finished(&id).await, TaskStatus::Done);

    assert!(harness.tasks.deployment_status("dep1").await.unwrap().is_none());
    assert!(harness.events().status_events("dep1").await.unwrap().is_empty());
    let deployment = format!("{}/", harness.keys.deployment("dep1"));
    assert!(harness.kv().list(&deployment).await.unwrap().is_empty());

    handle.stop().await;
}
