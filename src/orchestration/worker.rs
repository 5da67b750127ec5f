//! Worker loop and task handlers.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use super::pool::Intake;
use super::task::Task;
use crate::core::keys::{CANCELED_FLAG, COMMAND_NAME, NODE_NAME, QUERY, WORKFLOW_NAME};
use crate::core::task::{DeploymentStatus, TaskHandler, TaskId, TaskStatus, TaskType};
use crate::error::{Error, Result};
use crate::log;
use crate::provision::OperationContext;
use crate::store::QueryOptions;
use crate::tasks::TaskStore;
use crate::workflow::{read_workflow, Activity, Workflow, WorkflowEngine};

pub(crate) struct Worker {
    id: usize,
    engine: WorkflowEngine,
    intake: mpsc::Sender<Intake>,
    cancel_poll_wait: Duration,
    shutdown: CancellationToken,
}

impl Worker {
    pub(crate) fn new(
        id: usize,
        engine: WorkflowEngine,
        intake: mpsc::Sender<Intake>,
        cancel_poll_wait: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            id,
            engine,
            intake,
            cancel_poll_wait,
            shutdown,
        }
    }

    fn tasks(&self) -> &TaskStore {
        self.engine.tasks()
    }

    /// Registers for work, runs what it is handed, repeats until shutdown.
    pub(crate) async fn run(self) {
        debug!(worker = self.id, "worker started");
        loop {
            let (tx, rx) = oneshot::channel();
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                res = self.intake.send(tx) => {
                    if res.is_err() {
                        break;
                    }
                }
            }
            let task = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                task = rx => match task {
                    Ok(task) => task,
                    // Registration dropped without a task.
                    Err(_) => continue,
                },
            };
            let span = log::task_span(&task.id, task.task_type, &task.target_id);
            self.execute(task).instrument(span).await;
        }
        debug!(worker = self.id, "worker stopped");
    }

    async fn execute(&self, task: Task) {
        info!(worker = self.id, "task started");
        if let Err(e) = task.set_status(TaskStatus::Running).await {
            error!(error = %e, "failed to mark task running");
            task.release().await;
            return;
        }

        let cancel = CancellationToken::new();
        let watcher = tokio::spawn(
            watch_cancel_flag(
                self.tasks().clone(),
                task.id,
                cancel.clone(),
                self.cancel_poll_wait,
            )
            .in_current_span(),
        );
        let res = self.handle(&task, &cancel).await;
        watcher.abort();

        if !task.has_leadership() {
            warn!("processing lock lost during execution, final status not recorded");
            task.release().await;
            return;
        }
        let status = match &res {
            Ok(()) => {
                info!("task done");
                TaskStatus::Done
            }
            Err(Error::Canceled) => {
                info!("task canceled");
                TaskStatus::Canceled
            }
            Err(e) => {
                error!(error = %e, "task failed");
                TaskStatus::Failed
            }
        };
        if let Err(e) = task.set_status(status).await {
            error!(%status, error = %e, "failed to record final task status");
        }
        task.release().await;
    }

    async fn handle(&self, task: &Task, cancel: &CancellationToken) -> Result<()> {
        match task.task_type.handler() {
            TaskHandler::Workflow { name, scoped } => {
                self.deployment_workflow(task, name, scoped, cancel).await
            }
            TaskHandler::CustomWorkflow => {
                let name = self.tasks().data(&task.id, WORKFLOW_NAME).await?;
                let workflow = self.load_workflow(task, &name).await?;
                self.engine
                    .run(&task.id, &task.target_id, &workflow, cancel.clone())
                    .await
            }
            TaskHandler::CustomCommand => self.custom_command(task, cancel).await,
            TaskHandler::Purge => self.purge(task).await,
            TaskHandler::Query => self.query(task).await,
        }
    }

    async fn deployment_workflow(
        &self,
        task: &Task,
        name: &str,
        scoped: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let [in_progress, done, failed] = deployment_statuses(task.task_type);
        self.set_deployment_status(&task.target_id, in_progress)
            .await?;

        let res = async {
            let mut workflow = self.load_workflow(task, name).await?;
            if scoped {
                let nodes = self.tasks().related_nodes(&task.id).await?;
                debug!(nodes = ?nodes, "restricting workflow to related nodes");
                workflow = workflow.restrict_to_nodes(&nodes);
            }
            self.engine
                .run(&task.id, &task.target_id, &workflow, cancel.clone())
                .await
        }
        .await;

        let last = if res.is_ok() { done } else { failed };
        let recorded = self.set_deployment_status(&task.target_id, last).await;
        res.and(recorded)
    }

    async fn custom_command(&self, task: &Task, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(Error::Canceled);
        }
        let node = self.tasks().data(&task.id, NODE_NAME).await?;
        let command = self.tasks().data(&task.id, COMMAND_NAME).await?;
        let instances = self
            .tasks()
            .instances(
                &task.id,
                &task.target_id,
                &node,
                self.engine.topology().as_ref(),
            )
            .await?;
        let ctx = OperationContext {
            task_id: task.id,
            deployment_id: task.target_id.clone(),
            node,
            step: command.clone(),
            instances,
            cancel: cancel.clone(),
        };
        self.engine
            .call(&ctx, &Activity::CallOperation(command))
            .await
    }

    async fn purge(&self, task: &Task) -> Result<()> {
        let keys = self.tasks().keys();
        let kv = self.tasks().kv();
        kv.delete_tree(&format!("{}/", keys.deployment(&task.target_id)))
            .await?;
        kv.delete_tree(&format!("{}/", keys.events(&task.target_id)))
            .await?;
        info!(deployment = %task.target_id, "deployment purged");
        Ok(())
    }

    async fn query(&self, task: &Task) -> Result<()> {
        let query = match self.tasks().data(&task.id, QUERY).await {
            Ok(query) => query,
            Err(e) if e.is_not_found() => task.target_id.clone(),
            Err(e) => return Err(e),
        };
        let result = self
            .engine
            .provisioner()
            .exec_query(&task.id, &task.target_id, &query)
            .await?;
        self.tasks().set_result_set(&task.id, &result).await
    }

    async fn load_workflow(&self, task: &Task, name: &str) -> Result<Workflow> {
        read_workflow(
            self.tasks().kv().as_ref(),
            self.tasks().keys(),
            &task.target_id,
            name,
        )
        .await
    }

    async fn set_deployment_status(
        &self,
        deployment_id: &str,
        status: DeploymentStatus,
    ) -> Result<()> {
        self.tasks()
            .set_deployment_status(deployment_id, status)
            .await?;
        if let Err(e) = self
            .engine
            .events()
            .deployment_status_change(deployment_id, &status.to_string())
            .await
        {
            warn!(%status, error = %e, "failed to publish deployment status");
        }
        Ok(())
    }
}

/// In-progress, success and failure statuses of a deployment workflow.
fn deployment_statuses(task_type: TaskType) -> [DeploymentStatus; 3] {
    match task_type {
        TaskType::Undeploy => [
            DeploymentStatus::UndeploymentInProgress,
            DeploymentStatus::Undeployed,
            DeploymentStatus::UndeploymentFailed,
        ],
        TaskType::ScaleOut | TaskType::ScaleIn => [
            DeploymentStatus::ScalingInProgress,
            DeploymentStatus::Scaled,
            DeploymentStatus::ScalingFailed,
        ],
        _ => [
            DeploymentStatus::DeploymentInProgress,
            DeploymentStatus::Deployed,
            DeploymentStatus::DeploymentFailed,
        ],
    }
}

/// Fires `cancel` once the task's cancellation flag is set.
async fn watch_cancel_flag(
    tasks: TaskStore,
    id: TaskId,
    cancel: CancellationToken,
    wait: Duration,
) {
    let key = tasks.keys().task_field(&id, CANCELED_FLAG);
    let mut index = 0;
    loop {
        let opts = QueryOptions::blocking(index, wait);
        match tasks.kv().get_blocking(&key, &opts).await {
            Ok((Some(kv), _)) if kv.value_str().trim().eq_ignore_ascii_case("true") => {
                info!("cancellation requested");
                cancel.cancel();
                return;
            }
            Ok((_, meta)) => index = meta.last_index,
            Err(e) => {
                warn!(error = %e, "failed to watch cancellation flag");
                tokio::time::sleep(wait).await;
            }
        }
    }
}
