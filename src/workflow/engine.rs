//! Workflow execution.
//!
//! Every root step is started, and starting a step immediately attempts to
//! start each successor. An in-memory set scoped to the execution makes
//! that idempotent, so a step reachable through several paths runs once.
//! Predecessor gating happens inside the step body (see [`super::step`]).
//! Step failures go to an error channel drained after every spawned step
//! has joined.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::definition::{Activity, Workflow};
use super::step;
use crate::core::task::{StepStatus, TaskId};
use crate::error::{Error, Result};
use crate::events::EventPublisher;
use crate::provision::{OperationContext, Provisioner, Topology};
use crate::tasks::TaskStore;

/// Runs workflows on behalf of workers.
#[derive(Clone)]
pub struct WorkflowEngine {
    tasks: TaskStore,
    provisioner: Arc<dyn Provisioner>,
    topology: Arc<dyn Topology>,
    events: Arc<dyn EventPublisher>,
    retries: u32,
    retry_delay: Duration,
}

/// State shared by every step of one workflow execution.
pub(crate) struct Execution {
    pub(crate) engine: WorkflowEngine,
    pub(crate) task_id: TaskId,
    pub(crate) deployment_id: String,
    pub(crate) workflow: Workflow,
    /// Final outcome of each step, observed by its successors.
    pub(crate) outcomes: HashMap<String, watch::Sender<StepStatus>>,
    pub(crate) errors: mpsc::UnboundedSender<Error>,
    pub(crate) cancel: CancellationToken,
}

impl WorkflowEngine {
    pub fn new(
        tasks: TaskStore,
        provisioner: Arc<dyn Provisioner>,
        topology: Arc<dyn Topology>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            tasks,
            provisioner,
            topology,
            events,
            retries: 0,
            retry_delay: Duration::from_secs(1),
        }
    }

    /// Extra attempts for provisioner errors flagged retriable.
    pub fn with_retries(mut self, retries: u32, delay: Duration) -> Self {
        self.retries = retries;
        self.retry_delay = delay;
        self
    }

    pub fn tasks(&self) -> &TaskStore {
        &self.tasks
    }

    pub fn provisioner(&self) -> &Arc<dyn Provisioner> {
        &self.provisioner
    }

    pub fn topology(&self) -> &Arc<dyn Topology> {
        &self.topology
    }

    pub fn events(&self) -> &Arc<dyn EventPublisher> {
        &self.events
    }

    /// Drives `workflow` to completion for `task_id`.
    ///
    /// Returns the first step error, or [`Error::Canceled`] if `cancel`
    /// fired before every step reached DONE. Sibling branches are never interrupted by a
    /// failure; only the failing branch stops.
    #[instrument(skip_all, fields(task = %task_id.short(), workflow = workflow.name()))]
    pub async fn run(
        &self,
        task_id: &TaskId,
        deployment_id: &str,
        workflow: &Workflow,
        cancel: CancellationToken,
    ) -> Result<()> {
        let (errors, mut error_rx) = mpsc::unbounded_channel();
        let outcomes = workflow
            .steps()
            .iter()
            .map(|s| (s.name.clone(), watch::channel(StepStatus::Initial).0))
            .collect();
        let execution = Arc::new(Execution {
            engine: self.clone(),
            task_id: *task_id,
            deployment_id: deployment_id.to_string(),
            workflow: workflow.clone(),
            outcomes,
            errors,
            cancel: cancel.clone(),
        });

        let mut running = HashSet::new();
        let mut joins = JoinSet::new();
        for root in workflow.roots() {
            start_step(&execution, &root.name, &mut running, &mut joins);
        }
        while joins.join_next().await.is_some() {}
        debug!(steps = running.len(), "all steps done, checking for errors");

        let mut first = None;
        while let Ok(err) = error_rx.try_recv() {
            if first.is_none() {
                first = Some(err);
            } else {
                debug!(error = %err, "additional step error");
            }
        }

        let completed = execution
            .outcomes
            .values()
            .all(|tx| *tx.borrow() == StepStatus::Done);
        if cancel.is_cancelled() && !completed {
            info!("workflow canceled");
            return Err(Error::Canceled);
        }
        match first {
            Some(err) => {
                warn!(error = %err, "workflow ended with error");
                Err(err)
            }
            None => {
                info!("workflow done");
                Ok(())
            }
        }
    }

    /// Runs one provisioner activity, retrying errors flagged retriable.
    pub async fn call(&self, ctx: &OperationContext, activity: &Activity) -> Result<()> {
        let mut attempt = 0;
        loop {
            let res = match activity {
                Activity::Delegate(op) => self.provisioner.exec_delegate(ctx, op).await,
                Activity::CallOperation(op) => self.provisioner.exec_operation(ctx, op).await,
                Activity::SetState(_) => return Ok(()),
            };
            match res {
                Err(e) if e.is_retriable() && attempt < self.retries => {
                    attempt += 1;
                    warn!(
                        step = %ctx.step,
                        attempt,
                        max = self.retries,
                        error = %e,
                        "retriable error, retrying {}", activity
                    );
                    tokio::select! {
                        _ = ctx.cancel.cancelled() => return Err(Error::Canceled),
                        _ = tokio::time::sleep(self.retry_delay) => {}
                    }
                }
                other => return other,
            }
        }
    }
}

/// Starts `name` unless this execution already started it, then tries
/// every successor. Does not wait for the step.
fn start_step(
    execution: &Arc<Execution>,
    name: &str,
    running: &mut HashSet<String>,
    joins: &mut JoinSet<()>,
) {
    if !running.insert(name.to_string()) {
        debug!(step = name, "step already running");
        return;
    }
    debug!(step = name, "running step");
    joins.spawn(step::run(Arc::clone(execution), name.to_string()));

    let next = execution
        .workflow
        .step(name)
        .map(|s| s.next.clone())
        .unwrap_or_default();
    for successor in &next {
        start_step(execution, successor, running, joins);
    }
}
