//! Step state machine.
//!
//! ```text
//! INITIAL -> RUNNING -> DONE
//!                    -> ERROR
//!                    -> CANCELED
//! ```
//!
//! A step waits for every predecessor's outcome before acting. If any
//! predecessor did not reach DONE the step never starts: its persisted
//! status stays INITIAL and its successors see it as canceled.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tracing::{debug, error, warn};

use super::definition::{Activity, StepDefinition};
use super::engine::Execution;
use crate::core::task::StepStatus;
use crate::error::{Error, Result};
use crate::provision::OperationContext;

/// Runs one step and publishes its outcome to its successors.
pub(crate) async fn run(execution: Arc<Execution>, name: String) {
    let outcome = AssertUnwindSafe(execute(&execution, &name))
        .catch_unwind()
        .await
        .unwrap_or_else(|_| {
            error!(step = %name, "step body panicked");
            let _ = execution.errors.send(Error::provisioner(format!(
                "step {name:?} panicked"
            )));
            StepStatus::Error
        });
    if let Some(tx) = execution.outcomes.get(&name) {
        tx.send_replace(outcome);
    }
}

async fn execute(ex: &Execution, name: &str) -> StepStatus {
    let Some(def) = ex.workflow.step(name) else {
        return StepStatus::Error;
    };
    if let Err(e) = persist(ex, name, StepStatus::Initial).await {
        return fail(ex, def, e).await;
    }

    for pred in ex.workflow.predecessors(name) {
        let outcome = match ex.outcomes.get(pred) {
            Some(tx) => {
                let mut rx = tx.subscribe();
                rx.wait_for(|s| s.is_terminal())
                    .await
                    .map(|s| *s)
                    .unwrap_or(StepStatus::Canceled)
            }
            None => StepStatus::Canceled,
        };
        if outcome != StepStatus::Done {
            debug!(step = name, predecessor = pred, %outcome, "predecessor not done, step not started");
            return StepStatus::Canceled;
        }
    }

    if ex.cancel.is_cancelled() {
        return cancel(ex, name).await;
    }
    if let Err(e) = persist(ex, name, StepStatus::Running).await {
        return fail(ex, def, e).await;
    }

    let instances = if def.activities.is_empty() {
        Vec::new()
    } else {
        match ex
            .engine
            .tasks()
            .instances(&ex.task_id, &ex.deployment_id, &def.node, ex.engine.topology().as_ref())
            .await
        {
            Ok(instances) => instances,
            Err(e) => return fail(ex, def, e).await,
        }
    };
    let ctx = OperationContext {
        task_id: ex.task_id,
        deployment_id: ex.deployment_id.clone(),
        node: def.node.clone(),
        step: def.name.clone(),
        instances,
        cancel: ex.cancel.clone(),
    };

    for activity in &def.activities {
        if ex.cancel.is_cancelled() {
            return cancel(ex, name).await;
        }
        debug!(step = name, %activity, "running activity");
        let res = match activity {
            Activity::SetState(state) => set_state(ex, &ctx, state).await,
            _ => ex.engine.call(&ctx, activity).await,
        };
        match res {
            Ok(()) => {}
            Err(Error::Canceled) => return cancel(ex, name).await,
            Err(e) => return fail(ex, def, e).await,
        }
    }

    if let Err(e) = persist(ex, name, StepStatus::Done).await {
        return fail(ex, def, e).await;
    }
    debug!(step = name, "step done");
    StepStatus::Done
}

async fn persist(ex: &Execution, name: &str, status: StepStatus) -> Result<()> {
    ex.engine
        .tasks()
        .set_step_status(&ex.task_id, name, status)
        .await
}

async fn set_state(ex: &Execution, ctx: &OperationContext, state: &str) -> Result<()> {
    for instance in &ctx.instances {
        ex.engine
            .topology()
            .set_instance_state(&ctx.deployment_id, &ctx.node, instance, state)
            .await?;
        if let Err(e) = ex
            .engine
            .events()
            .instance_status_change(&ctx.deployment_id, &ctx.node, instance, state)
            .await
        {
            warn!(node = %ctx.node, instance = %instance, error = %e, "failed to publish instance status");
        }
    }
    Ok(())
}

async fn cancel(ex: &Execution, name: &str) -> StepStatus {
    debug!(step = name, "step canceled");
    if let Err(e) = persist(ex, name, StepStatus::Canceled).await {
        warn!(step = name, error = %e, "failed to record canceled step");
    }
    StepStatus::Canceled
}

async fn fail(ex: &Execution, def: &StepDefinition, err: Error) -> StepStatus {
    error!(step = %def.name, node = %def.node, error = %err, "step failed");
    if let Err(e) = persist(ex, &def.name, StepStatus::Error).await {
        warn!(step = %def.name, error = %e, "failed to record step error");
    }
    let _ = ex.errors.send(Error::Step {
        task_id: ex.task_id,
        step: def.name.clone(),
        node: def.node.clone(),
        source: Box::new(err),
    });
    StepStatus::Error
}
