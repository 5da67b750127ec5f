//! Orchestration layer: dispatcher, worker pool and their wiring.
//!
//! An [`Orchestrator`] is one instance of the engine. Any number of
//! instances, in one process or many, may share a coordination store; the
//! per-task processing lock guarantees a task runs on at most one of them.

mod dispatcher;
mod pool;
mod task;
mod worker;

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::Config;
use crate::core::keys::Keys;
use crate::error::Result;
use crate::events::{EventPublisher, StoreEventPublisher};
use crate::provision::{Provisioner, StoreTopology, Topology};
use crate::store::KvStore;
use crate::tasks::{Collector, TaskStore};
use crate::workflow::WorkflowEngine;

pub use dispatcher::Dispatcher;
pub use pool::{Intake, WorkerPool};
pub use task::Task;

/// Builder for one orchestrator instance.
pub struct Orchestrator {
    config: Config,
    store: Arc<dyn KvStore>,
    provisioner: Arc<dyn Provisioner>,
    topology: Option<Arc<dyn Topology>>,
    events: Option<Arc<dyn EventPublisher>>,
}

impl Orchestrator {
    pub fn new(config: Config, store: Arc<dyn KvStore>, provisioner: Arc<dyn Provisioner>) -> Self {
        Self {
            config,
            store,
            provisioner,
            topology: None,
            events: None,
        }
    }

    /// Defaults to [`StoreTopology`] over the same store.
    pub fn with_topology(mut self, topology: Arc<dyn Topology>) -> Self {
        self.topology = Some(topology);
        self
    }

    /// Defaults to [`StoreEventPublisher`] over the same store.
    pub fn with_events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn keys(&self) -> Keys {
        Keys::new(&self.config.kv_prefix)
    }

    pub fn task_store(&self) -> TaskStore {
        TaskStore::new(Arc::clone(&self.store), self.keys())
    }

    /// Collector whose creation locks carry this instance's node name.
    pub fn collector(&self) -> Collector {
        Collector::new(self.task_store()).with_node_name(self.config.node_name.clone())
    }

    /// Validates the configuration, spawns the worker pool and the dispatcher.
    pub fn start(self) -> Result<OrchestratorHandle> {
        self.config.validate()?;
        let keys = self.keys();
        let tasks = self.task_store();
        let topology = self.topology.unwrap_or_else(|| {
            Arc::new(StoreTopology::new(Arc::clone(&self.store), keys.clone()))
        });
        let events = self.events.unwrap_or_else(|| {
            Arc::new(StoreEventPublisher::new(Arc::clone(&self.store), keys))
        });
        let engine = WorkflowEngine::new(
            tasks.clone(),
            self.provisioner,
            topology,
            Arc::clone(&events),
        )
        .with_retries(
            self.config.operation_retries,
            self.config.operation_retry_delay,
        );

        let shutdown = CancellationToken::new();
        let pool = WorkerPool::start(
            self.config.workers_number,
            engine,
            self.config.long_poll_wait,
            shutdown.clone(),
        );
        info!(
            node = %self.config.node_name,
            prefix = %self.config.kv_prefix,
            "orchestrator starting"
        );
        let dispatcher = Dispatcher::new(tasks, events, self.config, pool, shutdown.clone());
        let join = tokio::spawn(dispatcher.run());
        Ok(OrchestratorHandle { shutdown, join })
    }
}

/// Running orchestrator instance.
pub struct OrchestratorHandle {
    shutdown: CancellationToken,
    join: JoinHandle<()>,
}

impl OrchestratorHandle {
    /// Asks the dispatcher and idle workers to stop. Running tasks finish.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Waits for the dispatcher and every worker to exit.
    pub async fn join(self) {
        if let Err(e) = self.join.await {
            error!(error = %e, "dispatcher panicked");
        }
    }

    /// Shuts down and waits.
    pub async fn stop(self) {
        self.shutdown();
        self.join().await;
    }
}
