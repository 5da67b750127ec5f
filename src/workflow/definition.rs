//! Workflow definitions: steps, their activities and the step graph.
//!
//! A workflow is a directed acyclic graph of steps. The graph is validated
//! when the workflow is built, so the engine's recursive fan-out can never
//! loop.

use std::collections::{BTreeMap, HashMap, HashSet};

use petgraph::algo::is_cyclic_directed;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::{Deserialize, Serialize};

use crate::core::keys::Keys;
use crate::error::{Error, Result};
use crate::store::KvStore;

/// One action performed by a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activity {
    /// Hand a whole lifecycle operation (e.g. `install`) to the provisioner.
    Delegate(String),
    /// Run a single interface operation (e.g. `standard.create`).
    CallOperation(String),
    /// Record a new state on every instance of the step's node.
    SetState(String),
}

impl Activity {
    /// Name used in the stored workflow layout.
    pub fn kind(&self) -> &'static str {
        match self {
            Activity::Delegate(_) => "delegate",
            Activity::CallOperation(_) => "call-operation",
            Activity::SetState(_) => "set-state",
        }
    }

    pub fn value(&self) -> &str {
        match self {
            Activity::Delegate(v) | Activity::CallOperation(v) | Activity::SetState(v) => v,
        }
    }

    fn from_stored(key: &str, kind: &str, value: String) -> Result<Self> {
        match kind {
            "delegate" => Ok(Activity::Delegate(value)),
            "call-operation" => Ok(Activity::CallOperation(value)),
            "set-state" => Ok(Activity::SetState(value)),
            _ => Err(Error::invalid(key, kind, "unknown activity kind")),
        }
    }
}

impl std::fmt::Display for Activity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.kind(), self.value())
    }
}

/// Static definition of a workflow step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepDefinition {
    pub name: String,
    /// Topology node the step acts on.
    pub node: String,
    pub activities: Vec<Activity>,
    /// Successor step names.
    pub next: Vec<String>,
}

impl StepDefinition {
    pub fn new(name: impl Into<String>, node: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            node: node.into(),
            activities: Vec::new(),
            next: Vec::new(),
        }
    }

    pub fn delegate(mut self, operation: impl Into<String>) -> Self {
        self.activities.push(Activity::Delegate(operation.into()));
        self
    }

    pub fn call_operation(mut self, operation: impl Into<String>) -> Self {
        self.activities.push(Activity::CallOperation(operation.into()));
        self
    }

    pub fn set_state(mut self, state: impl Into<String>) -> Self {
        self.activities.push(Activity::SetState(state.into()));
        self
    }

    pub fn then(mut self, next: impl Into<String>) -> Self {
        self.next.push(next.into());
        self
    }
}

/// A validated step graph.
#[derive(Debug, Clone)]
pub struct Workflow {
    name: String,
    steps: Vec<StepDefinition>,
    graph: DiGraph<usize, ()>,
    index: HashMap<String, NodeIndex>,
}

impl Workflow {
    /// Builds a workflow, rejecting duplicate steps, dangling `next`
    /// references and cycles.
    pub fn new(name: impl Into<String>, steps: Vec<StepDefinition>) -> Result<Self> {
        let name = name.into();
        let mut graph = DiGraph::new();
        let mut index = HashMap::new();

        for (i, step) in steps.iter().enumerate() {
            if index.insert(step.name.clone(), graph.add_node(i)).is_some() {
                return Err(Error::Validation(format!(
                    "workflow {name:?} defines step {:?} twice",
                    step.name
                )));
            }
        }
        for step in &steps {
            let from = index[&step.name];
            for next in &step.next {
                let to = index.get(next).ok_or_else(|| {
                    Error::Validation(format!(
                        "step {:?} of workflow {name:?} references unknown step {next:?}",
                        step.name
                    ))
                })?;
                graph.update_edge(from, *to, ());
            }
        }
        if is_cyclic_directed(&graph) {
            return Err(Error::Validation(format!("workflow {name:?} contains a cycle")));
        }

        Ok(Self {
            name,
            steps,
            graph,
            index,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Steps in definition order.
    pub fn steps(&self) -> &[StepDefinition] {
        &self.steps
    }

    pub fn step(&self, name: &str) -> Option<&StepDefinition> {
        self.index.get(name).map(|i| &self.steps[self.graph[*i]])
    }

    /// Steps without predecessors, in definition order.
    pub fn roots(&self) -> Vec<&StepDefinition> {
        self.steps
            .iter()
            .filter(|s| {
                self.graph
                    .neighbors_directed(self.index[&s.name], Direction::Incoming)
                    .next()
                    .is_none()
            })
            .collect()
    }

    /// Names of the direct predecessors of `name`.
    pub fn predecessors(&self, name: &str) -> Vec<&str> {
        let Some(&i) = self.index.get(name) else {
            return Vec::new();
        };
        let mut preds: Vec<usize> = self
            .graph
            .neighbors_directed(i, Direction::Incoming)
            .map(|n| self.graph[n])
            .collect();
        preds.sort_unstable();
        preds.into_iter().map(|p| self.steps[p].name.as_str()).collect()
    }

    /// Copy of this workflow where steps on nodes outside `nodes` keep their
    /// place in the graph but carry no activities.
    pub fn restrict_to_nodes(&self, nodes: &[String]) -> Workflow {
        let keep: HashSet<&str> = nodes.iter().map(String::as_str).collect();
        let mut restricted = self.clone();
        for step in &mut restricted.steps {
            if !keep.contains(step.node.as_str()) {
                step.activities.clear();
            }
        }
        restricted
    }
}

/// Programmatic workflow construction.
///
/// ```ignore
/// let wf = WorkflowBuilder::new("install")
///     .step(StepDefinition::new("ComputeCreate", "Compute").delegate("install").then("AppInstall"))
///     .step(StepDefinition::new("AppInstall", "App").call_operation("standard.start"))
///     .build()?;
/// ```
#[derive(Debug, Default)]
pub struct WorkflowBuilder {
    name: String,
    steps: Vec<StepDefinition>,
}

impl WorkflowBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
        }
    }

    pub fn step(mut self, step: StepDefinition) -> Self {
        self.steps.push(step);
        self
    }

    /// Adds an edge between two steps already added.
    pub fn edge(mut self, from: &str, to: &str) -> Self {
        if let Some(step) = self.steps.iter_mut().find(|s| s.name == from) {
            step.next.push(to.to_string());
        }
        self
    }

    pub fn build(self) -> Result<Workflow> {
        Workflow::new(self.name, self.steps)
    }
}

/// Loads a workflow stored under
/// `<prefix>/deployments/<id>/workflows/<name>/steps/<step>/...`.
pub async fn read_workflow(
    store: &dyn KvStore,
    keys: &Keys,
    deployment_id: &str,
    name: &str,
) -> Result<Workflow> {
    let prefix = format!("{}/steps/", keys.workflow_definition(deployment_id, name));
    let pairs = store.list(&prefix).await?;
    if pairs.is_empty() {
        return Err(Error::WorkflowNotFound {
            deployment_id: deployment_id.to_string(),
            name: name.to_string(),
        });
    }

    #[derive(Default)]
    struct Partial {
        node: Option<String>,
        activities: BTreeMap<u32, Activity>,
        next: Vec<String>,
    }

    let mut partials: BTreeMap<String, Partial> = BTreeMap::new();
    for kv in &pairs {
        let rest = &kv.key[prefix.len()..];
        let parts: Vec<&str> = rest.split('/').collect();
        let partial = partials.entry(parts[0].to_string()).or_default();
        match parts.as_slice() {
            [_, "node"] => partial.node = Some(kv.value_str()),
            [_, "activities", n, kind] => {
                let pos: u32 = n
                    .parse()
                    .map_err(|_| Error::invalid(&kv.key, *n, "activity index is not an integer"))?;
                let activity = Activity::from_stored(&kv.key, kind, kv.value_str())?;
                partial.activities.insert(pos, activity);
            }
            [_, "next", succ] => partial.next.push(succ.to_string()),
            _ => return Err(Error::invalid(&kv.key, kv.value_str(), "unexpected workflow key")),
        }
    }

    let mut steps = Vec::with_capacity(partials.len());
    for (step_name, partial) in partials {
        let node = partial.node.ok_or_else(|| Error::MissingKey {
            key: format!("{prefix}{step_name}/node"),
        })?;
        steps.push(StepDefinition {
            name: step_name,
            node,
            activities: partial.activities.into_values().collect(),
            next: partial.next,
        });
    }
    Workflow::new(name, steps)
}

/// Stores a workflow in the layout read by [`read_workflow`], replacing any
/// previous definition with the same name.
pub async fn store_workflow(
    store: &dyn KvStore,
    keys: &Keys,
    deployment_id: &str,
    workflow: &Workflow,
) -> Result<()> {
    let root = keys.workflow_definition(deployment_id, workflow.name());
    store.delete_tree(&format!("{root}/")).await?;
    for step in workflow.steps() {
        let base = format!("{root}/steps/{}", step.name);
        store.put(&format!("{base}/node"), step.node.as_bytes()).await?;
        for (i, activity) in step.activities.iter().enumerate() {
            store
                .put(
                    &format!("{base}/activities/{i}/{}", activity.kind()),
                    activity.value().as_bytes(),
                )
                .await?;
        }
        for next in &step.next {
            store.put(&format!("{base}/next/{next}"), b"").await?;
        }
    }
    Ok(())
}
