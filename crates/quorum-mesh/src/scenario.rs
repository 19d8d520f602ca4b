//! Scripted scenarios: a topology plus an ordered list of operations.
//!
//! Scenarios are plain data and load from JSON:
//!
//! ```json
//! {
//!   "nodes": [1, 2, 3],
//!   "topology": { "kind": "full_mesh" },
//!   "steps": [
//!     { "op": "propose", "node": 1, "state": 1 },
//!     { "op": "partition", "node": 3, "excluded": [1] },
//!     { "op": "fail", "node": 2 },
//!     { "op": "deliver", "node": 1, "message": { "kind": "vote", "state": 1, "from": 3 } }
//!   ]
//! }
//! ```
//!
//! Whatever the delivery driver, each step runs to quiescence before the
//! next one starts.

use std::collections::BTreeSet;
use std::path::Path;

use quorum_consensus::{Message, NodeId, NodeSnapshot, StateValue};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::actor::ActorMesh;
use crate::config::{DeliveryMode, SimulationConfig};
use crate::error::{Error, Result};
use crate::events::MeshEvent;
use crate::mesh::Mesh;
use crate::registry::Registry;
use crate::scheduler::Scheduler;

/// How the scenario's nodes are linked.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Topology {
    /// Every node sees every other node, in `nodes` order.
    #[default]
    FullMesh,
    /// Directed links: the first id gets the second as a neighbor.
    Links { links: Vec<(NodeId, NodeId)> },
}

/// One scripted operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ScenarioStep<S> {
    /// `node` proposes `state`
    Propose { node: NodeId, state: S },
    /// `node` drops `excluded` from its view
    Partition { node: NodeId, excluded: Vec<NodeId> },
    /// `node` fails
    Fail { node: NodeId },
    /// `message` is handed straight to `node`
    Deliver { node: NodeId, message: Message<S> },
}

impl<S> ScenarioStep<S> {
    fn node(&self) -> NodeId {
        match self {
            ScenarioStep::Propose { node, .. }
            | ScenarioStep::Partition { node, .. }
            | ScenarioStep::Fail { node }
            | ScenarioStep::Deliver { node, .. } => *node,
        }
    }
}

/// A topology and the operations to run on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scenario<S> {
    pub nodes: Vec<NodeId>,
    #[serde(default)]
    pub topology: Topology,
    pub steps: Vec<ScenarioStep<S>>,
}

/// Final state of a scenario run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioReport<S> {
    /// Driver that delivered the messages
    pub delivery: DeliveryMode,
    /// What each step's target answered (`false` only for failed nodes)
    pub outcomes: Vec<bool>,
    /// Every node at the end of the run, in id order
    pub nodes: Vec<NodeSnapshot<S>>,
    /// Event timeline, empty if recording was disabled
    pub events: Vec<MeshEvent<S>>,
}

impl<S> ScenarioReport<S> {
    /// Look up a node's final snapshot.
    pub fn node(&self, id: NodeId) -> Option<&NodeSnapshot<S>> {
        self.nodes.iter().find(|n| n.id == id)
    }
}

impl Scenario<u64> {
    /// Three fully meshed nodes: two successful proposals, then a partition
    /// and a failure that leave node 3 unable to reach consensus.
    pub fn reference() -> Self {
        let n = NodeId::new;
        Self {
            nodes: vec![n(1), n(2), n(3)],
            topology: Topology::FullMesh,
            steps: vec![
                ScenarioStep::Propose { node: n(1), state: 1 },
                ScenarioStep::Propose { node: n(2), state: 2 },
                ScenarioStep::Partition {
                    node: n(3),
                    excluded: vec![n(1)],
                },
                ScenarioStep::Fail { node: n(2) },
                ScenarioStep::Propose { node: n(3), state: 3 },
            ],
        }
    }
}

impl<S> Scenario<S>
where
    S: StateValue + DeserializeOwned,
{
    /// Parse a scenario from JSON text.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let scenario: Self = serde_json::from_str(json)?;
        scenario.validate()?;
        Ok(scenario)
    }

    /// Load a scenario from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }
}

impl<S: StateValue> Scenario<S> {
    /// Check that ids are unique and every reference names a listed node.
    pub fn validate(&self) -> Result<()> {
        let mut known = BTreeSet::new();
        for id in &self.nodes {
            if !known.insert(*id) {
                return Err(Error::Scenario(format!("node {} listed twice", id)));
            }
        }

        let check = |id: &NodeId, what: &str| {
            if known.contains(id) {
                Ok(())
            } else {
                Err(Error::Scenario(format!("{} refers to unknown node {}", what, id)))
            }
        };

        if let Topology::Links { links } = &self.topology {
            for (a, b) in links {
                check(a, "link")?;
                check(b, "link")?;
            }
        }

        for (i, step) in self.steps.iter().enumerate() {
            check(&step.node(), &format!("step {}", i))?;
        }

        Ok(())
    }

    /// Build and wire the registry this scenario starts from.
    pub fn build(&self, config: &SimulationConfig) -> Result<Registry<S>> {
        self.validate()?;
        let mut registry = Registry::new(config.record_events);

        match &self.topology {
            Topology::FullMesh => registry.full_mesh(&self.nodes)?,
            Topology::Links { links } => {
                for id in &self.nodes {
                    registry.add_node(*id)?;
                }
                for (a, b) in links {
                    registry.add_neighbor(*a, *b)?;
                }
            }
        }

        Ok(registry)
    }

    /// Run with a synchronous or queued driver.
    ///
    /// Actor delivery needs an async runtime; use [`run_async`](Self::run_async).
    pub fn run(&self, config: &SimulationConfig) -> Result<ScenarioReport<S>> {
        let registry = self.build(config)?;
        match config.delivery {
            DeliveryMode::Synchronous => self.run_synchronous(registry),
            DeliveryMode::Queued => self.run_queued(registry, config),
            DeliveryMode::Actors => Err(Error::Config(
                "actor delivery needs an async runtime, use run_async".to_string(),
            )),
        }
    }

    fn run_synchronous(&self, registry: Registry<S>) -> Result<ScenarioReport<S>> {
        let mut mesh = Mesh::from_registry(registry);
        let mut outcomes = Vec::with_capacity(self.steps.len());

        for step in &self.steps {
            let outcome = match step.clone() {
                ScenarioStep::Propose { node, state } => mesh.propose(node, state)?,
                ScenarioStep::Partition { node, excluded } => {
                    mesh.simulate_partition(node, &excluded)?;
                    true
                }
                ScenarioStep::Fail { node } => {
                    mesh.simulate_failure(node)?;
                    true
                }
                ScenarioStep::Deliver { node, message } => mesh.receive(node, message)?,
            };
            outcomes.push(outcome);
        }

        Ok(report(DeliveryMode::Synchronous, outcomes, mesh.into_registry()))
    }

    fn run_queued(&self, registry: Registry<S>, config: &SimulationConfig) -> Result<ScenarioReport<S>> {
        let mut sched = Scheduler::from_registry(registry, config);
        let mut outcomes = Vec::with_capacity(self.steps.len());

        for step in &self.steps {
            let outcome = match step.clone() {
                ScenarioStep::Propose { node, state } => sched.propose(node, state)?,
                ScenarioStep::Partition { node, excluded } => {
                    sched.simulate_partition(node, &excluded)?;
                    true
                }
                ScenarioStep::Fail { node } => {
                    sched.simulate_failure(node)?;
                    true
                }
                ScenarioStep::Deliver { node, message } => sched.receive(node, message)?,
            };
            sched.run_until_quiescent();
            outcomes.push(outcome);
        }

        if sched.pending() > 0 {
            warn!(pending = sched.pending(), "Scenario ended with undelivered messages");
        }

        Ok(report(DeliveryMode::Queued, outcomes, sched.into_registry()))
    }
}

impl<S> Scenario<S>
where
    S: StateValue + Send + 'static,
{
    /// Run with any driver, including actors.
    pub async fn run_async(&self, config: &SimulationConfig) -> Result<ScenarioReport<S>> {
        if config.delivery != DeliveryMode::Actors {
            return self.run(config);
        }

        let mesh = ActorMesh::spawn(self.build(config)?);
        let mut outcomes = Vec::with_capacity(self.steps.len());

        for step in &self.steps {
            let outcome = match step.clone() {
                ScenarioStep::Propose { node, state } => mesh.propose(node, state).await?,
                ScenarioStep::Partition { node, excluded } => {
                    mesh.simulate_partition(node, &excluded).await?;
                    true
                }
                ScenarioStep::Fail { node } => {
                    mesh.simulate_failure(node).await?;
                    true
                }
                ScenarioStep::Deliver { node, message } => mesh.receive(node, message).await?,
            };
            mesh.settle().await;
            outcomes.push(outcome);
        }

        let registry = mesh.shutdown().await?;
        Ok(report(DeliveryMode::Actors, outcomes, registry))
    }
}

fn report<S: StateValue>(
    delivery: DeliveryMode,
    outcomes: Vec<bool>,
    registry: Registry<S>,
) -> ScenarioReport<S> {
    let nodes = registry.snapshots();
    let agreed = nodes.iter().filter(|n| n.consensus_reached).count();
    info!(?delivery, steps = outcomes.len(), nodes = nodes.len(), agreed, "Scenario complete");

    let (_, events) = registry.into_parts();
    ScenarioReport {
        delivery,
        outcomes,
        nodes,
        events: events.into_events(),
    }
}
