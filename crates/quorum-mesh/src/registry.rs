//! Node registry: owns every node and resolves ids.
//!
//! Nodes only ever hold the ids of their neighbors. The registry owns the
//! nodes themselves, so there is no ownership cycle however the topology is
//! wired, and each delivery driver borrows exactly one node at a time.

use std::collections::BTreeMap;

use quorum_consensus::{Envelope, Node, NodeId, NodeSnapshot, Outbox, StateValue};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::events::{EventLog, MeshEvent};

/// Id-keyed set of nodes plus the shared event timeline.
#[derive(Debug, Clone)]
pub struct Registry<S> {
    nodes: BTreeMap<NodeId, Node<S>>,
    events: EventLog<S>,
}

impl<S: StateValue> Default for Registry<S> {
    fn default() -> Self {
        Self::new(true)
    }
}

impl<S: StateValue> Registry<S> {
    /// Create an empty registry.
    pub fn new(record_events: bool) -> Self {
        Self {
            nodes: BTreeMap::new(),
            events: EventLog::new(record_events),
        }
    }

    pub(crate) fn from_parts(nodes: BTreeMap<NodeId, Node<S>>, events: EventLog<S>) -> Self {
        Self { nodes, events }
    }

    pub(crate) fn into_parts(self) -> (BTreeMap<NodeId, Node<S>>, EventLog<S>) {
        (self.nodes, self.events)
    }

    /// Register a fresh node.
    pub fn add_node(&mut self, id: NodeId) -> Result<()> {
        if self.nodes.contains_key(&id) {
            return Err(Error::DuplicateNode(id));
        }
        self.nodes.insert(id, Node::new(id));
        self.events.record(|seq| MeshEvent::NodeAdded { node: id, seq });
        Ok(())
    }

    /// Add `other` to `node`'s neighbor list (one direction only).
    ///
    /// Returns `false` if the link already existed or `node == other`.
    pub fn add_neighbor(&mut self, node: NodeId, other: NodeId) -> Result<bool> {
        if !self.nodes.contains_key(&other) {
            return Err(Error::UnknownNode(other));
        }
        let n = self.node_mut(node)?;
        let added = n.add_neighbor(other);
        let threshold = n.quorum_threshold();
        if added {
            self.events.record(|seq| MeshEvent::NeighborAdded {
                node,
                neighbor: other,
                threshold,
                seq,
            });
        }
        Ok(added)
    }

    /// Link two nodes in both directions.
    pub fn connect(&mut self, a: NodeId, b: NodeId) -> Result<()> {
        self.add_neighbor(a, b)?;
        self.add_neighbor(b, a)?;
        Ok(())
    }

    /// Make every listed node a neighbor of every other, in list order.
    ///
    /// Nodes that are not registered yet are added first.
    pub fn full_mesh(&mut self, ids: &[NodeId]) -> Result<()> {
        for &id in ids {
            if !self.nodes.contains_key(&id) {
                self.add_node(id)?;
            }
        }
        for &node in ids {
            for &other in ids {
                if node != other {
                    self.add_neighbor(node, other)?;
                }
            }
        }
        Ok(())
    }

    /// Drop `excluded` from `node`'s view of the mesh.
    pub fn simulate_partition(&mut self, node: NodeId, excluded: &[NodeId]) -> Result<()> {
        let n = self.node_mut(node)?;
        n.simulate_partition(excluded);
        let remaining = n.neighbors().len();
        let threshold = n.quorum_threshold();
        self.events.record(|seq| MeshEvent::Partitioned {
            node,
            excluded: excluded.to_vec(),
            remaining,
            threshold,
            seq,
        });
        Ok(())
    }

    /// Permanently deactivate `node`.
    pub fn simulate_failure(&mut self, node: NodeId) -> Result<()> {
        self.node_mut(node)?.simulate_failure();
        self.events.record(|seq| MeshEvent::Failed { node, seq });
        Ok(())
    }

    /// Ask `node` to propose `state`, collecting its broadcast into `outbox`.
    pub fn propose(&mut self, node: NodeId, state: S, outbox: &mut Outbox<S>) -> Result<bool> {
        let accepted = self.node_mut(node)?.propose(state.clone(), outbox);
        self.events.record(|seq| MeshEvent::Proposed {
            node,
            state,
            accepted,
            seq,
        });
        Ok(accepted)
    }

    /// Hand one envelope to its recipient, collecting replies into `outbox`.
    ///
    /// Returns the recipient's answer, or `false` if no such node exists.
    pub fn deliver(&mut self, envelope: Envelope<S>, outbox: &mut Outbox<S>) -> bool {
        let Envelope { to, message } = envelope;

        let Some(node) = self.nodes.get_mut(&to) else {
            warn!(to = %to, kind = message.kind(), state = %message.state(), "No recipient for message");
            self.events
                .record(|seq| MeshEvent::Undeliverable { to, message, seq });
            return false;
        };

        let had_consensus = node.consensus_reached();
        let accepted = node.receive(message.clone(), outbox);
        let latched = !had_consensus && node.consensus_reached();
        let agreed = node.consensus_state().cloned();

        if !accepted {
            debug!(to = %to, kind = message.kind(), state = %message.state(), "Recipient has failed, message dropped");
        }

        self.events.record(|seq| MeshEvent::Delivered {
            to,
            message,
            accepted,
            seq,
        });

        if let (true, Some(state)) = (latched, agreed) {
            self.events
                .record(|seq| MeshEvent::ConsensusReached { node: to, state, seq });
        }

        accepted
    }

    /// Look up a node.
    pub fn node(&self, id: NodeId) -> Result<&Node<S>> {
        self.nodes.get(&id).ok_or(Error::UnknownNode(id))
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut Node<S>> {
        self.nodes.get_mut(&id).ok_or(Error::UnknownNode(id))
    }

    /// Whether `id` is registered.
    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// A node's event log.
    pub fn log(&self, id: NodeId) -> Result<&[String]> {
        Ok(self.node(id)?.log())
    }

    /// A node's accepted state.
    pub fn consensus_state(&self, id: NodeId) -> Result<Option<&S>> {
        Ok(self.node(id)?.consensus_state())
    }

    /// Registered ids in ascending order.
    pub fn ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.keys().copied()
    }

    /// Registered nodes in id order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node<S>> {
        self.nodes.values()
    }

    /// Number of registered nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether no node is registered.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Snapshots of every node in id order.
    pub fn snapshots(&self) -> Vec<NodeSnapshot<S>> {
        self.nodes.values().map(Node::snapshot).collect()
    }

    /// The event timeline.
    pub fn events(&self) -> &[MeshEvent<S>] {
        self.events.events()
    }
}
