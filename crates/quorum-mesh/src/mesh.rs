//! Synchronous, depth-first delivery.
//!
//! Sending a message behaves like calling the recipient: the sender waits
//! until the recipient, and everything the recipient sends in turn, has been
//! handled. A broadcast to N neighbors is N such deliveries in neighbor
//! order, so a vote sent back by the first neighbor reaches the proposer
//! before the second neighbor even sees the proposal.
//!
//! Delivery is instantaneous, lossless and order-preserving. There are no
//! races to observe here; see [`Scheduler`](crate::Scheduler) and
//! [`ActorMesh`](crate::ActorMesh) for drivers that interleave.

use quorum_consensus::{Envelope, Message, Node, NodeId, Outbox, StateValue};

use crate::config::SimulationConfig;
use crate::error::{Error, Result};
use crate::events::MeshEvent;
use crate::registry::Registry;

/// A mesh of nodes with synchronous delivery.
#[derive(Debug, Clone)]
pub struct Mesh<S> {
    registry: Registry<S>,
}

impl<S: StateValue> Default for Mesh<S> {
    fn default() -> Self {
        Self::new(&SimulationConfig::default())
    }
}

impl<S: StateValue> Mesh<S> {
    /// Create an empty mesh.
    pub fn new(config: &SimulationConfig) -> Self {
        Self::from_registry(Registry::new(config.record_events))
    }

    /// Drive an already wired registry.
    pub fn from_registry(registry: Registry<S>) -> Self {
        Self { registry }
    }

    /// Register a fresh node.
    pub fn add_node(&mut self, id: NodeId) -> Result<()> {
        self.registry.add_node(id)
    }

    /// Add `other` to `node`'s neighbors (one direction).
    pub fn add_neighbor(&mut self, node: NodeId, other: NodeId) -> Result<bool> {
        self.registry.add_neighbor(node, other)
    }

    /// Link two nodes in both directions.
    pub fn connect(&mut self, a: NodeId, b: NodeId) -> Result<()> {
        self.registry.connect(a, b)
    }

    /// Fully connect the listed nodes, registering missing ones.
    pub fn full_mesh(&mut self, ids: &[NodeId]) -> Result<()> {
        self.registry.full_mesh(ids)
    }

    /// `node` proposes `state`; the broadcast and all replies are delivered
    /// before this returns.
    pub fn propose(&mut self, node: NodeId, state: S) -> Result<bool> {
        let mut outbox = Outbox::new();
        let accepted = self.registry.propose(node, state, &mut outbox)?;
        self.flush(outbox);
        Ok(accepted)
    }

    /// Hand `message` to `node` as if a neighbor had sent it.
    pub fn receive(&mut self, node: NodeId, message: Message<S>) -> Result<bool> {
        if !self.registry.contains(node) {
            return Err(Error::UnknownNode(node));
        }
        let mut outbox = Outbox::new();
        let accepted = self
            .registry
            .deliver(Envelope { to: node, message }, &mut outbox);
        self.flush(outbox);
        Ok(accepted)
    }

    /// Drop `excluded` from `node`'s view.
    pub fn simulate_partition(&mut self, node: NodeId, excluded: &[NodeId]) -> Result<()> {
        self.registry.simulate_partition(node, excluded)
    }

    /// Permanently deactivate `node`.
    pub fn simulate_failure(&mut self, node: NodeId) -> Result<()> {
        self.registry.simulate_failure(node)
    }

    /// A node's event log.
    pub fn log(&self, node: NodeId) -> Result<&[String]> {
        self.registry.log(node)
    }

    /// A node's accepted state.
    pub fn consensus_state(&self, node: NodeId) -> Result<Option<&S>> {
        self.registry.consensus_state(node)
    }

    /// Look up a node.
    pub fn node(&self, id: NodeId) -> Result<&Node<S>> {
        self.registry.node(id)
    }

    /// The event timeline.
    pub fn events(&self) -> &[MeshEvent<S>] {
        self.registry.events()
    }

    /// The underlying registry.
    pub fn registry(&self) -> &Registry<S> {
        &self.registry
    }

    /// Give back the underlying registry.
    pub fn into_registry(self) -> Registry<S> {
        self.registry
    }

    /// Deliver depth-first: each envelope's replies go out before its
    /// remaining siblings.
    fn flush(&mut self, outbox: Outbox<S>) {
        let mut stack: Vec<Envelope<S>> = outbox.into_iter().rev().collect();
        let mut replies = Outbox::new();

        while let Some(envelope) = stack.pop() {
            self.registry.deliver(envelope, &mut replies);
            stack.extend(replies.drain().into_iter().rev());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(raw: &[u64]) -> Vec<NodeId> {
        raw.iter().copied().map(NodeId).collect()
    }

    fn triangle() -> Mesh<u64> {
        let mut mesh = Mesh::default();
        mesh.full_mesh(&ids(&[1, 2, 3])).unwrap();
        mesh
    }

    fn deliveries(mesh: &Mesh<u64>) -> Vec<(NodeId, &'static str, NodeId)> {
        mesh.events()
            .iter()
            .filter_map(|e| match e {
                MeshEvent::Delivered { to, message, .. } => Some((message.from(), message.kind(), *to)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn replies_delivered_before_next_broadcast() {
        let mut mesh = triangle();
        assert!(mesh.propose(NodeId(1), 1).unwrap());

        assert_eq!(
            deliveries(&mesh),
            vec![
                (NodeId(1), "proposal", NodeId(2)),
                (NodeId(2), "vote", NodeId(1)),
                (NodeId(1), "proposal", NodeId(3)),
                (NodeId(3), "vote", NodeId(1)),
            ]
        );
    }

    #[test]
    fn proposer_reaches_consensus_in_triangle() {
        let mut mesh = triangle();
        mesh.propose(NodeId(1), 1).unwrap();

        let n1 = mesh.node(NodeId(1)).unwrap();
        assert!(n1.consensus_reached());
        assert_eq!(n1.vote_count(&1), 2);
        for id in [2, 3] {
            let n = mesh.node(NodeId(id)).unwrap();
            assert_eq!(n.consensus_state(), Some(&1));
            assert!(!n.consensus_reached());
        }
    }

    #[test]
    fn receive_injects_and_cascades() {
        let mut mesh = triangle();
        assert!(mesh.receive(NodeId(2), Message::proposal(4, NodeId(1))).unwrap());

        // Node 2 adopted and its vote was delivered to node 1
        assert_eq!(mesh.consensus_state(NodeId(2)).unwrap(), Some(&4));
        assert_eq!(mesh.node(NodeId(1)).unwrap().vote_count(&4), 1);
    }

    #[test]
    fn receive_unknown_node_is_error() {
        let mut mesh = triangle();
        let err = mesh.receive(NodeId(9), Message::vote(1, NodeId(1))).unwrap_err();
        assert!(matches!(err, Error::UnknownNode(NodeId(9))));
    }

    #[test]
    fn failed_neighbor_sends_no_vote() {
        let mut mesh = triangle();
        mesh.simulate_failure(NodeId(2)).unwrap();
        let log_len = mesh.log(NodeId(2)).unwrap().len();

        mesh.propose(NodeId(1), 5).unwrap();

        assert_eq!(mesh.log(NodeId(2)).unwrap().len(), log_len);
        assert_eq!(mesh.consensus_state(NodeId(2)).unwrap(), None);
        assert_eq!(mesh.node(NodeId(1)).unwrap().vote_count(&5), 1);
        assert!(!mesh.node(NodeId(1)).unwrap().consensus_reached());
        assert!(mesh.events().iter().any(|e| matches!(
            e,
            MeshEvent::Delivered { to: NodeId(2), accepted: false, .. }
        )));
    }

    #[test]
    fn failed_proposer_reports_false() {
        let mut mesh = triangle();
        mesh.simulate_failure(NodeId(1)).unwrap();
        assert!(!mesh.propose(NodeId(1), 1).unwrap());
        assert_eq!(deliveries(&mesh).len(), 0);
    }

    #[test]
    fn partition_is_asymmetric() {
        let mut mesh = triangle();
        mesh.simulate_partition(NodeId(1), &[NodeId(2)]).unwrap();

        assert!(!mesh.node(NodeId(1)).unwrap().has_neighbor(NodeId(2)));
        assert!(mesh.node(NodeId(2)).unwrap().has_neighbor(NodeId(1)));
    }

    #[test]
    fn vote_to_partitioned_proposer_has_no_recipient() {
        // Node 2 no longer sees node 1, so its vote cannot travel back
        let mut mesh = triangle();
        mesh.simulate_partition(NodeId(2), &[NodeId(1)]).unwrap();
        mesh.propose(NodeId(1), 1).unwrap();

        assert_eq!(mesh.consensus_state(NodeId(2)).unwrap(), Some(&1));
        let n1 = mesh.node(NodeId(1)).unwrap();
        assert_eq!(n1.vote_count(&1), 1);
        assert!(!n1.consensus_reached());
    }

    #[test]
    fn isolated_node_needs_one_vote() {
        let mut mesh: Mesh<u64> = Mesh::default();
        mesh.full_mesh(&ids(&[1, 2])).unwrap();
        mesh.propose(NodeId(1), 3).unwrap();

        // Threshold with one neighbor is 1
        assert!(mesh.node(NodeId(1)).unwrap().consensus_reached());
    }
}
