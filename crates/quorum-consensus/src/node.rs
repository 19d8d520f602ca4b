//! A single participant in the broadcast-and-vote protocol.
//!
//! # Protocol
//!
//! 1. A node proposes a state: it adopts the value if it is newer than what it
//!    holds and broadcasts a proposal to every neighbor, in neighbor order.
//! 2. A neighbor that sees a strictly newer state adopts it and votes back to
//!    the proposer. Stale or equal proposals are silently withheld.
//! 3. The proposer tallies distinct voters per state. Once a state reaches
//!    the [quorum threshold](crate::quorum_threshold) the node latches
//!    consensus on it.
//!
//! # Faults
//!
//! - **Partition** drops neighbors from this node's view only. The dropped
//!   nodes still see this node as a neighbor.
//! - **Failure** deactivates the node for good. Every later `propose` or
//!   `receive` returns `false` and leaves the node untouched.
//!
//! The node never talks to another node itself. Outbound messages go into an
//! [`Outbox`] owned by the caller, which is responsible for delivery.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace};

use crate::message::{Message, NodeId, Outbox};
use crate::threshold::{meets_quorum, quorum_threshold, votes_needed};

/// A totally ordered state value the protocol can agree on.
pub trait StateValue: Ord + Clone + fmt::Debug + fmt::Display {}

impl<T> StateValue for T where T: Ord + Clone + fmt::Debug + fmt::Display {}

/// A protocol participant.
#[derive(Debug, Clone)]
pub struct Node<S> {
    id: NodeId,
    neighbors: Vec<NodeId>,
    log: Vec<String>,
    current_state: Option<S>,
    votes: BTreeMap<S, BTreeSet<NodeId>>,
    active: bool,
    consensus_reached: bool,
    quorum_threshold: usize,
}

impl<S: StateValue> Node<S> {
    /// Create an isolated, active node with no state.
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            neighbors: Vec::new(),
            log: Vec::new(),
            current_state: None,
            votes: BTreeMap::new(),
            active: true,
            consensus_reached: false,
            quorum_threshold: quorum_threshold(0),
        }
    }

    /// Add `other` to the end of the neighbor list.
    ///
    /// Returns `false` if `other` is this node or already a neighbor, in which
    /// case nothing changes.
    pub fn add_neighbor(&mut self, other: NodeId) -> bool {
        if other == self.id || self.neighbors.contains(&other) {
            return false;
        }
        self.neighbors.push(other);
        self.recompute_threshold();
        true
    }

    /// Drop every neighbor listed in `excluded`.
    ///
    /// One-directional: the excluded nodes are not told.
    pub fn simulate_partition(&mut self, excluded: &[NodeId]) {
        self.neighbors.retain(|n| !excluded.contains(n));
        self.recompute_threshold();
        info!(
            node = %self.id,
            remaining = self.neighbors.len(),
            threshold = self.quorum_threshold,
            "Network partition"
        );
        self.record(format!(
            "network partition, remaining neighbors: {}",
            self.neighbors.len()
        ));
    }

    /// Deactivate this node permanently.
    pub fn simulate_failure(&mut self) {
        self.active = false;
        info!(node = %self.id, "Node failed");
        self.record("node has failed".to_string());
    }

    /// Propose `state` to the neighborhood.
    ///
    /// The attempt is logged before the comparison, so a proposal that does
    /// not advance the state still leaves a log entry. Proposals go out only
    /// when the state strictly advances.
    ///
    /// Returns `false` only if the node has failed.
    pub fn propose(&mut self, state: S, outbox: &mut Outbox<S>) -> bool {
        if !self.active {
            return false;
        }

        self.record(format!("proposing state {}", state));

        if self.is_newer(&state) {
            debug!(node = %self.id, state = ?state, neighbors = self.neighbors.len(), "Broadcasting proposal");
            self.current_state = Some(state.clone());
            for neighbor in &self.neighbors {
                outbox.send(*neighbor, Message::proposal(state.clone(), self.id));
            }
        } else {
            trace!(node = %self.id, state = ?state, current = ?self.current_state, "Proposal does not advance state");
        }

        true
    }

    /// Handle a message from a neighbor.
    ///
    /// Returns `false` only if the node has failed.
    pub fn receive(&mut self, message: Message<S>, outbox: &mut Outbox<S>) -> bool {
        if !self.active {
            return false;
        }

        self.record(format!("received {}", message));

        match message {
            Message::Proposal { state, from } => self.handle_proposal(state, from, outbox),
            Message::Vote { state, from } => self.handle_vote(state, from),
        }

        true
    }

    fn handle_proposal(&mut self, state: S, from: NodeId, outbox: &mut Outbox<S>) {
        if !self.is_newer(&state) {
            trace!(node = %self.id, from = %from, state = ?state, "Withholding vote for stale proposal");
            return;
        }

        self.current_state = Some(state.clone());

        // The reply only reaches the proposer through a live link
        if self.neighbors.contains(&from) {
            debug!(node = %self.id, to = %from, state = ?state, "Voting");
            outbox.send(from, Message::vote(state, self.id));
        } else {
            debug!(node = %self.id, to = %from, state = ?state, "Proposer is not a neighbor, vote has no recipient");
        }
    }

    fn handle_vote(&mut self, state: S, from: NodeId) {
        let voters = self.votes.entry(state.clone()).or_default();
        voters.insert(from);
        let count = voters.len();

        if meets_quorum(count, self.neighbors.len()) && !self.consensus_reached {
            self.consensus_reached = true;
            // Quorum wins even over a higher state adopted in the meantime
            self.current_state = Some(state.clone());
            info!(node = %self.id, state = ?state, voters = count, threshold = self.quorum_threshold, "Consensus reached");
            self.record(format!("consensus reached for state {}", state));
        } else if !self.consensus_reached {
            debug!(
                node = %self.id,
                state = ?state,
                voters = count,
                needed = votes_needed(count, self.neighbors.len()),
                "Vote recorded"
            );
        }
    }

    fn is_newer(&self, state: &S) -> bool {
        match &self.current_state {
            None => true,
            Some(current) => state > current,
        }
    }

    fn recompute_threshold(&mut self) {
        self.quorum_threshold = quorum_threshold(self.neighbors.len());
    }

    fn record(&mut self, event: String) {
        self.log.push(format!("Node {}: {}", self.id, event));
    }

    /// This node's id.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Current neighbors in insertion order.
    pub fn neighbors(&self) -> &[NodeId] {
        &self.neighbors
    }

    /// Whether `other` is currently a neighbor.
    pub fn has_neighbor(&self, other: NodeId) -> bool {
        self.neighbors.contains(&other)
    }

    /// Distinct voters needed for consensus on any state.
    pub fn quorum_threshold(&self) -> usize {
        self.quorum_threshold
    }

    /// The append-only event log.
    pub fn log(&self) -> &[String] {
        &self.log
    }

    /// The currently accepted state, if any.
    pub fn consensus_state(&self) -> Option<&S> {
        self.current_state.as_ref()
    }

    /// Whether consensus has been latched.
    pub fn consensus_reached(&self) -> bool {
        self.consensus_reached
    }

    /// Whether the node still processes operations.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Voters recorded for `state`.
    pub fn voters(&self, state: &S) -> Option<&BTreeSet<NodeId>> {
        self.votes.get(state)
    }

    /// Number of distinct voters recorded for `state`.
    pub fn vote_count(&self, state: &S) -> usize {
        self.votes.get(state).map_or(0, BTreeSet::len)
    }

    /// Capture an owned copy of the observable node state.
    pub fn snapshot(&self) -> NodeSnapshot<S> {
        NodeSnapshot {
            id: self.id,
            neighbors: self.neighbors.clone(),
            quorum_threshold: self.quorum_threshold,
            current_state: self.current_state.clone(),
            consensus_reached: self.consensus_reached,
            active: self.active,
            log: self.log.clone(),
        }
    }
}

/// Owned, observable state of a node at a point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct NodeSnapshot<S> {
    pub id: NodeId,
    pub neighbors: Vec<NodeId>,
    pub quorum_threshold: usize,
    pub current_state: Option<S>,
    pub consensus_reached: bool,
    pub active: bool,
    pub log: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn node(id: u64) -> Node<u64> {
        Node::new(NodeId(id))
    }

    fn with_neighbors(id: u64, neighbors: &[u64]) -> Node<u64> {
        let mut n = node(id);
        for &other in neighbors {
            n.add_neighbor(NodeId(other));
        }
        n
    }

    #[test]
    fn new_node_is_empty_and_active() {
        let n = node(1);
        assert!(n.is_active());
        assert!(!n.consensus_reached());
        assert_eq!(n.consensus_state(), None);
        assert!(n.log().is_empty());
        assert_eq!(n.quorum_threshold(), 1);
    }

    #[test]
    fn threshold_tracks_neighbor_count() {
        let mut n = node(0);
        let expected = [1, 2, 2, 3];
        for (i, want) in expected.iter().enumerate() {
            n.add_neighbor(NodeId(i as u64 + 1));
            assert_eq!(n.quorum_threshold(), *want);
        }
    }

    #[test]
    fn add_neighbor_ignores_self_and_duplicates() {
        let mut n = node(1);
        assert!(!n.add_neighbor(NodeId(1)));
        assert!(n.add_neighbor(NodeId(2)));
        assert!(!n.add_neighbor(NodeId(2)));
        assert_eq!(n.neighbors(), &[NodeId(2)]);
    }

    #[test]
    fn propose_broadcasts_in_neighbor_order() {
        let mut n = with_neighbors(1, &[3, 2]);
        let mut out = Outbox::new();

        assert!(n.propose(5, &mut out));
        assert_eq!(n.consensus_state(), Some(&5));

        let targets: Vec<_> = out.envelopes().iter().map(|e| e.to).collect();
        assert_eq!(targets, vec![NodeId(3), NodeId(2)]);
        assert!(out
            .envelopes()
            .iter()
            .all(|e| e.message == Message::proposal(5, NodeId(1))));
    }

    #[test]
    fn stale_propose_logs_but_does_not_broadcast() {
        let mut n = with_neighbors(1, &[2]);
        let mut out = Outbox::new();
        n.propose(5, &mut out);
        out.drain();

        // Equal and lower values are both stale
        assert!(n.propose(5, &mut out));
        assert!(n.propose(3, &mut out));

        assert!(out.is_empty());
        assert_eq!(n.consensus_state(), Some(&5));
        assert_eq!(n.log().len(), 3);
        assert_eq!(n.log()[2], "Node 1: proposing state 3");
    }

    #[test]
    fn proposal_is_adopted_and_voted() {
        let mut n = with_neighbors(2, &[1]);
        let mut out = Outbox::new();

        assert!(n.receive(Message::proposal(1, NodeId(1)), &mut out));
        assert_eq!(n.consensus_state(), Some(&1));
        assert_eq!(out.len(), 1);
        assert_eq!(out.envelopes()[0].to, NodeId(1));
        assert_eq!(out.envelopes()[0].message, Message::vote(1, NodeId(2)));
        assert_eq!(n.log()[0], "Node 2: received proposal { state: 1, from: 1 }");
    }

    #[test]
    fn stale_proposal_gets_no_vote() {
        let mut n = with_neighbors(2, &[1]);
        let mut out = Outbox::new();
        n.receive(Message::proposal(4, NodeId(1)), &mut out);
        out.drain();

        assert!(n.receive(Message::proposal(4, NodeId(1)), &mut out));
        assert!(n.receive(Message::proposal(2, NodeId(1)), &mut out));
        assert!(out.is_empty());
        assert_eq!(n.consensus_state(), Some(&4));
        // Receipt is still logged
        assert_eq!(n.log().len(), 3);
    }

    #[test]
    fn proposal_from_non_neighbor_is_adopted_without_vote() {
        let mut n = with_neighbors(2, &[3]);
        let mut out = Outbox::new();

        assert!(n.receive(Message::proposal(9, NodeId(1)), &mut out));
        assert_eq!(n.consensus_state(), Some(&9));
        assert!(out.is_empty());
    }

    #[test]
    fn duplicate_votes_counted_once() {
        let mut n = with_neighbors(1, &[2, 3, 4, 5]);
        let mut out = Outbox::new();

        n.receive(Message::vote(1, NodeId(2)), &mut out);
        n.receive(Message::vote(1, NodeId(2)), &mut out);
        assert_eq!(n.vote_count(&1), 1);
        assert!(!n.consensus_reached());
    }

    #[test]
    fn quorum_latches_consensus() {
        let mut n = with_neighbors(1, &[2, 3]);
        let mut out = Outbox::new();
        n.propose(1, &mut out);

        n.receive(Message::vote(1, NodeId(2)), &mut out);
        assert!(!n.consensus_reached());
        n.receive(Message::vote(1, NodeId(3)), &mut out);
        assert!(n.consensus_reached());
        assert_eq!(n.consensus_state(), Some(&1));
        assert_eq!(n.log().last().map(String::as_str), Some("Node 1: consensus reached for state 1"));
    }

    #[test]
    fn partition_lowers_bar_for_recorded_votes() {
        let mut n = with_neighbors(1, &[2, 3]);
        let mut out = Outbox::new();
        n.receive(Message::vote(1, NodeId(2)), &mut out);
        assert!(!n.consensus_reached());

        // One neighbor left: the vote already on record is enough
        n.simulate_partition(&[NodeId(3)]);
        n.receive(Message::vote(1, NodeId(2)), &mut out);
        assert_eq!(n.vote_count(&1), 1);
        assert!(n.consensus_reached());
    }

    #[test]
    fn consensus_latch_ignores_later_quorums() {
        let mut n = with_neighbors(1, &[2, 3]);
        let mut out = Outbox::new();
        n.receive(Message::vote(1, NodeId(2)), &mut out);
        n.receive(Message::vote(1, NodeId(3)), &mut out);
        assert!(n.consensus_reached());

        // A second quorum on another state does not move the latched state
        n.receive(Message::vote(7, NodeId(2)), &mut out);
        n.receive(Message::vote(7, NodeId(3)), &mut out);
        assert!(n.consensus_reached());
        assert_eq!(n.consensus_state(), Some(&1));
        assert_eq!(n.vote_count(&7), 2);
    }

    #[test]
    fn fresh_propose_after_consensus_still_advances() {
        let mut n = with_neighbors(1, &[2]);
        let mut out = Outbox::new();
        n.receive(Message::vote(1, NodeId(2)), &mut out);
        assert!(n.consensus_reached());

        n.propose(8, &mut out);
        assert_eq!(n.consensus_state(), Some(&8));
        assert!(n.consensus_reached());
    }

    #[test]
    fn quorum_overwrites_higher_state() {
        // Literal behavior: the agreed value wins even when the node has
        // already moved past it.
        let mut n = with_neighbors(1, &[2, 3]);
        let mut out = Outbox::new();
        n.propose(10, &mut out);
        assert_eq!(n.consensus_state(), Some(&10));

        n.receive(Message::vote(4, NodeId(2)), &mut out);
        n.receive(Message::vote(4, NodeId(3)), &mut out);
        assert!(n.consensus_reached());
        assert_eq!(n.consensus_state(), Some(&4));
    }

    #[test]
    fn failed_node_is_inert() {
        let mut n = with_neighbors(1, &[2, 3]);
        let mut out = Outbox::new();
        n.propose(1, &mut out);
        out.drain();
        n.simulate_failure();

        let before = n.snapshot();
        assert!(!n.propose(5, &mut out));
        assert!(!n.receive(Message::proposal(6, NodeId(2)), &mut out));
        assert!(!n.receive(Message::vote(1, NodeId(2)), &mut out));

        assert!(out.is_empty());
        assert_eq!(n.snapshot(), before);
        assert_eq!(n.vote_count(&1), 0);
        assert_eq!(n.log().last().map(String::as_str), Some("Node 1: node has failed"));
    }

    #[test]
    fn partition_is_one_directional() {
        let mut a = with_neighbors(1, &[2, 3]);
        let b = with_neighbors(2, &[1, 3]);

        a.simulate_partition(&[NodeId(2)]);
        assert_eq!(a.neighbors(), &[NodeId(3)]);
        assert_eq!(a.quorum_threshold(), 1);
        assert!(b.has_neighbor(NodeId(1)));
        assert_eq!(
            a.log().last().map(String::as_str),
            Some("Node 1: network partition, remaining neighbors: 1")
        );
    }

    #[test]
    fn partition_ignores_unknown_ids() {
        let mut a = with_neighbors(1, &[2, 3]);
        a.simulate_partition(&[NodeId(9)]);
        assert_eq!(a.neighbors().len(), 2);
        assert_eq!(a.quorum_threshold(), 2);
    }

    #[test]
    fn works_with_non_integer_states() {
        let mut n: Node<String> = Node::new(NodeId(1));
        n.add_neighbor(NodeId(2));
        let mut out = Outbox::new();
        n.propose("b".to_string(), &mut out);
        n.propose("a".to_string(), &mut out);
        assert_eq!(n.consensus_state().map(String::as_str), Some("b"));
    }

    proptest! {
        #[test]
        fn propose_never_decreases_state(states in proptest::collection::vec(0u64..50, 1..40)) {
            let mut n = with_neighbors(1, &[2, 3]);
            let mut out = Outbox::new();
            let mut max_seen: Option<u64> = None;

            for s in states {
                let before = n.consensus_state().copied();
                n.propose(s, &mut out);
                let after = n.consensus_state().copied();
                prop_assert!(after >= before);
                max_seen = max_seen.max(Some(s));
                prop_assert_eq!(after, max_seen);
            }
        }

        #[test]
        fn repeated_votes_bounded_by_distinct_voters(voters in proptest::collection::vec(2u64..6, 0..30)) {
            let mut n = with_neighbors(1, &[2, 3, 4, 5]);
            let mut out = Outbox::new();
            for v in &voters {
                n.receive(Message::vote(1, NodeId(*v)), &mut out);
            }
            let distinct: BTreeSet<_> = voters.iter().collect();
            prop_assert_eq!(n.vote_count(&1), distinct.len());
        }
    }
}
