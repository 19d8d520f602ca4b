//! Queued delivery with an explicit scheduler.
//!
//! Every node gets a FIFO inbox. Sending only enqueues; nothing is handled
//! until the scheduler picks an inbox and delivers its oldest message. Which
//! inbox goes next is the scheduler's decision ([`QueueOrder`]), so runs can
//! interleave deliveries in ways the synchronous [`Mesh`](crate::Mesh) never
//! does. Per-inbox FIFO order is always kept.
//!
//! Interleaving changes *when* nodes see messages, not the protocol rules:
//! adoption stays monotonic, votes stay deduplicated and the consensus latch
//! still fires at most once per node.

use std::collections::{BTreeMap, VecDeque};

use quorum_consensus::{Envelope, Message, NodeId, Outbox, StateValue};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, warn};

use crate::config::{QueueOrder, SimulationConfig};
use crate::error::{Error, Result};
use crate::events::MeshEvent;
use crate::registry::Registry;

/// Outcome of a single scheduled delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    /// Recipient
    pub to: NodeId,
    /// Whether the recipient accepted the message
    pub accepted: bool,
}

/// A mesh whose messages wait in per-node inboxes.
#[derive(Debug)]
pub struct Scheduler<S> {
    registry: Registry<S>,
    inboxes: BTreeMap<NodeId, VecDeque<Message<S>>>,
    order: QueueOrder,
    rng: StdRng,
    last_served: Option<NodeId>,
    max_steps: usize,
    delivered: u64,
}

impl<S: StateValue> Scheduler<S> {
    /// Create an empty scheduler.
    pub fn new(config: &SimulationConfig) -> Self {
        Self::from_registry(Registry::new(config.record_events), config)
    }

    /// Schedule deliveries for an already wired registry.
    pub fn from_registry(registry: Registry<S>, config: &SimulationConfig) -> Self {
        Self {
            registry,
            inboxes: BTreeMap::new(),
            order: config.order,
            rng: StdRng::seed_from_u64(config.seed),
            last_served: None,
            max_steps: config.max_steps,
            delivered: 0,
        }
    }

    /// `node` proposes `state`; the broadcast is queued, not delivered.
    pub fn propose(&mut self, node: NodeId, state: S) -> Result<bool> {
        let mut outbox = Outbox::new();
        let accepted = self.registry.propose(node, state, &mut outbox)?;
        self.enqueue(outbox);
        Ok(accepted)
    }

    /// Hand `message` to `node` right away; its replies are queued.
    pub fn receive(&mut self, node: NodeId, message: Message<S>) -> Result<bool> {
        if !self.registry.contains(node) {
            return Err(Error::UnknownNode(node));
        }
        let mut outbox = Outbox::new();
        let accepted = self
            .registry
            .deliver(Envelope { to: node, message }, &mut outbox);
        self.enqueue(outbox);
        Ok(accepted)
    }

    /// Put `message` at the back of `to`'s inbox.
    pub fn send(&mut self, to: NodeId, message: Message<S>) {
        self.inboxes.entry(to).or_default().push_back(message);
    }

    fn enqueue(&mut self, outbox: Outbox<S>) {
        for Envelope { to, message } in outbox {
            self.send(to, message);
        }
    }

    /// Deliver the oldest message of the next inbox.
    ///
    /// Returns `None` when every inbox is empty.
    pub fn step(&mut self) -> Option<Delivery> {
        let to = self.next_inbox()?;
        let message = self.inboxes.get_mut(&to)?.pop_front()?;
        self.last_served = Some(to);

        let mut outbox = Outbox::new();
        let accepted = self
            .registry
            .deliver(Envelope { to, message }, &mut outbox);
        self.enqueue(outbox);
        self.delivered += 1;

        Some(Delivery { to, accepted })
    }

    /// Step until every inbox is empty or the step budget runs out.
    ///
    /// Returns the number of deliveries made.
    pub fn run_until_quiescent(&mut self) -> usize {
        let mut steps = 0;
        while steps < self.max_steps {
            if self.step().is_none() {
                debug!(steps, "Mesh quiescent");
                return steps;
            }
            steps += 1;
        }
        if self.pending() > 0 {
            warn!(steps, pending = self.pending(), "Step budget exhausted with messages in flight");
        }
        steps
    }

    fn next_inbox(&mut self) -> Option<NodeId> {
        let ready: Vec<NodeId> = self
            .inboxes
            .iter()
            .filter(|(_, inbox)| !inbox.is_empty())
            .map(|(id, _)| *id)
            .collect();

        if ready.is_empty() {
            return None;
        }

        match self.order {
            QueueOrder::RoundRobin => {
                let after_last = self
                    .last_served
                    .and_then(|last| ready.iter().find(|id| **id > last).copied());
                Some(after_last.unwrap_or(ready[0]))
            }
            QueueOrder::Seeded => Some(ready[self.rng.gen_range(0..ready.len())]),
        }
    }

    /// Messages waiting across all inboxes.
    pub fn pending(&self) -> usize {
        self.inboxes.values().map(VecDeque::len).sum()
    }

    /// Messages waiting for `node`.
    pub fn pending_for(&self, node: NodeId) -> usize {
        self.inboxes.get(&node).map_or(0, VecDeque::len)
    }

    /// Total deliveries made so far.
    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    /// Drop `excluded` from `node`'s view.
    pub fn simulate_partition(&mut self, node: NodeId, excluded: &[NodeId]) -> Result<()> {
        self.registry.simulate_partition(node, excluded)
    }

    /// Permanently deactivate `node`. Queued messages for it stay queued and
    /// are refused on delivery.
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

    /// The event timeline.
    pub fn events(&self) -> &[MeshEvent<S>] {
        self.registry.events()
    }

    /// The underlying registry.
    pub fn registry(&self) -> &Registry<S> {
        &self.registry
    }

    /// Mutable access for wiring.
    pub fn registry_mut(&mut self) -> &mut Registry<S> {
        &mut self.registry
    }

    /// Give back the underlying registry, discarding undelivered messages.
    pub fn into_registry(self) -> Registry<S> {
        self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ids(raw: &[u64]) -> Vec<NodeId> {
        raw.iter().copied().map(NodeId).collect()
    }

    fn scheduler(order: QueueOrder, seed: u64, nodes: &[u64]) -> Scheduler<u64> {
        let config = SimulationConfig::default().with_order(order).with_seed(seed);
        let mut sched = Scheduler::new(&config);
        sched.registry_mut().full_mesh(&ids(nodes)).unwrap();
        sched
    }

    #[test]
    fn propose_only_enqueues() {
        let mut sched = scheduler(QueueOrder::RoundRobin, 0, &[1, 2, 3]);
        assert!(sched.propose(NodeId(1), 1).unwrap());

        assert_eq!(sched.pending(), 2);
        assert_eq!(sched.pending_for(NodeId(2)), 1);
        assert_eq!(sched.consensus_state(NodeId(2)).unwrap(), None);
    }

    #[test]
    fn round_robin_cycles_by_id() {
        let mut sched = scheduler(QueueOrder::RoundRobin, 0, &[1, 2, 3]);
        sched.propose(NodeId(1), 1).unwrap();

        // Inboxes: 2:[P] 3:[P]
        assert_eq!(sched.step().map(|d| d.to), Some(NodeId(2)));
        // Inboxes: 1:[V2] 3:[P] → next after 2 is 3
        assert_eq!(sched.step().map(|d| d.to), Some(NodeId(3)));
        // Inboxes: 1:[V2, V3] → wraps to 1
        assert_eq!(sched.step().map(|d| d.to), Some(NodeId(1)));
        assert_eq!(sched.step().map(|d| d.to), Some(NodeId(1)));
        assert_eq!(sched.step(), None);

        assert!(sched.registry().node(NodeId(1)).unwrap().consensus_reached());
        assert_eq!(sched.delivered(), 4);
    }

    #[test]
    fn interleaved_proposals_can_both_reach_quorum() {
        let mut sched = scheduler(QueueOrder::RoundRobin, 0, &[1, 2, 3]);
        sched.propose(NodeId(1), 1).unwrap();
        sched.propose(NodeId(2), 2).unwrap();
        sched.run_until_quiescent();

        // Node 3 saw 1 before 2, node 2 rejected 1 because it holds 2
        let n1 = sched.registry().node(NodeId(1)).unwrap();
        let n2 = sched.registry().node(NodeId(2)).unwrap();
        assert!(n2.consensus_reached());
        assert_eq!(n2.consensus_state(), Some(&2));
        assert_eq!(n1.vote_count(&1), 1);
        assert!(!n1.consensus_reached());
        assert_eq!(sched.consensus_state(NodeId(3)).unwrap(), Some(&2));
    }

    #[test]
    fn failed_recipient_refuses_queued_message() {
        let mut sched = scheduler(QueueOrder::RoundRobin, 0, &[1, 2]);
        sched.propose(NodeId(1), 1).unwrap();
        sched.simulate_failure(NodeId(2)).unwrap();

        let delivery = sched.step().unwrap();
        assert_eq!(delivery, Delivery { to: NodeId(2), accepted: false });
        assert_eq!(sched.pending(), 0);
    }

    #[test]
    fn step_budget_stops_run() {
        let config = SimulationConfig::default().with_max_steps(1);
        let mut sched: Scheduler<u64> = Scheduler::new(&config);
        sched.registry_mut().full_mesh(&ids(&[1, 2, 3])).unwrap();
        sched.propose(NodeId(1), 1).unwrap();

        assert_eq!(sched.run_until_quiescent(), 1);
        assert!(sched.pending() > 0);
    }

    #[test]
    fn seeded_order_is_reproducible() {
        let run = |seed| {
            let mut sched = scheduler(QueueOrder::Seeded, seed, &[1, 2, 3, 4, 5]);
            sched.propose(NodeId(1), 1).unwrap();
            sched.propose(NodeId(3), 2).unwrap();
            let mut order = Vec::new();
            while let Some(d) = sched.step() {
                order.push(d.to);
            }
            order
        };

        assert_eq!(run(11), run(11));
    }

    proptest! {
        #[test]
        fn any_order_preserves_invariants(seed in 0u64..500, first in 1u64..10, second in 1u64..10) {
            let mut sched = scheduler(QueueOrder::Seeded, seed, &[1, 2, 3, 4]);
            sched.propose(NodeId(1), first).unwrap();
            sched.propose(NodeId(4), second).unwrap();
            sched.run_until_quiescent();
            prop_assert_eq!(sched.pending(), 0);

            let highest = first.max(second);
            for node in sched.registry().nodes() {
                // No node ends above the highest proposal, and a node that
                // latched agreed on a proposed value
                let state = node.consensus_state().copied();
                prop_assert!(state <= Some(highest));
                if node.consensus_reached() {
                    prop_assert!(state == Some(first) || state == Some(second));
                }
                // Never more voters than neighbors
                for s in [first, second] {
                    if let Some(voters) = node.voters(&s) {
                        prop_assert!(voters.len() <= node.neighbors().len());
                    }
                }
            }
        }
    }
}
