//! Mesh events for the run timeline.

use quorum_consensus::{Message, NodeId};
use serde::{Deserialize, Serialize};

/// Events that occur while a mesh is wired and driven.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MeshEvent<S> {
    /// A node was registered
    NodeAdded { node: NodeId, seq: u64 },

    /// A node added a neighbor to its view
    NeighborAdded {
        node: NodeId,
        neighbor: NodeId,
        threshold: usize,
        seq: u64,
    },

    /// A node was asked to propose a state
    Proposed {
        node: NodeId,
        state: S,
        accepted: bool,
        seq: u64,
    },

    /// A message reached its recipient (`accepted` is false if it has failed)
    Delivered {
        to: NodeId,
        message: Message<S>,
        accepted: bool,
        seq: u64,
    },

    /// A message was addressed to a node that is not registered
    Undeliverable {
        to: NodeId,
        message: Message<S>,
        seq: u64,
    },

    /// A node dropped neighbors from its view
    Partitioned {
        node: NodeId,
        excluded: Vec<NodeId>,
        remaining: usize,
        threshold: usize,
        seq: u64,
    },

    /// A node failed permanently
    Failed { node: NodeId, seq: u64 },

    /// A node latched consensus
    ConsensusReached { node: NodeId, state: S, seq: u64 },
}

impl<S> MeshEvent<S> {
    /// Get the sequence number for this event.
    pub fn seq(&self) -> u64 {
        match self {
            MeshEvent::NodeAdded { seq, .. } => *seq,
            MeshEvent::NeighborAdded { seq, .. } => *seq,
            MeshEvent::Proposed { seq, .. } => *seq,
            MeshEvent::Delivered { seq, .. } => *seq,
            MeshEvent::Undeliverable { seq, .. } => *seq,
            MeshEvent::Partitioned { seq, .. } => *seq,
            MeshEvent::Failed { seq, .. } => *seq,
            MeshEvent::ConsensusReached { seq, .. } => *seq,
        }
    }
}

/// Ordered record of [`MeshEvent`]s.
#[derive(Debug, Clone)]
pub struct EventLog<S> {
    events: Vec<MeshEvent<S>>,
    next_seq: u64,
    enabled: bool,
}

impl<S> EventLog<S> {
    /// Create a log; a disabled log drops everything it is given.
    pub fn new(enabled: bool) -> Self {
        Self {
            events: Vec::new(),
            next_seq: 0,
            enabled,
        }
    }

    /// Record an event built from the next sequence number.
    pub fn record<F>(&mut self, build: F)
    where
        F: FnOnce(u64) -> MeshEvent<S>,
    {
        if !self.enabled {
            return;
        }
        let event = build(self.next_seq);
        self.next_seq += 1;
        self.events.push(event);
    }

    /// All recorded events in order.
    pub fn events(&self) -> &[MeshEvent<S>] {
        &self.events
    }

    /// Number of recorded events.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Take the recorded events, leaving the log empty.
    pub fn into_events(self) -> Vec<MeshEvent<S>> {
        self.events
    }
}
