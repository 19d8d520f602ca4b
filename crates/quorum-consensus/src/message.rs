//! Protocol messages and the outbound envelope buffer.
//!
//! Message kinds form a closed set: a [`Message`] is either a proposal or a
//! vote. Nothing else can be constructed, so there is no "unknown kind" to
//! ignore at dispatch time.

use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// A node identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct NodeId(pub u64);

impl NodeId {
    /// Create a node id from its raw value.
    pub const fn new(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for NodeId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// A protocol message exchanged between neighbors.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "kind", rename_all = "snake_case"))]
pub enum Message<S> {
    /// Announces a candidate state to a neighbor.
    Proposal {
        /// The proposed state
        state: S,
        /// The proposing node
        from: NodeId,
    },

    /// Confirms to the proposer that `from` adopted `state`.
    Vote {
        /// The adopted state
        state: S,
        /// The voting node
        from: NodeId,
    },
}

impl<S> Message<S> {
    /// Build a proposal message.
    pub fn proposal(state: S, from: NodeId) -> Self {
        Message::Proposal { state, from }
    }

    /// Build a vote message.
    pub fn vote(state: S, from: NodeId) -> Self {
        Message::Vote { state, from }
    }

    /// The state value carried by this message.
    pub fn state(&self) -> &S {
        match self {
            Message::Proposal { state, .. } | Message::Vote { state, .. } => state,
        }
    }

    /// The sender of this message.
    pub fn from(&self) -> NodeId {
        match self {
            Message::Proposal { from, .. } | Message::Vote { from, .. } => *from,
        }
    }

    /// Short lowercase name of the message kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Proposal { .. } => "proposal",
            Message::Vote { .. } => "vote",
        }
    }
}

impl<S: fmt::Display> fmt::Display for Message<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Proposal { state, from } => {
                write!(f, "proposal {{ state: {}, from: {} }}", state, from)
            }
            Message::Vote { state, from } => {
                write!(f, "vote {{ state: {}, from: {} }}", state, from)
            }
        }
    }
}

/// A message addressed to a recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Envelope<S> {
    /// Recipient node
    pub to: NodeId,
    /// Message to deliver
    pub message: Message<S>,
}

/// Caller-owned buffer that a node appends outbound envelopes to.
///
/// Nodes never call each other directly. Whatever drives them drains the
/// outbox and decides when and in which order the envelopes are delivered.
#[derive(Debug, Clone)]
pub struct Outbox<S> {
    envelopes: Vec<Envelope<S>>,
}

impl<S> Default for Outbox<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> Outbox<S> {
    /// Create an empty outbox.
    pub fn new() -> Self {
        Self {
            envelopes: Vec::new(),
        }
    }

    /// Queue a message for `to`.
    pub fn send(&mut self, to: NodeId, message: Message<S>) {
        self.envelopes.push(Envelope { to, message });
    }

    /// Number of queued envelopes.
    pub fn len(&self) -> usize {
        self.envelopes.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.envelopes.is_empty()
    }

    /// Queued envelopes in send order.
    pub fn envelopes(&self) -> &[Envelope<S>] {
        &self.envelopes
    }

    /// Take every queued envelope, leaving the outbox empty.
    pub fn drain(&mut self) -> Vec<Envelope<S>> {
        std::mem::take(&mut self.envelopes)
    }
}

impl<S> IntoIterator for Outbox<S> {
    type Item = Envelope<S>;
    type IntoIter = std::vec::IntoIter<Envelope<S>>;

    fn into_iter(self) -> Self::IntoIter {
        self.envelopes.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_accessors() {
        let proposal = Message::proposal(7u64, NodeId(1));
        assert_eq!(*proposal.state(), 7);
        assert_eq!(proposal.from(), NodeId(1));
        assert_eq!(proposal.kind(), "proposal");

        let vote = Message::vote(7u64, NodeId(2));
        assert_eq!(vote.from(), NodeId(2));
        assert_eq!(vote.kind(), "vote");
    }

    #[test]
    fn message_display_is_readable() {
        let msg = Message::proposal(3u64, NodeId(2));
        assert_eq!(msg.to_string(), "proposal { state: 3, from: 2 }");

        let msg = Message::vote(1u64, NodeId(3));
        assert_eq!(msg.to_string(), "vote { state: 1, from: 3 }");
    }

    #[test]
    fn outbox_preserves_send_order() {
        let mut outbox = Outbox::new();
        outbox.send(NodeId(2), Message::proposal(1u64, NodeId(1)));
        outbox.send(NodeId(3), Message::proposal(1u64, NodeId(1)));

        assert_eq!(outbox.len(), 2);
        let drained = outbox.drain();
        assert!(outbox.is_empty());
        assert_eq!(drained[0].to, NodeId(2));
        assert_eq!(drained[1].to, NodeId(3));
    }
}
