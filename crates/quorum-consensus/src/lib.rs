//! Quorum Consensus
//!
//! A minimal broadcast-and-vote agreement protocol among mesh neighbors.
//! Each node can propose a state, broadcast it to its neighbors, collect
//! votes, and latch consensus once a majority of its neighborhood voted for
//! the same value.
//!
//! # Core Insight
//!
//! A node's quorum is measured against its *own* neighborhood, not the whole
//! mesh. Shrinking the neighborhood through a partition shrinks the quorum,
//! so a cut-off node can become trivially satisfiable.
//!
//! # Sans-IO
//!
//! [`Node`] is a plain state machine. `propose` and `receive` return whether
//! the node accepted the call and push outbound messages into an [`Outbox`].
//! Delivery ordering belongs entirely to whoever drains the outbox.
//!
//! ```
//! use quorum_consensus::{Message, Node, NodeId, Outbox};
//!
//! let mut a: Node<u64> = Node::new(NodeId(1));
//! let mut b: Node<u64> = Node::new(NodeId(2));
//! a.add_neighbor(b.id());
//! b.add_neighbor(a.id());
//!
//! let mut out = Outbox::new();
//! a.propose(1, &mut out);
//! for envelope in out.drain() {
//!     b.receive(envelope.message, &mut out);
//! }
//! for envelope in out.drain() {
//!     a.receive(envelope.message, &mut out);
//! }
//!
//! assert!(a.consensus_reached());
//! assert_eq!(b.consensus_state(), Some(&1));
//! ```
//!
//! # Threshold
//!
//! - n neighbors → ceil((n + 1) / 2) distinct voters required

mod message;
mod node;
mod threshold;

pub use message::{Envelope, Message, NodeId, Outbox};
pub use node::{Node, NodeSnapshot, StateValue};
pub use threshold::{meets_quorum, quorum_threshold, votes_needed};
