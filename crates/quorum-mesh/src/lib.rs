//! Quorum Mesh
//!
//! Wiring and delivery for [`quorum_consensus`] nodes.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  Registry                                                │
//! │    nodes: BTreeMap<NodeId, Node<S>>   (owns every node)  │
//! │    events: EventLog<S>                (timeline)         │
//! └────────────────────────┬─────────────────────────────────┘
//!                          │ Outbox → Envelope { to, message }
//!          ┌───────────────┼────────────────────┐
//!          ▼               ▼                    ▼
//!   Mesh (depth-first)  Scheduler (inboxes)  ActorMesh (tokio tasks)
//! ```
//!
//! Nodes only know their neighbors by id; the registry resolves ids, so the
//! topology can hold cycles without ownership cycles.
//!
//! # Drivers
//!
//! - [`Mesh`]: a send completes only once the recipient and everything it
//!   triggers has been handled. Deterministic, call-stack ordering.
//! - [`Scheduler`]: per-node FIFO inboxes, drained round-robin or in a
//!   seeded random order.
//! - [`ActorMesh`]: one task and one channel per node, real interleaving.
//!
//! # Usage
//!
//! ```
//! use quorum_mesh::{Mesh, NodeId};
//!
//! let mut mesh: Mesh<u64> = Mesh::default();
//! mesh.full_mesh(&[NodeId(1), NodeId(2), NodeId(3)]).unwrap();
//!
//! assert!(mesh.propose(NodeId(1), 1).unwrap());
//! assert!(mesh.node(NodeId(1)).unwrap().consensus_reached());
//! ```

mod actor;
mod config;
mod error;
mod events;
mod mesh;
mod registry;
mod scenario;
mod scheduler;

pub use actor::ActorMesh;
pub use config::{DeliveryMode, QueueOrder, SimulationConfig};
pub use error::{Error, Result};
pub use events::{EventLog, MeshEvent};
pub use mesh::Mesh;
pub use registry::Registry;
pub use scenario::{Scenario, ScenarioReport, ScenarioStep, Topology};
pub use scheduler::{Delivery, Scheduler};

// Re-export core protocol types for convenience
pub use quorum_consensus::{Envelope, Message, Node, NodeId, NodeSnapshot, Outbox, StateValue};
