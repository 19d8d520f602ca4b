//! Error types for quorum-mesh.
//!
//! These cover caller mistakes around the protocol. The protocol itself never
//! errors: a failed node answers `false`.

use quorum_consensus::NodeId;
use thiserror::Error;

/// Result type for quorum-mesh operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while wiring or driving a mesh.
#[derive(Debug, Error)]
pub enum Error {
    /// No node with this id is registered.
    #[error("unknown node {0}")]
    UnknownNode(NodeId),

    /// A node with this id is already registered.
    #[error("node {0} already exists")]
    DuplicateNode(NodeId),

    /// Configuration value could not be parsed.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Scenario script is inconsistent.
    #[error("invalid scenario: {0}")]
    Scenario(String),

    /// The actor runtime has shut down or a node task died.
    #[error("actor runtime closed")]
    RuntimeClosed,

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
