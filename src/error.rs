//! Error types for gridmesh
//!
//! Object-store reads and writes deliberately fail soft at their
//! boundary (empty payloads, false returns), so the error enum covers
//! the failures that do propagate: local stores, listener setup, and
//! membership validation.

use thiserror::Error;

/// Primary error type for all gridmesh operations
#[derive(Debug, Error)]
pub enum MeshError {
    /// Local association store failed
    #[error("Local state store failed: {message}")]
    LocalStoreError { message: String },

    /// Could not bind the REST listener
    #[error("Failed to bind {addr}: {reason}")]
    BindFailed { addr: String, reason: String },

    /// A peer with this id is already known
    #[error("Node id collision: {node_id}")]
    NodeIdCollision { node_id: String },

    /// A peer with this url is already known
    #[error("Node url collision: {node_url}")]
    NodeUrlCollision { node_url: String },

    /// Peer is not part of the local membership view
    #[error("Unknown node: {node_id}")]
    UnknownNode { node_id: String },
}

/// Result type alias for gridmesh operations
pub type Result<T> = std::result::Result<T, MeshError>;
