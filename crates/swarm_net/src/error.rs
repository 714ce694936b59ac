//! Network error types.

use std::time::Duration;

/// Errors that can occur in the swarm_net crate.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    /// A transport-level error (TCP connect/read/write).
    #[error("Transport error: {0}")]
    Transport(String),

    /// A peer sent something that breaks the wire protocol.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// JSON serialization / deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A host string could not be split into `hostname:port`.
    #[error("Invalid host: {0}")]
    InvalidHost(String),

    /// An operation timed out.
    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    /// The node is not running.
    #[error("Node not running")]
    NotRunning,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
