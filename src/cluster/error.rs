//! Cluster forwarding error types.

use thiserror::Error;

/// Errors that can occur in the cluster forwarding layer.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// The consistent-hash ring has no members.
    #[error("no members registered in the ring")]
    EmptyRing,

    /// No identifying span could be extracted from the batch.
    #[error("no identifying span in batch")]
    NoRoutingKey,

    /// The picked endpoint has no usable connection yet.
    #[error("endpoint '{0}' is not ready")]
    ConnectionNotReady(String),

    /// Dialing an endpoint failed.
    #[error("dial to '{0}' failed: {1}")]
    DialFailed(String, String),

    /// Payload (de)serialization failed.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// The remote peer rejected a forward call.
    #[error("forward to '{0}' rejected: {1}")]
    Rejected(String, String),

    /// The notifier event stream was already taken.
    #[error("event stream already taken")]
    WatchTaken,

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for cluster operations.
pub type ClusterResult<T> = Result<T, ClusterError>;
