//! Gateway-wide error taxonomy.

use thiserror::Error;

/// Errors surfaced across the gateway's components.
///
/// `UntrustedPeer` is constructed only by [`crate::listener`] for logging at
/// the point of rejection; it is never returned from a public `Accept` entry
/// point (an untrusted peer is always handled by closing the connection
/// cleanly, not by propagating an error).
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("untrusted peer: {0}")]
    UntrustedPeer(String),

    #[error("cgroup operation failed: {0}")]
    CGroupError(#[source] std::io::Error),

    #[error("failed to parse exposition payload: {0}")]
    ParseError(String),

    #[error("write request missing required 'job' label")]
    InvalidLabels,

    #[error("persistence I/O error: {0}")]
    PersistenceError(#[source] std::io::Error),

    #[error("server error: {0}")]
    ServerError(String),
}

pub type Result<T> = std::result::Result<T, GatewayError>;
