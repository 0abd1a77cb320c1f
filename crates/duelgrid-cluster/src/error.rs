//! Error type for cluster operations.

use duelgrid_protocol::ErrorCode;
use duelgrid_store::{LockError, StoreError};

/// Errors surfaced by cluster components.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Lock(#[from] LockError),

    /// A stored record failed to parse. Treated as corruption: the
    /// record is logged and skipped, never retried.
    #[error("malformed record: {0}")]
    Codec(#[from] serde_json::Error),

    /// An RPC target did not answer within the timeout, or has no
    /// listener on its action channel.
    #[error("instance {0} unavailable")]
    InstanceUnavailable(String),
}

impl ClusterError {
    /// Maps this error onto the wire-level code carried in responses.
    pub fn code(&self) -> ErrorCode {
        match self {
            ClusterError::Lock(LockError::Timeout { .. }) => ErrorCode::LockTimeout,
            ClusterError::InstanceUnavailable(_) => ErrorCode::TargetInstanceUnavailable,
            _ => ErrorCode::Internal,
        }
    }
}
