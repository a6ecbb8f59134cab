//! Shared error type for controller and agent code

use crate::rpc::RpcError;

/// Errors raised anywhere in the control plane
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("virtual machine not found: {0}")]
    VmNotFound(String),

    #[error("volume not found: {0}")]
    VolumeNotFound(String),

    #[error("storage pool not found: {0}")]
    PoolNotFound(String),

    #[error("network not found: {0}")]
    NetworkNotFound(String),

    #[error("snapshot not found: {0}")]
    SnapshotNotFound(String),

    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("no available address in network {0}")]
    IpExhausted(String),

    #[error("node is offline: {0}")]
    NodeOffline(String),

    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("invalid or expired session")]
    InvalidSession,

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("hypervisor error: {0}")]
    Hypervisor(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("rpc error: {0}")]
    Rpc(#[from] RpcError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("system error: {0}")]
    System(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True when retrying the same request later could succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::NodeOffline(_) => true,
            Error::Rpc(e) => e.is_retryable(),
            _ => false,
        }
    }
}
