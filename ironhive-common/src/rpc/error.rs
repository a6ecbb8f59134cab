//! Closed error-code set for the RPC protocol

use serde::{Deserialize, Serialize};

/// Protocol error codes. The set is closed so the controller can branch on
/// codes instead of matching message strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RpcErrorCode {
    InvalidRequest,
    MethodNotFound,
    Timeout,
    TransportClosed,
    TransportSuperseded,
    Unauthorized,
    NodeOffline,
    VmNotFound,
    VolumeNotFound,
    NetworkNotFound,
    SnapshotNotFound,
    PoolNotFound,
    IpExhausted,
    PreconditionFailed,
    HypervisorError,
    StorageError,
    NetworkError,
    InternalError,
}

impl RpcErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RpcErrorCode::InvalidRequest => "INVALID_REQUEST",
            RpcErrorCode::MethodNotFound => "METHOD_NOT_FOUND",
            RpcErrorCode::Timeout => "TIMEOUT",
            RpcErrorCode::TransportClosed => "TRANSPORT_CLOSED",
            RpcErrorCode::TransportSuperseded => "TRANSPORT_SUPERSEDED",
            RpcErrorCode::Unauthorized => "UNAUTHORIZED",
            RpcErrorCode::NodeOffline => "NODE_OFFLINE",
            RpcErrorCode::VmNotFound => "VM_NOT_FOUND",
            RpcErrorCode::VolumeNotFound => "VOLUME_NOT_FOUND",
            RpcErrorCode::NetworkNotFound => "NETWORK_NOT_FOUND",
            RpcErrorCode::SnapshotNotFound => "SNAPSHOT_NOT_FOUND",
            RpcErrorCode::PoolNotFound => "POOL_NOT_FOUND",
            RpcErrorCode::IpExhausted => "IP_EXHAUSTED",
            RpcErrorCode::PreconditionFailed => "PRECONDITION_FAILED",
            RpcErrorCode::HypervisorError => "HYPERVISOR_ERROR",
            RpcErrorCode::StorageError => "STORAGE_ERROR",
            RpcErrorCode::NetworkError => "NETWORK_ERROR",
            RpcErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }

    /// Map a wire code back into the closed set. Unknown codes collapse to
    /// `InternalError` rather than failing the whole frame.
    pub fn parse(code: &str) -> Self {
        match code {
            "INVALID_REQUEST" => RpcErrorCode::InvalidRequest,
            "METHOD_NOT_FOUND" => RpcErrorCode::MethodNotFound,
            "TIMEOUT" => RpcErrorCode::Timeout,
            "TRANSPORT_CLOSED" => RpcErrorCode::TransportClosed,
            "TRANSPORT_SUPERSEDED" => RpcErrorCode::TransportSuperseded,
            "UNAUTHORIZED" => RpcErrorCode::Unauthorized,
            "NODE_OFFLINE" => RpcErrorCode::NodeOffline,
            "VM_NOT_FOUND" => RpcErrorCode::VmNotFound,
            "VOLUME_NOT_FOUND" => RpcErrorCode::VolumeNotFound,
            "NETWORK_NOT_FOUND" => RpcErrorCode::NetworkNotFound,
            "SNAPSHOT_NOT_FOUND" => RpcErrorCode::SnapshotNotFound,
            "POOL_NOT_FOUND" => RpcErrorCode::PoolNotFound,
            "IP_EXHAUSTED" => RpcErrorCode::IpExhausted,
            "PRECONDITION_FAILED" => RpcErrorCode::PreconditionFailed,
            "HYPERVISOR_ERROR" => RpcErrorCode::HypervisorError,
            "STORAGE_ERROR" => RpcErrorCode::StorageError,
            "NETWORK_ERROR" => RpcErrorCode::NetworkError,
            _ => RpcErrorCode::InternalError,
        }
    }
}

/// An RPC-level failure
#[derive(Debug, Clone, thiserror::Error)]
#[error("{}: {message}", .code.as_str())]
pub struct RpcError {
    pub code: RpcErrorCode,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl RpcError {
    pub fn new(code: RpcErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(RpcErrorCode::Timeout, message)
    }

    pub fn transport_closed() -> Self {
        Self::new(RpcErrorCode::TransportClosed, "connection closed")
    }

    pub fn superseded() -> Self {
        Self::new(
            RpcErrorCode::TransportSuperseded,
            "a newer connection for this node replaced the session",
        )
    }

    pub fn node_offline(node_id: &str) -> Self {
        Self::new(
            RpcErrorCode::NodeOffline,
            format!("node {} has no live agent session", node_id),
        )
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            RpcErrorCode::MethodNotFound,
            format!("no such method: {}", method),
        )
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(RpcErrorCode::InvalidRequest, message)
    }

    /// Timeouts and closed transports leave the operation in doubt; the
    /// caller may retry with the same task id.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.code,
            RpcErrorCode::Timeout
                | RpcErrorCode::TransportClosed
                | RpcErrorCode::TransportSuperseded
                | RpcErrorCode::NodeOffline
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_round_trip() {
        for code in [
            RpcErrorCode::InvalidRequest,
            RpcErrorCode::Timeout,
            RpcErrorCode::TransportSuperseded,
            RpcErrorCode::IpExhausted,
            RpcErrorCode::HypervisorError,
        ] {
            assert_eq!(RpcErrorCode::parse(code.as_str()), code);
        }
    }

    #[test]
    fn test_unknown_code_collapses() {
        assert_eq!(
            RpcErrorCode::parse("SOMETHING_NEW"),
            RpcErrorCode::InternalError
        );
    }

    #[test]
    fn test_retryable() {
        assert!(RpcError::timeout("t").is_retryable());
        assert!(RpcError::transport_closed().is_retryable());
        assert!(!RpcError::new(RpcErrorCode::HypervisorError, "boom").is_retryable());
    }
}
