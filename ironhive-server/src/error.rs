//! Standardized error handling for API responses
//!
//! Every rejected operation returns a JSON body of the shape
//! `{"error": {"code", "message", "details?"}}` with a matching HTTP status.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use ironhive_common::rpc::RpcErrorCode;
use ironhive_common::Error;
use serde::{Deserialize, Serialize};
use tracing::error;

/// Wire shape of an API failure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// An API-layer error: a machine-readable code plus the HTTP status it
/// maps to
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "INVALID_REQUEST", message)
    }

    pub fn not_found(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, code, message)
    }

    pub fn conflict(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, code, message)
    }

    pub fn unauthorized() -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            "UNAUTHORIZED",
            "authentication credentials are invalid or missing",
        )
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, "FORBIDDEN", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(code = self.code, "api error: {}", self.message);
        }
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
                details: self.details,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        match err {
            Error::VmNotFound(id) => {
                ApiError::not_found("VM_NOT_FOUND", format!("virtual machine '{}' not found", id))
            }
            Error::VolumeNotFound(id) => {
                ApiError::not_found("VOLUME_NOT_FOUND", format!("volume '{}' not found", id))
            }
            Error::PoolNotFound(id) => {
                ApiError::not_found("POOL_NOT_FOUND", format!("storage pool '{}' not found", id))
            }
            Error::NetworkNotFound(id) => {
                ApiError::not_found("NETWORK_NOT_FOUND", format!("network '{}' not found", id))
            }
            Error::SnapshotNotFound(id) => {
                ApiError::not_found("SNAPSHOT_NOT_FOUND", format!("snapshot '{}' not found", id))
            }
            Error::NodeNotFound(id) => {
                ApiError::not_found("NODE_NOT_FOUND", format!("node '{}' not found", id))
            }
            Error::TaskNotFound(id) => {
                ApiError::not_found("TASK_NOT_FOUND", format!("task '{}' not found", id))
            }
            Error::Validation(msg) => ApiError::bad_request(msg),
            Error::Precondition(msg) => ApiError::conflict("PRECONDITION_FAILED", msg),
            Error::IpExhausted(net) => ApiError::conflict(
                "IP_EXHAUSTED",
                format!("no available address in network {}", net),
            ),
            Error::NodeOffline(node) => ApiError::conflict(
                "NODE_OFFLINE",
                format!("node {} has no live agent session", node),
            )
            .with_details(serde_json::json!({ "retryable": true })),
            Error::AuthenticationFailed | Error::InvalidSession => ApiError::unauthorized(),
            Error::PermissionDenied(msg) => ApiError::forbidden(msg),
            Error::Hypervisor(msg) => {
                ApiError::new(StatusCode::BAD_GATEWAY, "HYPERVISOR_ERROR", msg)
            }
            Error::Storage(msg) => ApiError::new(StatusCode::BAD_GATEWAY, "STORAGE_ERROR", msg),
            Error::Network(msg) => ApiError::new(StatusCode::BAD_GATEWAY, "NETWORK_ERROR", msg),
            Error::Rpc(e) => {
                let retryable = e.is_retryable();
                let status = match e.code {
                    RpcErrorCode::Timeout | RpcErrorCode::TransportClosed => StatusCode::BAD_GATEWAY,
                    RpcErrorCode::PreconditionFailed => StatusCode::CONFLICT,
                    _ => StatusCode::BAD_GATEWAY,
                };
                let mut api = ApiError::new(status, rpc_code_str(e.code), e.message);
                if retryable {
                    api = api.with_details(serde_json::json!({ "retryable": true }));
                }
                api
            }
            Error::Database(msg) => {
                error!("database error: {}", msg);
                ApiError::internal("a storage-layer error occurred")
            }
            Error::Serialization(e) => ApiError::bad_request(format!("invalid payload: {}", e)),
            Error::System(msg) => ApiError::internal(msg),
            Error::Io(e) => ApiError::internal(format!("io error: {}", e)),
        }
    }
}

fn rpc_code_str(code: RpcErrorCode) -> &'static str {
    code.as_str()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_precondition_maps_to_conflict() {
        let api: ApiError = Error::Precondition("volume is in use".into()).into();
        assert_eq!(api.status, StatusCode::CONFLICT);
        assert_eq!(api.code, "PRECONDITION_FAILED");
    }

    #[test]
    fn test_ip_exhausted_maps_to_conflict() {
        let api: ApiError = Error::IpExhausted("net-1".into()).into();
        assert_eq!(api.status, StatusCode::CONFLICT);
        assert_eq!(api.code, "IP_EXHAUSTED");
    }

    #[test]
    fn test_not_found_codes() {
        let api: ApiError = Error::VmNotFound("vm-1".into()).into();
        assert_eq!(api.status, StatusCode::NOT_FOUND);
        assert_eq!(api.code, "VM_NOT_FOUND");
        assert!(api.message.contains("vm-1"));
    }

    #[test]
    fn test_node_offline_is_retryable() {
        let api: ApiError = Error::NodeOffline("n1".into()).into();
        assert_eq!(api.status, StatusCode::CONFLICT);
        assert_eq!(api.details.unwrap()["retryable"], true);
    }

    #[test]
    fn test_error_body_shape() {
        let api = ApiError::conflict("PRECONDITION_FAILED", "stop the VM first");
        let body = ErrorBody {
            error: ErrorDetail {
                code: api.code.to_string(),
                message: api.message.clone(),
                details: None,
            },
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["error"]["code"], "PRECONDITION_FAILED");
        assert!(json["error"].get("details").is_none());
    }
}
