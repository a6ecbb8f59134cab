//! RPC frame definition and JSON codec

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::{RpcError, RpcErrorCode};

/// Hard cap on a single encoded frame. Larger payloads must stream.
pub const MAX_FRAME_BYTES: usize = 10 * 1024 * 1024;

/// Frame kind
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    /// Expects exactly one response sharing its id
    Request,
    /// Answers a request
    Response,
    /// Fire-and-forget
    Notification,
    /// Progress data sharing a request's id
    Stream,
}

/// A single frame on the wire
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcMessage {
    pub id: String,

    #[serde(rename = "type")]
    pub message_type: MessageType,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorInfo>,
}

/// Error carried inside a response frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcErrorInfo {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl RpcMessage {
    pub fn request(method: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: format!("req-{}", Uuid::new_v4()),
            message_type: MessageType::Request,
            method: Some(method.into()),
            payload: Some(payload),
            error: None,
        }
    }

    pub fn response(id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            message_type: MessageType::Response,
            method: None,
            payload: Some(payload),
            error: None,
        }
    }

    pub fn error_response(id: impl Into<String>, error: &RpcError) -> Self {
        Self {
            id: id.into(),
            message_type: MessageType::Response,
            method: None,
            payload: None,
            error: Some(RpcErrorInfo {
                code: error.code.as_str().to_string(),
                message: error.message.clone(),
                details: error.details.clone(),
            }),
        }
    }

    pub fn notification(method: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: format!("ntf-{}", Uuid::new_v4()),
            message_type: MessageType::Notification,
            method: Some(method.into()),
            payload: Some(payload),
            error: None,
        }
    }

    pub fn stream(id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            message_type: MessageType::Stream,
            method: None,
            payload: Some(payload),
            error: None,
        }
    }

    /// Encode to a JSON text frame, enforcing the frame size cap
    pub fn to_json(&self) -> Result<String, RpcError> {
        let json = serde_json::to_string(self)
            .map_err(|e| RpcError::new(RpcErrorCode::InternalError, e.to_string()))?;
        if json.len() > MAX_FRAME_BYTES {
            return Err(RpcError::new(
                RpcErrorCode::InvalidRequest,
                format!("frame exceeds {} byte limit", MAX_FRAME_BYTES),
            ));
        }
        Ok(json)
    }

    /// Decode a JSON text frame, enforcing the frame size cap
    pub fn from_json(json: &str) -> Result<Self, RpcError> {
        if json.len() > MAX_FRAME_BYTES {
            return Err(RpcError::new(
                RpcErrorCode::InvalidRequest,
                format!("frame exceeds {} byte limit", MAX_FRAME_BYTES),
            ));
        }
        serde_json::from_str(json)
            .map_err(|e| RpcError::new(RpcErrorCode::InvalidRequest, format!("bad frame: {}", e)))
    }

    pub fn is_success(&self) -> bool {
        self.message_type == MessageType::Response && self.error.is_none()
    }

    pub fn is_error(&self) -> bool {
        self.message_type == MessageType::Response && self.error.is_some()
    }

    /// True for a stream frame whose payload carries `completed: true`
    pub fn is_terminal_stream(&self) -> bool {
        self.message_type == MessageType::Stream
            && self
                .payload
                .as_ref()
                .and_then(|p| p.get("completed"))
                .and_then(|c| c.as_bool())
                .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_frame() {
        let msg = RpcMessage::request("vm.describe", json!({"vm_id": "vm-1"}));
        assert_eq!(msg.message_type, MessageType::Request);
        assert_eq!(msg.method.as_deref(), Some("vm.describe"));
        assert!(msg.id.starts_with("req-"));
    }

    #[test]
    fn test_response_reuses_id() {
        let msg = RpcMessage::response("req-123", json!({"state": "running"}));
        assert_eq!(msg.id, "req-123");
        assert!(msg.is_success());
        assert!(!msg.is_error());
    }

    #[test]
    fn test_error_response() {
        let err = RpcError::new(RpcErrorCode::VmNotFound, "no such domain");
        let msg = RpcMessage::error_response("req-123", &err);
        assert!(msg.is_error());
        assert_eq!(msg.error.as_ref().unwrap().code, "VM_NOT_FOUND");
    }

    #[test]
    fn test_json_round_trip() {
        let msg = RpcMessage::request("volume.create", json!({"size_gb": 10}));
        let json = msg.to_json().unwrap();
        let parsed = RpcMessage::from_json(&json).unwrap();
        assert_eq!(parsed.id, msg.id);
        assert_eq!(parsed.message_type, msg.message_type);
        assert_eq!(parsed.method, msg.method);
    }

    #[test]
    fn test_wire_shape_uses_type_tag() {
        let msg = RpcMessage::notification("heartbeat", json!({"node_id": "n1"}));
        let json = msg.to_json().unwrap();
        assert!(json.contains("\"type\":\"notification\""));
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let big = "x".repeat(MAX_FRAME_BYTES);
        let msg = RpcMessage::request("volume.create", json!({ "blob": big }));
        assert!(msg.to_json().is_err());
    }

    #[test]
    fn test_terminal_stream() {
        let done = RpcMessage::stream("req-1", json!({"progress": 100, "completed": true}));
        let partial = RpcMessage::stream("req-1", json!({"progress": 40}));
        assert!(done.is_terminal_stream());
        assert!(!partial.is_terminal_stream());
    }
}
