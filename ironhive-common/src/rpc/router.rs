//! Method dispatch for inbound RPC requests

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tracing::{debug, warn};

use super::error::RpcError;
use super::message::RpcMessage;

type HandlerFuture = Pin<Box<dyn Future<Output = Result<serde_json::Value, RpcError>> + Send>>;
type Handler = Arc<dyn Fn(serde_json::Value) -> HandlerFuture + Send + Sync>;

/// Routes request frames to registered async handlers
#[derive(Clone, Default)]
pub struct RpcRouter {
    handlers: HashMap<String, Handler>,
}

impl RpcRouter {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler for a method name
    pub fn register<F, Fut>(&mut self, method: impl Into<String>, handler: F)
    where
        F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value, RpcError>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |payload| Box::pin(handler(payload)));
        self.handlers.insert(method.into(), handler);
    }

    /// Dispatch a request and build its response frame
    pub async fn handle_request(&self, msg: RpcMessage) -> RpcMessage {
        let method = match msg.method.as_deref() {
            Some(m) => m,
            None => {
                return RpcMessage::error_response(
                    msg.id,
                    &RpcError::invalid_request("request without a method"),
                );
            }
        };

        let handler = match self.handlers.get(method) {
            Some(h) => h.clone(),
            None => {
                warn!(method, "unhandled rpc method");
                return RpcMessage::error_response(msg.id, &RpcError::method_not_found(method));
            }
        };

        let payload = msg.payload.unwrap_or(serde_json::Value::Null);
        debug!(method, id = %msg.id, "dispatching rpc request");

        match handler(payload).await {
            Ok(result) => RpcMessage::response(msg.id, result),
            Err(err) => {
                warn!(method, id = %msg.id, code = err.code.as_str(), error = %err.message, "rpc handler failed");
                RpcMessage::error_response(msg.id, &err)
            }
        }
    }

    /// Names of every registered method, sorted
    pub fn methods(&self) -> Vec<String> {
        let mut methods: Vec<String> = self.handlers.keys().cloned().collect();
        methods.sort();
        methods
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::RpcErrorCode;
    use serde_json::json;

    #[tokio::test]
    async fn test_dispatch() {
        let mut router = RpcRouter::new();
        router.register("echo", |payload| async move { Ok(json!({ "echo": payload })) });

        let req = RpcMessage::request("echo", json!({"x": 1}));
        let resp = router.handle_request(req).await;
        assert!(resp.is_success());
        assert_eq!(resp.payload.unwrap()["echo"]["x"], 1);
    }

    #[tokio::test]
    async fn test_method_not_found() {
        let router = RpcRouter::new();
        let resp = router
            .handle_request(RpcMessage::request("nope", json!({})))
            .await;
        assert!(resp.is_error());
        assert_eq!(
            RpcErrorCode::parse(&resp.error.unwrap().code),
            RpcErrorCode::MethodNotFound
        );
    }

    #[tokio::test]
    async fn test_handler_error_propagates_code() {
        let mut router = RpcRouter::new();
        router.register("fail", |_| async {
            Err(RpcError::new(RpcErrorCode::HypervisorError, "domain gone"))
        });

        let resp = router
            .handle_request(RpcMessage::request("fail", json!({})))
            .await;
        assert_eq!(resp.error.unwrap().code, "HYPERVISOR_ERROR");
    }
}
