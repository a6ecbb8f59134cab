//! Correlation layer: pending-reply tracking, deadlines, cancellation
//!
//! One `RpcConnection` exists per live websocket, on both sides of the
//! protocol. Outbound frames go through an unbounded channel that the
//! socket pump drains; inbound responses resolve the matching waiter.
//! The pending-reply lock is held only for map operations, never across
//! socket I/O.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, warn};

use super::error::{RpcError, RpcErrorCode};
use super::message::{MessageType, RpcMessage};
use super::methods;

/// Default deadline for a round trip
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);
/// Deadline for long operations (migrations, image fetches, clones)
pub const LONG_CALL_TIMEOUT: Duration = Duration::from_secs(300);

type ReplyWaiter = oneshot::Sender<Result<RpcMessage, RpcError>>;

/// One side of a duplex RPC link
pub struct RpcConnection {
    pending: Arc<RwLock<HashMap<String, ReplyWaiter>>>,
    outbound: mpsc::UnboundedSender<RpcMessage>,
}

impl Clone for RpcConnection {
    fn clone(&self) -> Self {
        Self {
            pending: self.pending.clone(),
            outbound: self.outbound.clone(),
        }
    }
}

impl RpcConnection {
    /// Create a connection and the receiver end its socket pump drains
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RpcMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                pending: Arc::new(RwLock::new(HashMap::new())),
                outbound: tx,
            },
            rx,
        )
    }

    /// Send a request and wait for its response.
    ///
    /// On timeout the correlation entry is dropped locally and an
    /// `rpc.cancel` notification is emitted so the peer can abandon the
    /// job best-effort; idempotency is the method's responsibility.
    pub async fn call(
        &self,
        method: impl Into<String>,
        payload: serde_json::Value,
        timeout: Duration,
    ) -> Result<RpcMessage, RpcError> {
        let msg = RpcMessage::request(method, payload);
        let request_id = msg.id.clone();

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.write().await;
            pending.insert(request_id.clone(), tx);
        }

        if self.outbound.send(msg).is_err() {
            let mut pending = self.pending.write().await;
            pending.remove(&request_id);
            return Err(RpcError::transport_closed());
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => {
                let mut pending = self.pending.write().await;
                pending.remove(&request_id);
                Err(RpcError::transport_closed())
            }
            Err(_) => {
                {
                    let mut pending = self.pending.write().await;
                    pending.remove(&request_id);
                }
                // Advisory cancel; failure to deliver it is not an error.
                let cancel = RpcMessage::notification(
                    methods::RPC_CANCEL,
                    serde_json::json!({ "id": request_id }),
                );
                let _ = self.outbound.send(cancel);
                Err(RpcError::timeout(format!("request timed out: {}", request_id)))
            }
        }
    }

    /// Send a notification; no reply is expected
    pub fn notify(
        &self,
        method: impl Into<String>,
        payload: serde_json::Value,
    ) -> Result<(), RpcError> {
        let msg = RpcMessage::notification(method, payload);
        self.outbound
            .send(msg)
            .map_err(|_| RpcError::transport_closed())
    }

    /// Queue an already-built frame (responses, stream frames)
    pub fn send(&self, msg: RpcMessage) -> Result<(), RpcError> {
        self.outbound
            .send(msg)
            .map_err(|_| RpcError::transport_closed())
    }

    /// Resolve the waiter for an inbound response frame
    pub async fn handle_response(&self, msg: RpcMessage) {
        let waiter = {
            let mut pending = self.pending.write().await;
            pending.remove(&msg.id)
        };

        match waiter {
            Some(waiter) => {
                let result = match &msg.error {
                    Some(info) => Err(RpcError {
                        code: RpcErrorCode::parse(&info.code),
                        message: info.message.clone(),
                        details: info.details.clone(),
                    }),
                    None => Ok(msg),
                };
                if waiter.send(result).is_err() {
                    debug!("reply waiter already dropped");
                }
            }
            None => warn!(id = %msg.id, "response with no pending request"),
        }
    }

    /// Handle an inbound stream frame. A terminal frame (`completed: true`)
    /// resolves the waiter like a response; partial frames are handed back
    /// to the caller for progress bookkeeping.
    pub async fn handle_stream(&self, msg: RpcMessage) -> Option<RpcMessage> {
        debug_assert_eq!(msg.message_type, MessageType::Stream);
        if msg.is_terminal_stream() {
            let waiter = {
                let mut pending = self.pending.write().await;
                pending.remove(&msg.id)
            };
            if let Some(waiter) = waiter {
                let _ = waiter.send(Ok(msg.clone()));
            }
        }
        Some(msg)
    }

    /// Number of requests awaiting a reply
    pub async fn pending_count(&self) -> usize {
        self.pending.read().await.len()
    }

    /// Fail every in-flight request. Called when the transport closes or a
    /// newer connection supersedes this one.
    pub async fn close_with(&self, error: RpcError) {
        let mut pending = self.pending.write().await;
        for (id, waiter) in pending.drain() {
            debug!(request = %id, code = error.code.as_str(), "failing in-flight request");
            let _ = waiter.send(Err(error.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_call_resolves_on_response() {
        let (conn, mut rx) = RpcConnection::new();

        let conn2 = conn.clone();
        let server = tokio::spawn(async move {
            let req = rx.recv().await.unwrap();
            assert_eq!(req.message_type, MessageType::Request);
            conn2
                .handle_response(RpcMessage::response(req.id, json!({"ok": true})))
                .await;
        });

        let resp = conn
            .call("vm.describe", json!({"vm_id": "vm-1"}), Duration::from_secs(1))
            .await
            .unwrap();
        assert!(resp.is_success());
        server.await.unwrap();
        assert_eq!(conn.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_timeout_emits_cancel() {
        let (conn, mut rx) = RpcConnection::new();

        let err = conn
            .call("vm.stop", json!({}), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert_eq!(err.code, RpcErrorCode::Timeout);

        // First frame is the request, second the advisory cancel.
        let req = rx.recv().await.unwrap();
        let cancel = rx.recv().await.unwrap();
        assert_eq!(cancel.method.as_deref(), Some(methods::RPC_CANCEL));
        assert_eq!(cancel.payload.unwrap()["id"], req.id);
        assert_eq!(conn.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_error_response_maps_code() {
        let (conn, mut rx) = RpcConnection::new();

        let conn2 = conn.clone();
        tokio::spawn(async move {
            let req = rx.recv().await.unwrap();
            let err = RpcError::new(RpcErrorCode::StorageError, "lv missing");
            conn2
                .handle_response(RpcMessage::error_response(req.id, &err))
                .await;
        });

        let err = conn
            .call("volume.delete", json!({}), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.code, RpcErrorCode::StorageError);
    }

    #[tokio::test]
    async fn test_terminal_stream_resolves_call() {
        let (conn, mut rx) = RpcConnection::new();

        let conn2 = conn.clone();
        tokio::spawn(async move {
            let req = rx.recv().await.unwrap();
            let frame = RpcMessage::stream(req.id, json!({"progress": 100, "completed": true}));
            conn2.handle_stream(frame).await;
        });

        let resp = conn
            .call("vm.migrate", json!({}), Duration::from_secs(1))
            .await
            .unwrap();
        assert!(resp.is_terminal_stream());
    }

    #[tokio::test]
    async fn test_close_fails_in_flight() {
        let (conn, _rx) = RpcConnection::new();

        let conn2 = conn.clone();
        let call = tokio::spawn(async move {
            conn2
                .call("vm.start", json!({}), Duration::from_secs(5))
                .await
        });

        // Let the call register its waiter before draining.
        tokio::time::sleep(Duration::from_millis(20)).await;
        conn.close_with(RpcError::superseded()).await;

        let err = call.await.unwrap().unwrap_err();
        assert_eq!(err.code, RpcErrorCode::TransportSuperseded);
    }
}
