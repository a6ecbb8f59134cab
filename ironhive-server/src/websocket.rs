//! Front-end websocket channel
//!
//! Pushes state changes to connected UIs so they never poll. Events fan
//! out through a broadcast channel in the order the controller committed
//! them; a client that falls too far behind is dropped.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::state::AppState;

/// Server -> client events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum FrontendEvent {
    VmStatusUpdate {
        vm_id: String,
        status: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        timestamp: String,
    },

    NodeStatusUpdate {
        node_id: String,
        status: String,
        timestamp: String,
    },

    TaskStatusUpdate {
        task_id: String,
        status: String,
        progress: u8,
        timestamp: String,
    },

    SystemNotification {
        level: String,
        title: String,
        message: String,
        timestamp: String,
    },

    /// Reply to a client ping
    Pong { timestamp: String },
}

/// Client -> server messages
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
enum ClientMessage {
    Ping,
}

/// Broadcast hub shared by every connected front-end
#[derive(Clone)]
pub struct WsState {
    tx: broadcast::Sender<FrontendEvent>,
}

impl WsState {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self { tx }
    }

    fn timestamp() -> String {
        chrono::Utc::now().to_rfc3339()
    }

    /// Fan an event out to every connected client
    pub fn broadcast(&self, event: FrontendEvent) {
        // send() only fails when no client is connected; that's fine.
        let _ = self.tx.send(event);
    }

    pub fn vm_status(&self, vm_id: &str, status: &str, message: Option<String>) {
        self.broadcast(FrontendEvent::VmStatusUpdate {
            vm_id: vm_id.to_string(),
            status: status.to_string(),
            message,
            timestamp: Self::timestamp(),
        });
    }

    pub fn node_status(&self, node_id: &str, status: &str) {
        self.broadcast(FrontendEvent::NodeStatusUpdate {
            node_id: node_id.to_string(),
            status: status.to_string(),
            timestamp: Self::timestamp(),
        });
    }

    pub fn task_status(&self, task_id: &str, status: &str, progress: u8) {
        self.broadcast(FrontendEvent::TaskStatusUpdate {
            task_id: task_id.to_string(),
            status: status.to_string(),
            progress,
            timestamp: Self::timestamp(),
        });
    }

    pub fn notify(&self, level: &str, title: &str, message: &str) {
        self.broadcast(FrontendEvent::SystemNotification {
            level: level.to_string(),
            title: title.to_string(),
            message: message.to_string(),
            timestamp: Self::timestamp(),
        });
    }

    fn subscribe(&self) -> broadcast::Receiver<FrontendEvent> {
        self.tx.subscribe()
    }
}

impl Default for WsState {
    fn default() -> Self {
        Self::new()
    }
}

/// `/ws/frontend` upgrade handler
pub async fn frontend_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let ws_state = state.ws.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, ws_state))
}

async fn handle_socket(socket: WebSocket, ws_state: Arc<WsState>) {
    info!("front-end websocket connected");
    let (mut sender, mut receiver) = socket.split();
    let mut rx = ws_state.subscribe();

    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Ok(event) => {
                        let Ok(json) = serde_json::to_string(&event) else { continue };
                        if sender.send(Message::Text(json)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "front-end client lagged; dropping connection");
                        break;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Ok(ClientMessage::Ping) = serde_json::from_str(&text) {
                            let pong = FrontendEvent::Pong { timestamp: WsState::timestamp() };
                            let Ok(json) = serde_json::to_string(&pong) else { continue };
                            if sender.send(Message::Text(json)).await.is_err() {
                                break;
                            }
                        } else {
                            debug!("ignoring unknown front-end message: {}", text);
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!("front-end websocket error: {}", e);
                        break;
                    }
                }
            }
        }
    }

    info!("front-end websocket closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_shape() {
        let event = FrontendEvent::VmStatusUpdate {
            vm_id: "vm-1".into(),
            status: "running".into(),
            message: None,
            timestamp: "2026-01-01T00:00:00Z".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "VmStatusUpdate");
        assert_eq!(json["data"]["vm_id"], "vm-1");
        assert!(json["data"].get("message").is_none());
    }

    #[test]
    fn test_broadcast_reaches_subscriber() {
        let state = WsState::new();
        let mut rx = state.subscribe();
        state.task_status("t1", "running", 40);

        match rx.try_recv().unwrap() {
            FrontendEvent::TaskStatusUpdate { task_id, progress, .. } => {
                assert_eq!(task_id, "t1");
                assert_eq!(progress, 40);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_events_preserve_commit_order() {
        let state = WsState::new();
        let mut rx = state.subscribe();
        state.vm_status("vm-1", "starting", None);
        state.vm_status("vm-1", "running", None);

        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        match (first, second) {
            (
                FrontendEvent::VmStatusUpdate { status: s1, .. },
                FrontendEvent::VmStatusUpdate { status: s2, .. },
            ) => {
                assert_eq!(s1, "starting");
                assert_eq!(s2, "running");
            }
            _ => panic!("unexpected event kinds"),
        }
    }

    #[test]
    fn test_client_ping_parses() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"Ping"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Ping));
    }
}
