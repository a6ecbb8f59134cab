//! Controller connection
//!
//! The agent dials the controller's `/ws/agent` endpoint, registers with
//! its node identity and shared-secret token, then serves inbound RPC
//! until the connection drops. Reconnection uses a fixed backoff; every
//! connect re-registers and re-pushes the node inventory.

use futures::{SinkExt, StreamExt};
use ironhive_common::rpc::types::{HeartbeatNotice, RegisterRequest, RegisterResponse};
use ironhive_common::rpc::{methods, MessageType, RpcMessage, RpcRouter};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::config::AgentConfig;
use crate::node;
use crate::task_cache::TaskCache;

pub struct WsClient {
    config: AgentConfig,
    router: Arc<RpcRouter>,
    cache: TaskCache,
    /// request id -> task id, for mapping rpc.cancel onto running work
    in_flight: Arc<Mutex<HashMap<String, String>>>,
}

impl WsClient {
    pub fn new(config: AgentConfig, router: Arc<RpcRouter>, cache: TaskCache) -> Self {
        Self {
            config,
            router,
            cache,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Connect forever; every close waits the fixed backoff and retries
    pub async fn run(&self) {
        loop {
            info!(server = %self.config.server_url, "connecting to controller");
            match self.connect_and_run().await {
                Ok(()) => info!("connection closed"),
                Err(e) => error!("connection error: {}", e),
            }
            warn!(
                "reconnecting in {} seconds",
                self.config.reconnect_backoff.as_secs()
            );
            tokio::time::sleep(self.config.reconnect_backoff).await;
        }
    }

    async fn connect_and_run(&self) -> anyhow::Result<()> {
        let (ws_stream, _) = connect_async(&self.config.server_url).await?;
        let (mut sink, mut stream) = ws_stream.split();

        // Registration is the first frame, and its response must arrive
        // before anything else is sent.
        let register = RpcMessage::request(
            methods::NODE_REGISTER,
            serde_json::to_value(RegisterRequest {
                node_id: self.config.node_id.clone(),
                hostname: self.config.hostname.clone(),
                ip_address: self.config.ip_address.clone(),
                token: self.config.agent_token.clone(),
            })?,
        );
        sink.send(Message::Text(register.to_json()?)).await?;

        let reply = tokio::time::timeout(std::time::Duration::from_secs(10), stream.next())
            .await
            .map_err(|_| anyhow::anyhow!("timed out waiting for registration response"))?
            .ok_or_else(|| anyhow::anyhow!("connection closed during registration"))??;
        let reply = parse_frame(reply)?;
        if reply.is_error() {
            let err = reply.error.unwrap();
            anyhow::bail!("registration rejected: {} ({})", err.message, err.code);
        }
        if let Some(resp) = reply
            .payload
            .and_then(|p| serde_json::from_value::<RegisterResponse>(p).ok())
        {
            info!("registered with controller: {}", resp.message);
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<RpcMessage>();

        // Inventory right after registration, so the controller has the
        // node's resource totals before scheduling anything onto it.
        let node_id = self.config.node_id.clone();
        let inventory_tx = tx.clone();
        tokio::task::spawn_blocking(move || {
            let inventory = node::collect_inventory(&node_id);
            if let Ok(payload) = serde_json::to_value(&inventory) {
                let _ = inventory_tx.send(RpcMessage::notification(methods::NODE_INVENTORY, payload));
            }
        });

        // Heartbeat every interval until the channel closes.
        let heartbeat_tx = tx.clone();
        let heartbeat_node = self.config.node_id.clone();
        let heartbeat_interval = self.config.heartbeat_interval;
        let heartbeat_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(heartbeat_interval);
            loop {
                interval.tick().await;
                let notice = HeartbeatNotice {
                    node_id: heartbeat_node.clone(),
                    timestamp: chrono::Utc::now().timestamp(),
                    status: "online".to_string(),
                };
                let Ok(payload) = serde_json::to_value(&notice) else { continue };
                if heartbeat_tx
                    .send(RpcMessage::notification(methods::HEARTBEAT, payload))
                    .is_err()
                {
                    break;
                }
                debug!("heartbeat sent");
            }
        });

        // Outbound pump.
        let send_task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let json = match msg.to_json() {
                    Ok(json) => json,
                    Err(e) => {
                        error!("dropping unencodable frame: {}", e);
                        continue;
                    }
                };
                if sink.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
        });

        // Inbound loop; each request is handled on its own task so a slow
        // storage operation never blocks the heartbeat or other requests.
        while let Some(frame) = stream.next().await {
            let frame = match frame {
                Ok(frame) => frame,
                Err(e) => {
                    error!("receive error: {}", e);
                    break;
                }
            };
            if matches!(frame, Message::Close(_)) {
                break;
            }
            if matches!(frame, Message::Ping(_) | Message::Pong(_)) {
                continue;
            }
            let msg = match parse_frame(frame) {
                Ok(msg) => msg,
                Err(e) => {
                    // Framing errors close the connection.
                    error!("bad frame, closing: {}", e);
                    break;
                }
            };
            self.dispatch(msg, &tx).await;
        }

        heartbeat_task.abort();
        send_task.abort();
        Ok(())
    }

    async fn dispatch(&self, msg: RpcMessage, tx: &mpsc::UnboundedSender<RpcMessage>) {
        match msg.message_type {
            MessageType::Request => {
                // Remember the task id so an rpc.cancel for this request
                // can reach the running work.
                let task_id = msg
                    .payload
                    .as_ref()
                    .and_then(|p| p.get("task_id"))
                    .and_then(|t| t.as_str())
                    .map(|t| t.to_string());
                if let Some(task_id) = &task_id {
                    self.in_flight
                        .lock()
                        .await
                        .insert(msg.id.clone(), task_id.clone());
                }

                let router = self.router.clone();
                let tx = tx.clone();
                let in_flight = self.in_flight.clone();
                let request_id = msg.id.clone();
                tokio::spawn(async move {
                    let response = router.handle_request(msg).await;
                    in_flight.lock().await.remove(&request_id);
                    if tx.send(response).is_err() {
                        debug!("response dropped; connection already closed");
                    }
                });
            }
            MessageType::Notification => {
                if msg.method.as_deref() == Some(methods::RPC_CANCEL) {
                    let cancelled_id = msg
                        .payload
                        .as_ref()
                        .and_then(|p| p.get("id"))
                        .and_then(|i| i.as_str())
                        .unwrap_or_default()
                        .to_string();
                    if let Some(task_id) = self.in_flight.lock().await.get(&cancelled_id) {
                        info!(task_id = %task_id, "cancel received for in-flight request");
                        self.cache.cancel(task_id);
                    }
                } else {
                    debug!(method = ?msg.method, "ignoring notification");
                }
            }
            MessageType::Response | MessageType::Stream => {
                // The agent never originates requests on this link.
                debug!(id = %msg.id, "ignoring unexpected frame");
            }
        }
    }
}

fn parse_frame(frame: Message) -> anyhow::Result<RpcMessage> {
    match frame {
        Message::Text(text) => Ok(RpcMessage::from_json(&text)?),
        Message::Binary(data) => {
            let text = String::from_utf8(data)?;
            Ok(RpcMessage::from_json(&text)?)
        }
        other => anyhow::bail!("unsupported frame: {:?}", other),
    }
}
