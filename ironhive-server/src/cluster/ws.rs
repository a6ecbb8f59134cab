//! `/ws/agent` endpoint
//!
//! Accepts the agent's websocket, performs the `node.register` handshake
//! (including the shared-secret check), then pumps frames between the
//! socket and the session's RPC connection until either side closes.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use ironhive_common::rpc::types::{HeartbeatNotice, NodeInventory, RegisterRequest, RegisterResponse};
use ironhive_common::rpc::{methods, MessageType, RpcError, RpcMessage};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::registry::AgentSession;
use crate::db::nodes;
use crate::state::AppState;

const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn agent_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_agent_socket(socket, state))
}

async fn handle_agent_socket(socket: WebSocket, state: Arc<AppState>) {
    info!("agent websocket connected");
    let (mut sender, mut receiver) = socket.split();

    let register = match wait_for_registration(&mut receiver, &state).await {
        Ok(register) => register,
        Err((request_id, err)) => {
            warn!("agent registration rejected: {}", err.message);
            if let Some(id) = request_id {
                let _ = send_frame(&mut sender, RpcMessage::error_response(id, &err)).await;
            }
            let _ = sender.close().await;
            return;
        }
    };
    let (request_id, register) = register;

    // Authoritative node row first, then the in-memory session.
    let node = match nodes::upsert_registration(
        state.db.pool(),
        &register.node_id,
        &register.hostname,
        &register.ip_address,
    )
    .await
    {
        Ok(node) => node,
        Err(e) => {
            error!(node = %register.node_id, "failed to persist registration: {}", e);
            let err = RpcError::new(
                ironhive_common::rpc::RpcErrorCode::InternalError,
                "registration could not be persisted",
            );
            let _ = send_frame(&mut sender, RpcMessage::error_response(request_id, &err)).await;
            let _ = sender.close().await;
            return;
        }
    };
    state.ws.node_status(&node.id, "online");

    let (session, mut outbound) = state
        .registry
        .register(&register.node_id, &register.hostname, &register.ip_address)
        .await;

    let accepted = RegisterResponse {
        accepted: true,
        message: format!("node {} registered", register.node_id),
    };
    if send_frame(
        &mut sender,
        RpcMessage::response(request_id, serde_json::to_value(&accepted).unwrap_or_default()),
    )
    .await
    .is_err()
    {
        state.registry.unregister(&session).await;
        return;
    }

    // Outbound pump: registry -> socket, until shutdown or send failure.
    let pump_session = session.clone();
    let mut send_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                msg = outbound.recv() => {
                    let Some(msg) = msg else { break };
                    let json = match msg.to_json() {
                        Ok(json) => json,
                        Err(e) => {
                            error!("dropping unencodable frame: {}", e);
                            continue;
                        }
                    };
                    if sender.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                _ = pump_session.wait_closed() => {
                    let _ = sender.close().await;
                    break;
                }
            }
        }
    });

    // Inbound pump: socket -> session.
    let recv_state = state.clone();
    let recv_session = session.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(result) = receiver.next().await {
            match result {
                Ok(msg) => {
                    if let Err(e) = handle_inbound(msg, &recv_session, &recv_state).await {
                        // A framing error closes the connection.
                        warn!(node = %recv_session.node_id, "closing agent socket: {}", e.message);
                        break;
                    }
                }
                Err(e) => {
                    debug!(node = %recv_session.node_id, "agent socket error: {}", e);
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => { recv_task.abort(); }
        _ = &mut recv_task => { send_task.abort(); }
    }

    // All in-flight requests fail; the node row flips offline only when
    // the heartbeat sweep notices, or when the agent re-registers first.
    session.shutdown(RpcError::transport_closed()).await;
    state.registry.unregister(&session).await;
    info!(node = %session.node_id, "agent websocket closed");
}

type WsSender = SplitSink<WebSocket, Message>;
type WsReceiver = SplitStream<WebSocket>;

async fn send_frame(sender: &mut WsSender, msg: RpcMessage) -> Result<(), RpcError> {
    let json = msg.to_json()?;
    sender
        .send(Message::Text(json))
        .await
        .map_err(|_| RpcError::transport_closed())
}

/// The first frame must be a `node.register` request with a valid token
async fn wait_for_registration(
    receiver: &mut WsReceiver,
    state: &AppState,
) -> Result<(String, RegisterRequest), (Option<String>, RpcError)> {
    let frame = tokio::time::timeout(REGISTRATION_TIMEOUT, receiver.next())
        .await
        .map_err(|_| (None, RpcError::invalid_request("registration timed out")))?
        .ok_or_else(|| (None, RpcError::transport_closed()))?
        .map_err(|_| (None, RpcError::transport_closed()))?;

    let msg = parse_frame(frame).map_err(|e| (None, e))?;

    if msg.message_type != MessageType::Request
        || msg.method.as_deref() != Some(methods::NODE_REGISTER)
    {
        return Err((
            Some(msg.id),
            RpcError::invalid_request("first frame must be a node.register request"),
        ));
    }

    let payload = msg
        .payload
        .clone()
        .ok_or_else(|| (Some(msg.id.clone()), RpcError::invalid_request("missing payload")))?;
    let register: RegisterRequest = serde_json::from_value(payload)
        .map_err(|e| (Some(msg.id.clone()), RpcError::invalid_request(format!("bad register payload: {}", e))))?;

    if register.token != state.config.agent_token {
        return Err((
            Some(msg.id),
            RpcError::new(
                ironhive_common::rpc::RpcErrorCode::Unauthorized,
                "agent token mismatch",
            ),
        ));
    }

    Ok((msg.id, register))
}

fn parse_frame(msg: Message) -> Result<RpcMessage, RpcError> {
    match msg {
        Message::Text(text) => RpcMessage::from_json(&text),
        Message::Binary(data) => {
            let text = String::from_utf8(data)
                .map_err(|e| RpcError::invalid_request(format!("non-utf8 frame: {}", e)))?;
            RpcMessage::from_json(&text)
        }
        Message::Close(_) => Err(RpcError::transport_closed()),
        // Control frames are handled by axum; nothing to do here.
        Message::Ping(_) | Message::Pong(_) => Ok(RpcMessage::notification(
            "ws.control",
            serde_json::Value::Null,
        )),
    }
}

async fn handle_inbound(
    ws_msg: Message,
    session: &Arc<AgentSession>,
    state: &Arc<AppState>,
) -> Result<(), RpcError> {
    if matches!(ws_msg, Message::Ping(_) | Message::Pong(_)) {
        return Ok(());
    }
    if matches!(ws_msg, Message::Close(_)) {
        return Err(RpcError::transport_closed());
    }
    let msg = parse_frame(ws_msg)?;

    match msg.message_type {
        MessageType::Response => {
            session.conn.handle_response(msg).await;
            Ok(())
        }
        MessageType::Stream => {
            if let Some(frame) = session.conn.handle_stream(msg).await {
                apply_stream_progress(&frame, state).await;
            }
            Ok(())
        }
        MessageType::Notification => {
            handle_notification(msg, session, state).await;
            Ok(())
        }
        MessageType::Request => {
            // Registration already happened; agents issue no further
            // requests on this surface.
            let method = msg.method.clone().unwrap_or_default();
            let response = RpcMessage::error_response(msg.id, &RpcError::method_not_found(&method));
            let _ = session.conn.send(response);
            Ok(())
        }
    }
}

/// Stream frames carry `{task_id, progress}`; fold them into the task row
async fn apply_stream_progress(frame: &RpcMessage, state: &Arc<AppState>) {
    let Some(payload) = frame.payload.as_ref() else { return };
    let Some(task_id) = payload.get("task_id").and_then(|t| t.as_str()) else { return };
    let progress = payload
        .get("progress")
        .or_else(|| payload.get("progress_percent"))
        .and_then(|p| p.as_u64())
        .unwrap_or(0) as u8;

    if let Err(e) = state.tasks.progress(task_id, progress).await {
        debug!(task_id, "failed to record stream progress: {}", e);
    }
}

async fn handle_notification(msg: RpcMessage, session: &Arc<AgentSession>, state: &Arc<AppState>) {
    let Some(method) = msg.method.as_deref() else {
        warn!("notification without method");
        return;
    };

    match method {
        methods::HEARTBEAT => {
            session.touch_heartbeat().await;
            let node_id = msg
                .payload
                .as_ref()
                .and_then(|p| serde_json::from_value::<HeartbeatNotice>(p.clone()).ok())
                .map(|h| h.node_id)
                .unwrap_or_else(|| session.node_id.clone());
            if let Err(e) = nodes::touch_heartbeat(state.db.pool(), &node_id).await {
                warn!(node = %node_id, "failed to persist heartbeat: {}", e);
            }
        }
        methods::NODE_INVENTORY => {
            let Some(payload) = msg.payload else { return };
            match serde_json::from_value::<NodeInventory>(payload) {
                Ok(inv) => {
                    if let Err(e) = nodes::update_inventory(
                        state.db.pool(),
                        &inv.node_id,
                        inv.cpu_cores,
                        inv.cpu_threads,
                        inv.memory_total_bytes,
                        inv.disk_total_bytes,
                        inv.hypervisor_type.as_deref(),
                        inv.hypervisor_version.as_deref(),
                    )
                    .await
                    {
                        warn!(node = %inv.node_id, "failed to store inventory: {}", e);
                    }
                }
                Err(e) => warn!("bad node.inventory payload: {}", e),
            }
        }
        methods::RPC_CANCEL => {
            // Advisory. Controller-side handlers run to completion; the
            // task record is cancelled so the UI stops waiting on it.
            if let Some(task_id) = msg
                .payload
                .as_ref()
                .and_then(|p| p.get("task_id"))
                .and_then(|t| t.as_str())
            {
                let _ = state.tasks.cancel(task_id).await;
            }
        }
        other => debug!(method = other, "ignoring unknown agent notification"),
    }
}
