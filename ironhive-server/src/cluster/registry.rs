//! Agent connection registry
//!
//! Live agent sessions keyed by node id. Dispatch is strictly "to node":
//! a request for a node with no session fails fast with `NODE_OFFLINE`
//! instead of queueing. Duplicate registrations are resolved by recency;
//! the newer connection wins and the old transport is failed with
//! `TRANSPORT_SUPERSEDED`.

use ironhive_common::rpc::{RpcConnection, RpcError, RpcMessage};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Notify, RwLock};
use tracing::{debug, info, warn};

/// One live agent connection
pub struct AgentSession {
    pub node_id: String,
    pub hostname: String,
    pub ip_address: String,
    pub conn: RpcConnection,
    last_heartbeat: RwLock<Instant>,
    closed: Notify,
}

impl AgentSession {
    fn new(node_id: String, hostname: String, ip_address: String, conn: RpcConnection) -> Self {
        Self {
            node_id,
            hostname,
            ip_address,
            conn,
            last_heartbeat: RwLock::new(Instant::now()),
            closed: Notify::new(),
        }
    }

    pub async fn call(
        &self,
        method: impl Into<String>,
        payload: serde_json::Value,
        timeout: Duration,
    ) -> Result<RpcMessage, RpcError> {
        self.conn.call(method, payload, timeout).await
    }

    pub async fn touch_heartbeat(&self) {
        *self.last_heartbeat.write().await = Instant::now();
    }

    pub async fn heartbeat_elapsed(&self) -> Duration {
        self.last_heartbeat.read().await.elapsed()
    }

    /// Fail in-flight requests and wake the socket pump so it closes
    pub async fn shutdown(&self, error: RpcError) {
        self.conn.close_with(error).await;
        self.closed.notify_waiters();
    }

    /// Resolves when `shutdown` is called
    pub async fn wait_closed(&self) {
        self.closed.notified().await;
    }
}

/// Registry of live agent sessions
#[derive(Clone, Default)]
pub struct AgentRegistry {
    sessions: Arc<RwLock<HashMap<String, Arc<AgentSession>>>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a session for a node, superseding any previous one.
    /// Returns the new session and its outbound frame receiver.
    pub async fn register(
        &self,
        node_id: &str,
        hostname: &str,
        ip_address: &str,
    ) -> (Arc<AgentSession>, mpsc::UnboundedReceiver<RpcMessage>) {
        let (conn, rx) = RpcConnection::new();
        let session = Arc::new(AgentSession::new(
            node_id.to_string(),
            hostname.to_string(),
            ip_address.to_string(),
            conn,
        ));

        let previous = {
            let mut sessions = self.sessions.write().await;
            sessions.insert(node_id.to_string(), session.clone())
        };

        if let Some(previous) = previous {
            warn!(node = node_id, "superseding an existing agent session");
            previous.shutdown(RpcError::superseded()).await;
        }

        info!(node = node_id, hostname, "agent session registered");
        (session, rx)
    }

    /// Remove a session, but only if it is still the current one for its
    /// node; a superseded session must not evict its replacement.
    pub async fn unregister(&self, session: &Arc<AgentSession>) {
        let mut sessions = self.sessions.write().await;
        if let Some(current) = sessions.get(&session.node_id) {
            if Arc::ptr_eq(current, session) {
                sessions.remove(&session.node_id);
                info!(node = %session.node_id, "agent session unregistered");
            } else {
                debug!(node = %session.node_id, "stale session exit ignored");
            }
        }
    }

    pub async fn get(&self, node_id: &str) -> Option<Arc<AgentSession>> {
        self.sessions.read().await.get(node_id).cloned()
    }

    pub async fn is_online(&self, node_id: &str) -> bool {
        self.sessions.read().await.contains_key(node_id)
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Dispatch a request to a node's session. No cross-node fallback.
    pub async fn call(
        &self,
        node_id: &str,
        method: impl Into<String>,
        payload: serde_json::Value,
        timeout: Duration,
    ) -> Result<RpcMessage, RpcError> {
        let session = self
            .get(node_id)
            .await
            .ok_or_else(|| RpcError::node_offline(node_id))?;
        session.call(method, payload, timeout).await
    }

    /// Close and drop sessions whose heartbeat is older than the timeout.
    /// Returns the node ids that were evicted.
    pub async fn evict_stale(&self, timeout: Duration) -> Vec<String> {
        let stale: Vec<Arc<AgentSession>> = {
            let sessions = self.sessions.read().await;
            let mut stale = Vec::new();
            for session in sessions.values() {
                if session.heartbeat_elapsed().await > timeout {
                    stale.push(session.clone());
                }
            }
            stale
        };

        let mut evicted = Vec::new();
        for session in stale {
            warn!(node = %session.node_id, "agent heartbeat timed out");
            session.shutdown(RpcError::transport_closed()).await;
            self.unregister(&session).await;
            evicted.push(session.node_id.clone());
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ironhive_common::rpc::RpcErrorCode;
    use serde_json::json;

    #[tokio::test]
    async fn test_offline_node_fails_fast() {
        let registry = AgentRegistry::new();
        let err = registry
            .call("n1", "vm.describe", json!({}), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.code, RpcErrorCode::NodeOffline);
    }

    #[tokio::test]
    async fn test_newer_registration_supersedes() {
        let registry = AgentRegistry::new();
        let (old, _old_rx) = registry.register("n1", "host-a", "10.0.0.1").await;

        // A call is in flight on the old session when the new one arrives.
        let old_clone = old.clone();
        let in_flight = tokio::spawn(async move {
            old_clone
                .call("vm.describe", json!({}), Duration::from_secs(5))
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let (new, _new_rx) = registry.register("n1", "host-a", "10.0.0.1").await;

        let err = in_flight.await.unwrap().unwrap_err();
        assert_eq!(err.code, RpcErrorCode::TransportSuperseded);

        // The registry now resolves to the new session.
        let current = registry.get("n1").await.unwrap();
        assert!(Arc::ptr_eq(&current, &new));
        assert_eq!(registry.count().await, 1);
    }

    #[tokio::test]
    async fn test_stale_session_exit_does_not_evict_replacement() {
        let registry = AgentRegistry::new();
        let (old, _old_rx) = registry.register("n1", "host-a", "10.0.0.1").await;
        let (_new, _new_rx) = registry.register("n1", "host-a", "10.0.0.1").await;

        // The old pump notices its shutdown and unregisters itself.
        registry.unregister(&old).await;
        assert!(registry.is_online("n1").await);
    }

    #[tokio::test]
    async fn test_evict_stale() {
        let registry = AgentRegistry::new();
        let (_session, _rx) = registry.register("n1", "host-a", "10.0.0.1").await;

        let evicted = registry.evict_stale(Duration::from_secs(3600)).await;
        assert!(evicted.is_empty());

        let evicted = registry.evict_stale(Duration::from_millis(0)).await;
        assert_eq!(evicted, vec!["n1".to_string()]);
        assert!(!registry.is_online("n1").await);
    }
}
