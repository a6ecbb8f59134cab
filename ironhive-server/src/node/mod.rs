//! Node lifecycle
//!
//! Nodes register themselves through the agent websocket; this manager
//! covers the admin-driven rest: maintenance toggling, deletion guards,
//! manual heartbeats, and aggregate stats.

use ironhive_common::{Error, Result};
use serde::{Deserialize, Serialize};

use crate::db::nodes::{self, Node, NodeStatus};
use crate::db::vms;
use crate::state::AppState;

pub struct NodeManager {
    state: AppState,
}

#[derive(Debug, Deserialize)]
pub struct UpdateNodeRequest {
    /// Only `online <-> maintenance` flips are admin-settable
    pub status: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct NodeStats {
    pub total: usize,
    pub online: usize,
    pub offline: usize,
    pub maintenance: usize,
    /// Live agent sessions, which can lag the row status by one sweep
    pub agents_connected: usize,
    pub cpu_cores_total: u64,
    pub memory_total_bytes: u64,
    pub disk_total_bytes: u64,
}

impl NodeManager {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    pub async fn get(&self, id: &str) -> Result<Node> {
        nodes::get(self.state.db.pool(), id).await
    }

    pub async fn list(&self, page: usize, page_size: usize) -> Result<(Vec<Node>, usize)> {
        nodes::list(self.state.db.pool(), page, page_size).await
    }

    pub async fn update(&self, id: &str, req: UpdateNodeRequest, actor: &str) -> Result<Node> {
        let node = nodes::get(self.state.db.pool(), id).await?;

        if let Some(status) = req.status.as_deref() {
            let target = match status {
                "maintenance" => NodeStatus::Maintenance,
                "online" => NodeStatus::Online,
                other => {
                    return Err(Error::Validation(format!(
                        "status '{}' is not admin-settable",
                        other
                    )))
                }
            };
            // Maintenance only makes sense from online and back.
            match (node.status, target) {
                (NodeStatus::Online, NodeStatus::Maintenance)
                | (NodeStatus::Maintenance, NodeStatus::Online) => {
                    nodes::set_status(self.state.db.pool(), id, target).await?;
                    self.state.ws.node_status(id, target.as_str());
                }
                (current, _) => {
                    return Err(Error::Precondition(format!(
                        "cannot move node from {} to {}",
                        current.as_str(),
                        target.as_str()
                    )))
                }
            }
        }

        if let Some(metadata) = &req.metadata {
            nodes::update_metadata(self.state.db.pool(), id, metadata).await?;
        }

        self.state
            .audit
            .record(actor, "node.update", "node", id, None)
            .await;
        nodes::get(self.state.db.pool(), id).await
    }

    /// Deleting a node is rejected while any VM is assigned to it
    pub async fn delete(&self, id: &str, actor: &str) -> Result<()> {
        nodes::get(self.state.db.pool(), id).await?;

        let assigned = vms::count_on_node(self.state.db.pool(), id).await?;
        if assigned > 0 {
            return Err(Error::Precondition(format!(
                "{} virtual machines are assigned to this node",
                assigned
            )));
        }

        nodes::delete(self.state.db.pool(), id).await?;
        self.state
            .audit
            .record(actor, "node.delete", "node", id, None)
            .await;
        Ok(())
    }

    /// Manual heartbeat for nodes without a live agent session
    pub async fn heartbeat(&self, id: &str) -> Result<Node> {
        nodes::get(self.state.db.pool(), id).await?;
        nodes::touch_heartbeat(self.state.db.pool(), id).await?;
        nodes::get(self.state.db.pool(), id).await
    }

    pub async fn stats(&self) -> Result<NodeStats> {
        let all = nodes::list_all(self.state.db.pool()).await?;
        let mut stats = NodeStats {
            total: all.len(),
            online: 0,
            offline: 0,
            maintenance: 0,
            agents_connected: self.state.registry.count().await,
            cpu_cores_total: 0,
            memory_total_bytes: 0,
            disk_total_bytes: 0,
        };
        for node in &all {
            match node.status {
                NodeStatus::Online => stats.online += 1,
                NodeStatus::Maintenance => stats.maintenance += 1,
                _ => stats.offline += 1,
            }
            stats.cpu_cores_total += node.cpu_cores as u64;
            stats.memory_total_bytes += node.memory_total_bytes;
            stats.disk_total_bytes += node.disk_total_bytes;
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::nodes::upsert_registration;
    use crate::db::vms::{insert_tx, Vm, VmStatus};
    use crate::state::AppState;
    use chrono::Utc;

    async fn manager_with_node() -> NodeManager {
        let state = AppState::for_tests().await;
        upsert_registration(state.db.pool(), "n1", "host-a", "10.0.0.1")
            .await
            .unwrap();
        NodeManager::new(state)
    }

    #[tokio::test]
    async fn test_maintenance_round_trip() {
        let manager = manager_with_node().await;
        let node = manager
            .update(
                "n1",
                UpdateNodeRequest {
                    status: Some("maintenance".into()),
                    metadata: None,
                },
                "tester",
            )
            .await
            .unwrap();
        assert_eq!(node.status, NodeStatus::Maintenance);

        let node = manager
            .update(
                "n1",
                UpdateNodeRequest {
                    status: Some("online".into()),
                    metadata: None,
                },
                "tester",
            )
            .await
            .unwrap();
        assert_eq!(node.status, NodeStatus::Online);
    }

    #[tokio::test]
    async fn test_delete_rejected_with_assigned_vm() {
        let manager = manager_with_node().await;
        let now = Utc::now();
        let vm = Vm {
            id: "vm-1".into(),
            uuid: None,
            name: "web".into(),
            node_id: Some("n1".into()),
            status: VmStatus::Stopped,
            vcpu: 1,
            memory_mb: 512,
            os_type: "linux".into(),
            disks: vec![],
            network_interfaces: vec![],
            metadata: None,
            started_at: None,
            stopped_at: None,
            created_at: now,
            updated_at: now,
        };
        let mut conn = manager.state.db.pool().acquire().await.unwrap();
        insert_tx(&mut conn, &vm).await.unwrap();
        drop(conn);

        let err = manager.delete("n1", "tester").await.unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
    }

    #[tokio::test]
    async fn test_stats() {
        let manager = manager_with_node().await;
        let stats = manager.stats().await.unwrap();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.online, 1);
    }
}
