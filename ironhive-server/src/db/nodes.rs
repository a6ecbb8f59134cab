//! Node rows

use chrono::{DateTime, Utc};
use ironhive_common::{Error, Result};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use super::{db_err, from_db_time, from_db_time_opt, to_db_time};

/// Compute node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub hostname: String,
    pub ip_address: String,
    pub status: NodeStatus,
    pub hypervisor_type: Option<String>,
    pub hypervisor_version: Option<String>,
    pub cpu_cores: u32,
    pub cpu_threads: u32,
    pub memory_total_bytes: u64,
    pub disk_total_bytes: u64,
    pub metadata: Option<serde_json::Value>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Online,
    Offline,
    Maintenance,
    Error,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Online => "online",
            NodeStatus::Offline => "offline",
            NodeStatus::Maintenance => "maintenance",
            NodeStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "online" => NodeStatus::Online,
            "maintenance" => NodeStatus::Maintenance,
            "error" => NodeStatus::Error,
            _ => NodeStatus::Offline,
        }
    }
}

fn row_to_node(row: &SqliteRow) -> Result<Node> {
    let metadata: Option<String> = row.get("metadata");
    Ok(Node {
        id: row.get("id"),
        hostname: row.get("hostname"),
        ip_address: row.get("ip_address"),
        status: NodeStatus::parse(row.get("status")),
        hypervisor_type: row.get("hypervisor_type"),
        hypervisor_version: row.get("hypervisor_version"),
        cpu_cores: row.get::<i64, _>("cpu_cores") as u32,
        cpu_threads: row.get::<i64, _>("cpu_threads") as u32,
        memory_total_bytes: row.get::<i64, _>("memory_total_bytes") as u64,
        disk_total_bytes: row.get::<i64, _>("disk_total_bytes") as u64,
        metadata: metadata.and_then(|m| serde_json::from_str(&m).ok()),
        last_heartbeat: from_db_time_opt(row.get("last_heartbeat"))?,
        created_at: from_db_time(row.get("created_at"))?,
        updated_at: from_db_time(row.get("updated_at"))?,
    })
}

pub async fn get(pool: &SqlitePool, id: &str) -> Result<Node> {
    let row = sqlx::query("SELECT * FROM nodes WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(|e| db_err("failed to load node", e))?
        .ok_or_else(|| Error::NodeNotFound(id.to_string()))?;
    row_to_node(&row)
}

pub async fn list(pool: &SqlitePool, page: usize, page_size: usize) -> Result<(Vec<Node>, usize)> {
    let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM nodes")
        .fetch_one(pool)
        .await
        .map_err(|e| db_err("failed to count nodes", e))?;

    let rows = sqlx::query("SELECT * FROM nodes ORDER BY hostname LIMIT ? OFFSET ?")
        .bind(page_size as i64)
        .bind(((page - 1) * page_size) as i64)
        .fetch_all(pool)
        .await
        .map_err(|e| db_err("failed to list nodes", e))?;

    let mut nodes = Vec::with_capacity(rows.len());
    for row in &rows {
        nodes.push(row_to_node(row)?);
    }
    Ok((nodes, total as usize))
}

pub async fn list_all(pool: &SqlitePool) -> Result<Vec<Node>> {
    let rows = sqlx::query("SELECT * FROM nodes ORDER BY hostname")
        .fetch_all(pool)
        .await
        .map_err(|e| db_err("failed to list nodes", e))?;
    let mut nodes = Vec::with_capacity(rows.len());
    for row in &rows {
        nodes.push(row_to_node(row)?);
    }
    Ok(nodes)
}

/// Insert or refresh a node row at registration time and mark it online
pub async fn upsert_registration(
    pool: &SqlitePool,
    id: &str,
    hostname: &str,
    ip_address: &str,
) -> Result<Node> {
    let now = to_db_time(Utc::now());
    sqlx::query(
        "INSERT INTO nodes (id, hostname, ip_address, status, last_heartbeat, created_at, updated_at)
         VALUES (?, ?, ?, 'online', ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
             hostname = excluded.hostname,
             ip_address = excluded.ip_address,
             status = 'online',
             last_heartbeat = excluded.last_heartbeat,
             updated_at = excluded.updated_at",
    )
    .bind(id)
    .bind(hostname)
    .bind(ip_address)
    .bind(&now)
    .bind(&now)
    .bind(&now)
    .execute(pool)
    .await
    .map_err(|e| db_err("failed to upsert node", e))?;

    get(pool, id).await
}

pub async fn set_status(pool: &SqlitePool, id: &str, status: NodeStatus) -> Result<()> {
    let res = sqlx::query("UPDATE nodes SET status = ?, updated_at = ? WHERE id = ?")
        .bind(status.as_str())
        .bind(to_db_time(Utc::now()))
        .bind(id)
        .execute(pool)
        .await
        .map_err(|e| db_err("failed to update node status", e))?;
    if res.rows_affected() == 0 {
        return Err(Error::NodeNotFound(id.to_string()));
    }
    Ok(())
}

/// Stamp a heartbeat; a node in maintenance keeps its status
pub async fn touch_heartbeat(pool: &SqlitePool, id: &str) -> Result<()> {
    sqlx::query(
        "UPDATE nodes SET last_heartbeat = ?, updated_at = ?,
             status = CASE WHEN status = 'maintenance' THEN status ELSE 'online' END
         WHERE id = ?",
    )
    .bind(to_db_time(Utc::now()))
    .bind(to_db_time(Utc::now()))
    .bind(id)
    .execute(pool)
    .await
    .map_err(|e| db_err("failed to update heartbeat", e))?;
    Ok(())
}

/// Mark every node whose heartbeat is older than the cutoff offline.
/// Returns the ids that flipped.
pub async fn mark_stale_offline(pool: &SqlitePool, cutoff: DateTime<Utc>) -> Result<Vec<String>> {
    let rows = sqlx::query(
        "SELECT id FROM nodes
         WHERE status = 'online' AND (last_heartbeat IS NULL OR last_heartbeat < ?)",
    )
    .bind(to_db_time(cutoff))
    .fetch_all(pool)
    .await
    .map_err(|e| db_err("failed to find stale nodes", e))?;

    let ids: Vec<String> = rows.iter().map(|r| r.get("id")).collect();
    for id in &ids {
        set_status(pool, id, NodeStatus::Offline).await?;
    }
    Ok(ids)
}

pub async fn update_inventory(
    pool: &SqlitePool,
    id: &str,
    cpu_cores: u32,
    cpu_threads: u32,
    memory_total_bytes: u64,
    disk_total_bytes: u64,
    hypervisor_type: Option<&str>,
    hypervisor_version: Option<&str>,
) -> Result<()> {
    sqlx::query(
        "UPDATE nodes SET cpu_cores = ?, cpu_threads = ?, memory_total_bytes = ?,
             disk_total_bytes = ?, hypervisor_type = ?, hypervisor_version = ?, updated_at = ?
         WHERE id = ?",
    )
    .bind(cpu_cores as i64)
    .bind(cpu_threads as i64)
    .bind(memory_total_bytes as i64)
    .bind(disk_total_bytes as i64)
    .bind(hypervisor_type)
    .bind(hypervisor_version)
    .bind(to_db_time(Utc::now()))
    .bind(id)
    .execute(pool)
    .await
    .map_err(|e| db_err("failed to update node inventory", e))?;
    Ok(())
}

pub async fn update_metadata(
    pool: &SqlitePool,
    id: &str,
    metadata: &serde_json::Value,
) -> Result<()> {
    sqlx::query("UPDATE nodes SET metadata = ?, updated_at = ? WHERE id = ?")
        .bind(metadata.to_string())
        .bind(to_db_time(Utc::now()))
        .bind(id)
        .execute(pool)
        .await
        .map_err(|e| db_err("failed to update node metadata", e))?;
    Ok(())
}

pub async fn delete(pool: &SqlitePool, id: &str) -> Result<()> {
    let res = sqlx::query("DELETE FROM nodes WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await
        .map_err(|e| db_err("failed to delete node", e))?;
    if res.rows_affected() == 0 {
        return Err(Error::NodeNotFound(id.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_db;

    #[tokio::test]
    async fn test_registration_upsert_marks_online() {
        let db = test_db().await;
        let node = upsert_registration(db.pool(), "n1", "host-a", "10.0.0.1")
            .await
            .unwrap();
        assert_eq!(node.status, NodeStatus::Online);

        // Re-registration with a new address replaces the row in place.
        let node = upsert_registration(db.pool(), "n1", "host-a", "10.0.0.2")
            .await
            .unwrap();
        assert_eq!(node.ip_address, "10.0.0.2");

        let (nodes, total) = list(db.pool(), 1, 10).await.unwrap();
        assert_eq!(total, 1);
        assert_eq!(nodes.len(), 1);
    }

    #[tokio::test]
    async fn test_stale_heartbeat_flips_offline() {
        let db = test_db().await;
        upsert_registration(db.pool(), "n1", "host-a", "10.0.0.1")
            .await
            .unwrap();

        let flipped = mark_stale_offline(db.pool(), Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(flipped, vec!["n1".to_string()]);
        assert_eq!(get(db.pool(), "n1").await.unwrap().status, NodeStatus::Offline);
    }

    #[tokio::test]
    async fn test_maintenance_survives_heartbeat() {
        let db = test_db().await;
        upsert_registration(db.pool(), "n1", "host-a", "10.0.0.1")
            .await
            .unwrap();
        set_status(db.pool(), "n1", NodeStatus::Maintenance)
            .await
            .unwrap();
        touch_heartbeat(db.pool(), "n1").await.unwrap();
        assert_eq!(
            get(db.pool(), "n1").await.unwrap().status,
            NodeStatus::Maintenance
        );
    }
}
