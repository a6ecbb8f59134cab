//! Virtual machine rows

use chrono::{DateTime, Utc};
use ironhive_common::{Error, Result};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};

use super::{db_err, from_db_time, from_db_time_opt, to_db_time};

/// Virtual machine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vm {
    pub id: String,
    pub uuid: Option<String>,
    pub name: String,
    pub node_id: Option<String>,
    pub status: VmStatus,
    pub vcpu: u32,
    pub memory_mb: u64,
    pub os_type: String,
    pub disks: Vec<VmDisk>,
    pub network_interfaces: Vec<VmNic>,
    pub metadata: Option<serde_json::Value>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A disk reference stored on the VM row
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VmDisk {
    pub volume_id: String,
    pub device: String,
    pub bootable: bool,
}

/// A NIC stored on the VM row
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VmNic {
    pub network_id: String,
    pub mac_address: String,
    pub ip_address: Option<String>,
    pub model: String,
    pub bridge: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
    Paused,
    Restarting,
    Migrating,
    Error,
}

impl VmStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VmStatus::Stopped => "stopped",
            VmStatus::Starting => "starting",
            VmStatus::Running => "running",
            VmStatus::Stopping => "stopping",
            VmStatus::Paused => "paused",
            VmStatus::Restarting => "restarting",
            VmStatus::Migrating => "migrating",
            VmStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "starting" => VmStatus::Starting,
            "running" => VmStatus::Running,
            "stopping" => VmStatus::Stopping,
            "paused" => VmStatus::Paused,
            "restarting" => VmStatus::Restarting,
            "migrating" => VmStatus::Migrating,
            "error" => VmStatus::Error,
            _ => VmStatus::Stopped,
        }
    }

    /// In-flight states the reconciliation sweep is responsible for
    pub fn is_transitional(&self) -> bool {
        matches!(
            self,
            VmStatus::Starting | VmStatus::Stopping | VmStatus::Restarting | VmStatus::Migrating
        )
    }
}

fn row_to_vm(row: &SqliteRow) -> Result<Vm> {
    let disks: Option<String> = row.get("disks");
    let nics: Option<String> = row.get("network_interfaces");
    let metadata: Option<String> = row.get("metadata");
    Ok(Vm {
        id: row.get("id"),
        uuid: row.get("uuid"),
        name: row.get("name"),
        node_id: row.get("node_id"),
        status: VmStatus::parse(row.get("status")),
        vcpu: row.get::<i64, _>("vcpu") as u32,
        memory_mb: row.get::<i64, _>("memory_mb") as u64,
        os_type: row.get("os_type"),
        disks: disks
            .and_then(|d| serde_json::from_str(&d).ok())
            .unwrap_or_default(),
        network_interfaces: nics
            .and_then(|n| serde_json::from_str(&n).ok())
            .unwrap_or_default(),
        metadata: metadata.and_then(|m| serde_json::from_str(&m).ok()),
        started_at: from_db_time_opt(row.get("started_at"))?,
        stopped_at: from_db_time_opt(row.get("stopped_at"))?,
        created_at: from_db_time(row.get("created_at"))?,
        updated_at: from_db_time(row.get("updated_at"))?,
    })
}

pub async fn get(pool: &SqlitePool, id: &str) -> Result<Vm> {
    let row = sqlx::query("SELECT * FROM vms WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(|e| db_err("failed to load vm", e))?
        .ok_or_else(|| Error::VmNotFound(id.to_string()))?;
    row_to_vm(&row)
}

pub async fn list(
    pool: &SqlitePool,
    page: usize,
    page_size: usize,
    node_id: Option<&str>,
    status: Option<&str>,
) -> Result<(Vec<Vm>, usize)> {
    // Two filter columns at most; build the WHERE clause by hand.
    let mut where_clause = String::from("WHERE 1=1");
    if node_id.is_some() {
        where_clause.push_str(" AND node_id = ?");
    }
    if status.is_some() {
        where_clause.push_str(" AND status = ?");
    }

    let count_sql = format!("SELECT COUNT(*) FROM vms {}", where_clause);
    let mut count_query = sqlx::query_scalar::<_, i64>(&count_sql);
    if let Some(n) = node_id {
        count_query = count_query.bind(n);
    }
    if let Some(s) = status {
        count_query = count_query.bind(s);
    }
    let total = count_query
        .fetch_one(pool)
        .await
        .map_err(|e| db_err("failed to count vms", e))?;

    let list_sql = format!(
        "SELECT * FROM vms {} ORDER BY created_at DESC LIMIT ? OFFSET ?",
        where_clause
    );
    let mut list_query = sqlx::query(&list_sql);
    if let Some(n) = node_id {
        list_query = list_query.bind(n);
    }
    if let Some(s) = status {
        list_query = list_query.bind(s);
    }
    let rows = list_query
        .bind(page_size as i64)
        .bind(((page - 1) * page_size) as i64)
        .fetch_all(pool)
        .await
        .map_err(|e| db_err("failed to list vms", e))?;

    let mut vms = Vec::with_capacity(rows.len());
    for row in &rows {
        vms.push(row_to_vm(row)?);
    }
    Ok((vms, total as usize))
}

pub async fn list_by_status(pool: &SqlitePool, status: VmStatus) -> Result<Vec<Vm>> {
    let rows = sqlx::query("SELECT * FROM vms WHERE status = ?")
        .bind(status.as_str())
        .fetch_all(pool)
        .await
        .map_err(|e| db_err("failed to list vms by status", e))?;
    let mut vms = Vec::with_capacity(rows.len());
    for row in &rows {
        vms.push(row_to_vm(row)?);
    }
    Ok(vms)
}

pub async fn count_on_node(pool: &SqlitePool, node_id: &str) -> Result<usize> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM vms WHERE node_id = ?")
        .bind(node_id)
        .fetch_one(pool)
        .await
        .map_err(|e| db_err("failed to count vms on node", e))?;
    Ok(count as usize)
}

/// Insert a new VM row inside a larger transaction
pub async fn insert_tx(conn: &mut SqliteConnection, vm: &Vm) -> Result<()> {
    sqlx::query(
        "INSERT INTO vms (id, uuid, name, node_id, status, vcpu, memory_mb, os_type,
             disks, network_interfaces, metadata, started_at, stopped_at, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&vm.id)
    .bind(&vm.uuid)
    .bind(&vm.name)
    .bind(&vm.node_id)
    .bind(vm.status.as_str())
    .bind(vm.vcpu as i64)
    .bind(vm.memory_mb as i64)
    .bind(&vm.os_type)
    .bind(serde_json::to_string(&vm.disks)?)
    .bind(serde_json::to_string(&vm.network_interfaces)?)
    .bind(vm.metadata.as_ref().map(|m| m.to_string()))
    .bind(vm.started_at.map(to_db_time))
    .bind(vm.stopped_at.map(to_db_time))
    .bind(to_db_time(vm.created_at))
    .bind(to_db_time(vm.updated_at))
    .execute(conn)
    .await
    .map_err(|e| db_err("failed to insert vm", e))?;
    Ok(())
}

/// Transition the status column inside a larger transaction
pub async fn set_status_tx(
    conn: &mut SqliteConnection,
    id: &str,
    status: VmStatus,
) -> Result<()> {
    let now = Utc::now();
    let (started, stopped) = match status {
        VmStatus::Running => (Some(to_db_time(now)), None),
        VmStatus::Stopped => (None, Some(to_db_time(now))),
        _ => (None, None),
    };
    sqlx::query(
        "UPDATE vms SET status = ?, updated_at = ?,
             started_at = COALESCE(?, started_at),
             stopped_at = COALESCE(?, stopped_at)
         WHERE id = ?",
    )
    .bind(status.as_str())
    .bind(to_db_time(now))
    .bind(started)
    .bind(stopped)
    .bind(id)
    .execute(conn)
    .await
    .map_err(|e| db_err("failed to update vm status", e))?;
    Ok(())
}

pub async fn set_status(pool: &SqlitePool, id: &str, status: VmStatus) -> Result<()> {
    let mut conn = pool
        .acquire()
        .await
        .map_err(|e| db_err("failed to acquire connection", e))?;
    set_status_tx(&mut conn, id, status).await
}

pub async fn set_uuid(pool: &SqlitePool, id: &str, uuid: &str) -> Result<()> {
    sqlx::query("UPDATE vms SET uuid = ?, updated_at = ? WHERE id = ?")
        .bind(uuid)
        .bind(to_db_time(Utc::now()))
        .bind(id)
        .execute(pool)
        .await
        .map_err(|e| db_err("failed to update vm uuid", e))?;
    Ok(())
}

pub async fn set_node_tx(conn: &mut SqliteConnection, id: &str, node_id: &str) -> Result<()> {
    sqlx::query("UPDATE vms SET node_id = ?, updated_at = ? WHERE id = ?")
        .bind(node_id)
        .bind(to_db_time(Utc::now()))
        .bind(id)
        .execute(conn)
        .await
        .map_err(|e| db_err("failed to update vm node", e))?;
    Ok(())
}

pub async fn update_shape(
    pool: &SqlitePool,
    id: &str,
    name: &str,
    vcpu: u32,
    memory_mb: u64,
    os_type: &str,
    metadata: Option<&serde_json::Value>,
) -> Result<()> {
    sqlx::query(
        "UPDATE vms SET name = ?, vcpu = ?, memory_mb = ?, os_type = ?,
             metadata = COALESCE(?, metadata), updated_at = ?
         WHERE id = ?",
    )
    .bind(name)
    .bind(vcpu as i64)
    .bind(memory_mb as i64)
    .bind(os_type)
    .bind(metadata.map(|m| m.to_string()))
    .bind(to_db_time(Utc::now()))
    .bind(id)
    .execute(pool)
    .await
    .map_err(|e| db_err("failed to update vm", e))?;
    Ok(())
}

pub async fn set_disks_tx(
    conn: &mut SqliteConnection,
    id: &str,
    disks: &[VmDisk],
) -> Result<()> {
    sqlx::query("UPDATE vms SET disks = ?, updated_at = ? WHERE id = ?")
        .bind(serde_json::to_string(disks)?)
        .bind(to_db_time(Utc::now()))
        .bind(id)
        .execute(conn)
        .await
        .map_err(|e| db_err("failed to update vm disks", e))?;
    Ok(())
}

pub async fn delete_tx(conn: &mut SqliteConnection, id: &str) -> Result<()> {
    let res = sqlx::query("DELETE FROM vms WHERE id = ?")
        .bind(id)
        .execute(conn)
        .await
        .map_err(|e| db_err("failed to delete vm", e))?;
    if res.rows_affected() == 0 {
        return Err(Error::VmNotFound(id.to_string()));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db::test_db;

    pub(crate) fn sample_vm(id: &str) -> Vm {
        let now = Utc::now();
        Vm {
            id: id.to_string(),
            uuid: None,
            name: format!("vm-{}", id),
            node_id: Some("n1".to_string()),
            status: VmStatus::Stopped,
            vcpu: 2,
            memory_mb: 2048,
            os_type: "linux".to_string(),
            disks: vec![VmDisk {
                volume_id: "vol-1".to_string(),
                device: "vda".to_string(),
                bootable: true,
            }],
            network_interfaces: vec![VmNic {
                network_id: "net-1".to_string(),
                mac_address: "52:54:00:00:00:01".to_string(),
                ip_address: Some("10.0.1.10".to_string()),
                model: "virtio".to_string(),
                bridge: "br-default".to_string(),
            }],
            metadata: None,
            started_at: None,
            stopped_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let db = test_db().await;
        let vm = sample_vm("vm-1");
        let mut conn = db.pool().acquire().await.unwrap();
        insert_tx(&mut conn, &vm).await.unwrap();
        drop(conn);

        let loaded = get(db.pool(), "vm-1").await.unwrap();
        assert_eq!(loaded.name, vm.name);
        assert_eq!(loaded.disks, vm.disks);
        assert_eq!(loaded.network_interfaces, vm.network_interfaces);
        assert_eq!(loaded.status, VmStatus::Stopped);
    }

    #[tokio::test]
    async fn test_status_transition_stamps_times() {
        let db = test_db().await;
        let mut conn = db.pool().acquire().await.unwrap();
        insert_tx(&mut conn, &sample_vm("vm-1")).await.unwrap();
        drop(conn);

        set_status(db.pool(), "vm-1", VmStatus::Running).await.unwrap();
        let vm = get(db.pool(), "vm-1").await.unwrap();
        assert_eq!(vm.status, VmStatus::Running);
        assert!(vm.started_at.is_some());

        set_status(db.pool(), "vm-1", VmStatus::Stopped).await.unwrap();
        let vm = get(db.pool(), "vm-1").await.unwrap();
        assert!(vm.stopped_at.is_some());
    }

    #[tokio::test]
    async fn test_list_filters() {
        let db = test_db().await;
        let mut conn = db.pool().acquire().await.unwrap();
        let mut other = sample_vm("vm-2");
        other.node_id = Some("n2".to_string());
        insert_tx(&mut conn, &sample_vm("vm-1")).await.unwrap();
        insert_tx(&mut conn, &other).await.unwrap();
        drop(conn);

        let (vms, total) = list(db.pool(), 1, 10, Some("n2"), None).await.unwrap();
        assert_eq!(total, 1);
        assert_eq!(vms[0].id, "vm-2");

        let (_, total) = list(db.pool(), 1, 10, None, Some("stopped")).await.unwrap();
        assert_eq!(total, 2);
    }
}
