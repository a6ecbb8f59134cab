//! Volume rows

use chrono::{DateTime, Utc};
use ironhive_common::{Error, Result};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};

use super::{db_err, from_db_time, to_db_time};

/// Virtual disk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Volume {
    pub id: String,
    pub name: String,
    pub volume_type: String,
    pub size_gb: u64,
    pub pool_id: String,
    pub path: Option<String>,
    pub status: VolumeStatus,
    pub vm_id: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Volume {
    /// Image format as the hypervisor and image tools see it
    pub fn format(&self) -> &'static str {
        match self.volume_type.as_str() {
            "qcow2" | "nfs" => "qcow2",
            _ => "raw",
        }
    }

    /// The optional URL initial contents are fetched from
    pub fn source(&self) -> Option<String> {
        self.metadata
            .as_ref()
            .and_then(|m| m.get("source"))
            .and_then(|s| s.as_str())
            .map(|s| s.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeStatus {
    Creating,
    Available,
    InUse,
    Deleting,
    Error,
}

impl VolumeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VolumeStatus::Creating => "creating",
            VolumeStatus::Available => "available",
            VolumeStatus::InUse => "in_use",
            VolumeStatus::Deleting => "deleting",
            VolumeStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "available" => VolumeStatus::Available,
            "in_use" | "in-use" => VolumeStatus::InUse,
            "deleting" => VolumeStatus::Deleting,
            "error" => VolumeStatus::Error,
            _ => VolumeStatus::Creating,
        }
    }
}

fn row_to_volume(row: &SqliteRow) -> Result<Volume> {
    let metadata: Option<String> = row.get("metadata");
    Ok(Volume {
        id: row.get("id"),
        name: row.get("name"),
        volume_type: row.get("volume_type"),
        size_gb: row.get::<i64, _>("size_gb") as u64,
        pool_id: row.get("pool_id"),
        path: row.get("path"),
        status: VolumeStatus::parse(row.get("status")),
        vm_id: row.get("vm_id"),
        metadata: metadata.and_then(|m| serde_json::from_str(&m).ok()),
        created_at: from_db_time(row.get("created_at"))?,
        updated_at: from_db_time(row.get("updated_at"))?,
    })
}

pub async fn get(pool: &SqlitePool, id: &str) -> Result<Volume> {
    let row = sqlx::query("SELECT * FROM volumes WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(|e| db_err("failed to load volume", e))?
        .ok_or_else(|| Error::VolumeNotFound(id.to_string()))?;
    row_to_volume(&row)
}

pub async fn list(
    pool: &SqlitePool,
    page: usize,
    page_size: usize,
    pool_id: Option<&str>,
    status: Option<&str>,
) -> Result<(Vec<Volume>, usize)> {
    let mut where_clause = String::from("WHERE 1=1");
    if pool_id.is_some() {
        where_clause.push_str(" AND pool_id = ?");
    }
    if status.is_some() {
        where_clause.push_str(" AND status = ?");
    }

    let count_sql = format!("SELECT COUNT(*) FROM volumes {}", where_clause);
    let mut count_query = sqlx::query_scalar::<_, i64>(&count_sql);
    if let Some(p) = pool_id {
        count_query = count_query.bind(p);
    }
    if let Some(s) = status {
        count_query = count_query.bind(s);
    }
    let total = count_query
        .fetch_one(pool)
        .await
        .map_err(|e| db_err("failed to count volumes", e))?;

    let list_sql = format!(
        "SELECT * FROM volumes {} ORDER BY created_at DESC LIMIT ? OFFSET ?",
        where_clause
    );
    let mut list_query = sqlx::query(&list_sql);
    if let Some(p) = pool_id {
        list_query = list_query.bind(p);
    }
    if let Some(s) = status {
        list_query = list_query.bind(s);
    }
    let rows = list_query
        .bind(page_size as i64)
        .bind(((page - 1) * page_size) as i64)
        .fetch_all(pool)
        .await
        .map_err(|e| db_err("failed to list volumes", e))?;

    let mut volumes = Vec::with_capacity(rows.len());
    for row in &rows {
        volumes.push(row_to_volume(row)?);
    }
    Ok((volumes, total as usize))
}

pub async fn list_by_status(pool: &SqlitePool, status: VolumeStatus) -> Result<Vec<Volume>> {
    let rows = sqlx::query("SELECT * FROM volumes WHERE status = ?")
        .bind(status.as_str())
        .fetch_all(pool)
        .await
        .map_err(|e| db_err("failed to list volumes by status", e))?;
    let mut volumes = Vec::with_capacity(rows.len());
    for row in &rows {
        volumes.push(row_to_volume(row)?);
    }
    Ok(volumes)
}

pub async fn count_in_pool(pool: &SqlitePool, pool_id: &str) -> Result<usize> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM volumes WHERE pool_id = ?")
        .bind(pool_id)
        .fetch_one(pool)
        .await
        .map_err(|e| db_err("failed to count volumes in pool", e))?;
    Ok(count as usize)
}

pub async fn insert_tx(conn: &mut SqliteConnection, v: &Volume) -> Result<()> {
    sqlx::query(
        "INSERT INTO volumes (id, name, volume_type, size_gb, pool_id, path, status,
             vm_id, metadata, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&v.id)
    .bind(&v.name)
    .bind(&v.volume_type)
    .bind(v.size_gb as i64)
    .bind(&v.pool_id)
    .bind(&v.path)
    .bind(v.status.as_str())
    .bind(&v.vm_id)
    .bind(v.metadata.as_ref().map(|m| m.to_string()))
    .bind(to_db_time(v.created_at))
    .bind(to_db_time(v.updated_at))
    .execute(conn)
    .await
    .map_err(|e| db_err("failed to insert volume", e))?;
    Ok(())
}

pub async fn set_status_tx(
    conn: &mut SqliteConnection,
    id: &str,
    status: VolumeStatus,
) -> Result<()> {
    sqlx::query("UPDATE volumes SET status = ?, updated_at = ? WHERE id = ?")
        .bind(status.as_str())
        .bind(to_db_time(Utc::now()))
        .bind(id)
        .execute(conn)
        .await
        .map_err(|e| db_err("failed to update volume status", e))?;
    Ok(())
}

pub async fn set_status(pool: &SqlitePool, id: &str, status: VolumeStatus) -> Result<()> {
    let mut conn = pool
        .acquire()
        .await
        .map_err(|e| db_err("failed to acquire connection", e))?;
    set_status_tx(&mut conn, id, status).await
}

/// Bind or unbind a volume to a VM, updating status accordingly
pub async fn set_attachment_tx(
    conn: &mut SqliteConnection,
    id: &str,
    vm_id: Option<&str>,
) -> Result<()> {
    let status = if vm_id.is_some() {
        VolumeStatus::InUse
    } else {
        VolumeStatus::Available
    };
    sqlx::query("UPDATE volumes SET vm_id = ?, status = ?, updated_at = ? WHERE id = ?")
        .bind(vm_id)
        .bind(status.as_str())
        .bind(to_db_time(Utc::now()))
        .bind(id)
        .execute(conn)
        .await
        .map_err(|e| db_err("failed to update volume attachment", e))?;
    Ok(())
}

pub async fn finish_create(
    pool: &SqlitePool,
    id: &str,
    path: &str,
    size_gb: u64,
) -> Result<()> {
    sqlx::query(
        "UPDATE volumes SET status = 'available', path = ?, size_gb = ?, updated_at = ?
         WHERE id = ? AND status = 'creating'",
    )
    .bind(path)
    .bind(size_gb as i64)
    .bind(to_db_time(Utc::now()))
    .bind(id)
    .execute(pool)
    .await
    .map_err(|e| db_err("failed to finish volume creation", e))?;
    Ok(())
}

pub async fn set_size(pool: &SqlitePool, id: &str, size_gb: u64) -> Result<()> {
    sqlx::query("UPDATE volumes SET size_gb = ?, updated_at = ? WHERE id = ?")
        .bind(size_gb as i64)
        .bind(to_db_time(Utc::now()))
        .bind(id)
        .execute(pool)
        .await
        .map_err(|e| db_err("failed to update volume size", e))?;
    Ok(())
}

pub async fn delete_tx(conn: &mut SqliteConnection, id: &str) -> Result<()> {
    sqlx::query("DELETE FROM volumes WHERE id = ?")
        .bind(id)
        .execute(conn)
        .await
        .map_err(|e| db_err("failed to delete volume", e))?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db::pools::tests::sample_pool;
    use crate::db::{pools, test_db};

    pub(crate) fn sample_volume(id: &str, pool_id: &str, size_gb: u64) -> Volume {
        let now = Utc::now();
        Volume {
            id: id.to_string(),
            name: format!("disk-{}", id),
            volume_type: "qcow2".to_string(),
            size_gb,
            pool_id: pool_id.to_string(),
            path: None,
            status: VolumeStatus::Creating,
            vm_id: None,
            metadata: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_pool_accounting_skips_deleting_and_error() {
        let db = test_db().await;
        pools::insert(db.pool(), &sample_pool("p1", "nfs0"))
            .await
            .unwrap();

        let mut conn = db.pool().acquire().await.unwrap();
        insert_tx(&mut conn, &sample_volume("v1", "p1", 10)).await.unwrap();
        insert_tx(&mut conn, &sample_volume("v2", "p1", 20)).await.unwrap();
        let mut failed = sample_volume("v3", "p1", 40);
        failed.status = VolumeStatus::Error;
        insert_tx(&mut conn, &failed).await.unwrap();
        pools::recompute_allocation_tx(&mut conn, "p1").await.unwrap();
        drop(conn);

        let p = pools::get(db.pool(), "p1").await.unwrap();
        assert_eq!(p.allocated_gb, 30);
        assert_eq!(p.available_gb(), 470);
    }

    #[tokio::test]
    async fn test_attachment_flips_status() {
        let db = test_db().await;
        let mut conn = db.pool().acquire().await.unwrap();
        insert_tx(&mut conn, &sample_volume("v1", "p1", 10)).await.unwrap();
        set_attachment_tx(&mut conn, "v1", Some("vm-1")).await.unwrap();
        drop(conn);

        let v = get(db.pool(), "v1").await.unwrap();
        assert_eq!(v.status, VolumeStatus::InUse);
        assert_eq!(v.vm_id.as_deref(), Some("vm-1"));

        let mut conn = db.pool().acquire().await.unwrap();
        set_attachment_tx(&mut conn, "v1", None).await.unwrap();
        drop(conn);
        let v = get(db.pool(), "v1").await.unwrap();
        assert_eq!(v.status, VolumeStatus::Available);
        assert!(v.vm_id.is_none());
    }

    #[tokio::test]
    async fn test_finish_create_only_from_creating() {
        let db = test_db().await;
        let mut conn = db.pool().acquire().await.unwrap();
        let mut v = sample_volume("v1", "p1", 10);
        v.status = VolumeStatus::Error;
        insert_tx(&mut conn, &v).await.unwrap();
        drop(conn);

        finish_create(db.pool(), "v1", "/mnt/p/v1.qcow2", 10)
            .await
            .unwrap();
        // Guard: a row that already left `creating` is not resurrected.
        assert_eq!(
            get(db.pool(), "v1").await.unwrap().status,
            VolumeStatus::Error
        );
    }

    #[test]
    fn test_format_mapping() {
        let mut v = sample_volume("v1", "p1", 1);
        assert_eq!(v.format(), "qcow2");
        v.volume_type = "lvm".to_string();
        assert_eq!(v.format(), "raw");
    }
}
