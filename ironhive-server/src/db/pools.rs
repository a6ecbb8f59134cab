//! Storage pool rows

use chrono::{DateTime, Utc};
use ironhive_common::rpc::types::PoolConfig;
use ironhive_common::{Error, Result};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};

use super::{db_err, from_db_time, to_db_time};

/// Storage pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoragePool {
    pub id: String,
    pub name: String,
    pub pool_type: String,
    pub status: PoolStatus,
    pub config: PoolConfig,
    pub capacity_gb: u64,
    pub allocated_gb: u64,
    pub node_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StoragePool {
    /// Invariant: available = capacity - allocated
    pub fn available_gb(&self) -> u64 {
        self.capacity_gb.saturating_sub(self.allocated_gb)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolStatus {
    Active,
    Inactive,
    Error,
}

impl PoolStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PoolStatus::Active => "active",
            PoolStatus::Inactive => "inactive",
            PoolStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "active" => PoolStatus::Active,
            "error" => PoolStatus::Error,
            _ => PoolStatus::Inactive,
        }
    }
}

fn row_to_pool(row: &SqliteRow) -> Result<StoragePool> {
    let config_raw: String = row.get("config");
    let config: PoolConfig = serde_json::from_str(&config_raw)
        .map_err(|e| Error::Database(format!("bad pool config: {}", e)))?;
    Ok(StoragePool {
        id: row.get("id"),
        name: row.get("name"),
        pool_type: row.get("pool_type"),
        status: PoolStatus::parse(row.get("status")),
        config,
        capacity_gb: row.get::<i64, _>("capacity_gb") as u64,
        allocated_gb: row.get::<i64, _>("allocated_gb") as u64,
        node_id: row.get("node_id"),
        created_at: from_db_time(row.get("created_at"))?,
        updated_at: from_db_time(row.get("updated_at"))?,
    })
}

pub async fn get(pool: &SqlitePool, id: &str) -> Result<StoragePool> {
    let row = sqlx::query("SELECT * FROM storage_pools WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(|e| db_err("failed to load storage pool", e))?
        .ok_or_else(|| Error::PoolNotFound(id.to_string()))?;
    row_to_pool(&row)
}

pub async fn get_by_name(pool: &SqlitePool, name: &str) -> Result<Option<StoragePool>> {
    let row = sqlx::query("SELECT * FROM storage_pools WHERE name = ?")
        .bind(name)
        .fetch_optional(pool)
        .await
        .map_err(|e| db_err("failed to load storage pool", e))?;
    row.as_ref().map(row_to_pool).transpose()
}

pub async fn list(
    pool: &SqlitePool,
    page: usize,
    page_size: usize,
) -> Result<(Vec<StoragePool>, usize)> {
    let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM storage_pools")
        .fetch_one(pool)
        .await
        .map_err(|e| db_err("failed to count storage pools", e))?;

    let rows = sqlx::query("SELECT * FROM storage_pools ORDER BY name LIMIT ? OFFSET ?")
        .bind(page_size as i64)
        .bind(((page - 1) * page_size) as i64)
        .fetch_all(pool)
        .await
        .map_err(|e| db_err("failed to list storage pools", e))?;

    let mut pools = Vec::with_capacity(rows.len());
    for row in &rows {
        pools.push(row_to_pool(row)?);
    }
    Ok((pools, total as usize))
}

pub async fn insert(pool: &SqlitePool, p: &StoragePool) -> Result<()> {
    sqlx::query(
        "INSERT INTO storage_pools (id, name, pool_type, status, config, capacity_gb,
             allocated_gb, node_id, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&p.id)
    .bind(&p.name)
    .bind(&p.pool_type)
    .bind(p.status.as_str())
    .bind(serde_json::to_string(&p.config)?)
    .bind(p.capacity_gb as i64)
    .bind(p.allocated_gb as i64)
    .bind(&p.node_id)
    .bind(to_db_time(p.created_at))
    .bind(to_db_time(p.updated_at))
    .execute(pool)
    .await
    .map_err(|e| db_err("failed to insert storage pool", e))?;
    Ok(())
}

#[allow(dead_code)]
pub async fn set_status(pool: &SqlitePool, id: &str, status: PoolStatus) -> Result<()> {
    sqlx::query("UPDATE storage_pools SET status = ?, updated_at = ? WHERE id = ?")
        .bind(status.as_str())
        .bind(to_db_time(Utc::now()))
        .bind(id)
        .execute(pool)
        .await
        .map_err(|e| db_err("failed to update pool status", e))?;
    Ok(())
}

pub async fn update(
    pool: &SqlitePool,
    id: &str,
    name: &str,
    capacity_gb: u64,
    status: PoolStatus,
) -> Result<()> {
    sqlx::query(
        "UPDATE storage_pools SET name = ?, capacity_gb = ?, status = ?, updated_at = ?
         WHERE id = ?",
    )
    .bind(name)
    .bind(capacity_gb as i64)
    .bind(status.as_str())
    .bind(to_db_time(Utc::now()))
    .bind(id)
    .execute(pool)
    .await
    .map_err(|e| db_err("failed to update storage pool", e))?;
    Ok(())
}

/// Recompute `allocated_gb` from the live volume rows. Runs inside every
/// volume-mutating transaction so the accounting is correct at commit.
pub async fn recompute_allocation_tx(conn: &mut SqliteConnection, pool_id: &str) -> Result<()> {
    sqlx::query(
        "UPDATE storage_pools SET allocated_gb = (
             SELECT COALESCE(SUM(size_gb), 0) FROM volumes
             WHERE pool_id = ? AND status NOT IN ('deleting', 'error')
         ), updated_at = ?
         WHERE id = ?",
    )
    .bind(pool_id)
    .bind(to_db_time(Utc::now()))
    .bind(pool_id)
    .execute(conn)
    .await
    .map_err(|e| db_err("failed to recompute pool allocation", e))?;
    Ok(())
}

pub async fn delete(pool: &SqlitePool, id: &str) -> Result<()> {
    let res = sqlx::query("DELETE FROM storage_pools WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await
        .map_err(|e| db_err("failed to delete storage pool", e))?;
    if res.rows_affected() == 0 {
        return Err(Error::PoolNotFound(id.to_string()));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db::test_db;

    pub(crate) fn sample_pool(id: &str, name: &str) -> StoragePool {
        let now = Utc::now();
        StoragePool {
            id: id.to_string(),
            name: name.to_string(),
            pool_type: "nfs".to_string(),
            status: PoolStatus::Active,
            config: PoolConfig::Nfs {
                server: "10.0.0.5".to_string(),
                export: "/export/vms".to_string(),
                mount_point: "/mnt/ironhive/nfs0".to_string(),
            },
            capacity_gb: 500,
            allocated_gb: 0,
            node_id: Some("n1".to_string()),
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_insert_get_round_trip() {
        let db = test_db().await;
        let p = sample_pool("p1", "nfs0");
        insert(db.pool(), &p).await.unwrap();

        let loaded = get(db.pool(), "p1").await.unwrap();
        assert_eq!(loaded.config, p.config);
        assert_eq!(loaded.available_gb(), 500);
    }

    #[tokio::test]
    async fn test_unique_name() {
        let db = test_db().await;
        insert(db.pool(), &sample_pool("p1", "nfs0")).await.unwrap();
        assert!(insert(db.pool(), &sample_pool("p2", "nfs0")).await.is_err());
    }
}
