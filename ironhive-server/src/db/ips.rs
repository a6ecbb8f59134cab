//! IP allocation rows
//!
//! One row exists for every address a network can ever hand out; rows move
//! between `available`, `allocated`, and `reserved` but are never created
//! or destroyed outside network create/delete.

use chrono::{DateTime, Utc};
use ironhive_common::{Error, Result};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use std::net::Ipv4Addr;
use uuid::Uuid;

use super::{db_err, from_db_time, from_db_time_opt, to_db_time};

/// One address within a network
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpAllocation {
    pub id: String,
    pub network_id: String,
    pub ip_address: String,
    pub mac_address: Option<String>,
    pub vm_id: Option<String>,
    pub status: IpStatus,
    pub allocated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpStatus {
    Available,
    Allocated,
    Reserved,
}

impl IpStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IpStatus::Available => "available",
            IpStatus::Allocated => "allocated",
            IpStatus::Reserved => "reserved",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "allocated" => IpStatus::Allocated,
            "reserved" => IpStatus::Reserved,
            _ => IpStatus::Available,
        }
    }
}

fn row_to_ip(row: &SqliteRow) -> Result<IpAllocation> {
    Ok(IpAllocation {
        id: row.get("id"),
        network_id: row.get("network_id"),
        ip_address: row.get("ip_address"),
        mac_address: row.get("mac_address"),
        vm_id: row.get("vm_id"),
        status: IpStatus::parse(row.get("status")),
        allocated_at: from_db_time_opt(row.get("allocated_at"))?,
        created_at: from_db_time(row.get("created_at"))?,
    })
}

/// Bulk-insert the pre-materialized address rows for a new network
pub async fn materialize_tx(
    conn: &mut SqliteConnection,
    network_id: &str,
    addresses: &[Ipv4Addr],
) -> Result<()> {
    let now = to_db_time(Utc::now());
    for addr in addresses {
        sqlx::query(
            "INSERT INTO ip_allocations (id, network_id, ip_address, ip_numeric, status, created_at)
             VALUES (?, ?, ?, ?, 'available', ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(network_id)
        .bind(addr.to_string())
        .bind(u32::from(*addr) as i64)
        .bind(&now)
        .execute(&mut *conn)
        .await
        .map_err(|e| db_err("failed to materialize address", e))?;
    }
    Ok(())
}

#[allow(dead_code)]
pub async fn get(pool: &SqlitePool, id: &str) -> Result<IpAllocation> {
    let row = sqlx::query("SELECT * FROM ip_allocations WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(|e| db_err("failed to load allocation", e))?
        .ok_or_else(|| Error::Validation(format!("ip allocation '{}' not found", id)))?;
    row_to_ip(&row)
}

/// Atomically claim the lowest available address. The caller must hold the
/// per-network allocation lock; the guarded UPDATE makes a lost race a hard
/// error rather than a silent double-allocation.
pub async fn claim_next_tx(
    conn: &mut SqliteConnection,
    network_id: &str,
) -> Result<IpAllocation> {
    let row = sqlx::query(
        "SELECT * FROM ip_allocations
         WHERE network_id = ? AND status = 'available'
         ORDER BY ip_numeric ASC LIMIT 1",
    )
    .bind(network_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| db_err("failed to find available address", e))?
    .ok_or_else(|| Error::IpExhausted(network_id.to_string()))?;

    let allocation = row_to_ip(&row)?;
    let res = sqlx::query(
        "UPDATE ip_allocations SET status = 'allocated', allocated_at = ?
         WHERE id = ? AND status = 'available'",
    )
    .bind(to_db_time(Utc::now()))
    .bind(&allocation.id)
    .execute(conn)
    .await
    .map_err(|e| db_err("failed to claim address", e))?;

    if res.rows_affected() == 0 {
        return Err(Error::IpExhausted(network_id.to_string()));
    }
    get_after_claim(allocation)
}

fn get_after_claim(mut allocation: IpAllocation) -> Result<IpAllocation> {
    allocation.status = IpStatus::Allocated;
    allocation.allocated_at = Some(Utc::now());
    Ok(allocation)
}

/// Link an allocation to a VM once the VM row exists; idempotent
pub async fn associate_tx(
    conn: &mut SqliteConnection,
    allocation_id: &str,
    vm_id: &str,
    mac_address: Option<&str>,
) -> Result<()> {
    sqlx::query(
        "UPDATE ip_allocations SET vm_id = ?, mac_address = COALESCE(?, mac_address)
         WHERE id = ?",
    )
    .bind(vm_id)
    .bind(mac_address)
    .bind(allocation_id)
    .execute(conn)
    .await
    .map_err(|e| db_err("failed to associate address", e))?;
    Ok(())
}

/// Return every address a VM holds in a network to the pool
pub async fn release_for_vm_tx(
    conn: &mut SqliteConnection,
    network_id: &str,
    vm_id: &str,
) -> Result<usize> {
    let res = sqlx::query(
        "UPDATE ip_allocations SET status = 'available', vm_id = NULL, mac_address = NULL,
             allocated_at = NULL
         WHERE network_id = ? AND vm_id = ?",
    )
    .bind(network_id)
    .bind(vm_id)
    .execute(conn)
    .await
    .map_err(|e| db_err("failed to release addresses", e))?;
    Ok(res.rows_affected() as usize)
}

/// Move a specific address `available -> reserved`
pub async fn reserve_tx(
    conn: &mut SqliteConnection,
    network_id: &str,
    ip_address: &str,
) -> Result<IpAllocation> {
    let res = sqlx::query(
        "UPDATE ip_allocations SET status = 'reserved', allocated_at = ?
         WHERE network_id = ? AND ip_address = ? AND status = 'available'",
    )
    .bind(to_db_time(Utc::now()))
    .bind(network_id)
    .bind(ip_address)
    .execute(&mut *conn)
    .await
    .map_err(|e| db_err("failed to reserve address", e))?;

    if res.rows_affected() == 0 {
        return Err(Error::Precondition(format!(
            "address {} is not available in network {}",
            ip_address, network_id
        )));
    }

    let row = sqlx::query("SELECT * FROM ip_allocations WHERE network_id = ? AND ip_address = ?")
        .bind(network_id)
        .bind(ip_address)
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| db_err("failed to reload address", e))?;
    row_to_ip(&row)
}

/// Explicitly release one address regardless of holder
pub async fn release_address_tx(
    conn: &mut SqliteConnection,
    network_id: &str,
    ip_address: &str,
) -> Result<()> {
    let res = sqlx::query(
        "UPDATE ip_allocations SET status = 'available', vm_id = NULL, mac_address = NULL,
             allocated_at = NULL
         WHERE network_id = ? AND ip_address = ?",
    )
    .bind(network_id)
    .bind(ip_address)
    .execute(conn)
    .await
    .map_err(|e| db_err("failed to release address", e))?;
    if res.rows_affected() == 0 {
        return Err(Error::Validation(format!(
            "address {} does not belong to network {}",
            ip_address, network_id
        )));
    }
    Ok(())
}

pub async fn list(
    pool: &SqlitePool,
    network_id: &str,
    page: usize,
    page_size: usize,
    status: Option<&str>,
) -> Result<(Vec<IpAllocation>, usize)> {
    let mut where_clause = String::from("WHERE network_id = ?");
    if status.is_some() {
        where_clause.push_str(" AND status = ?");
    }

    let count_sql = format!("SELECT COUNT(*) FROM ip_allocations {}", where_clause);
    let mut count_query = sqlx::query_scalar::<_, i64>(&count_sql).bind(network_id);
    if let Some(s) = status {
        count_query = count_query.bind(s);
    }
    let total = count_query
        .fetch_one(pool)
        .await
        .map_err(|e| db_err("failed to count allocations", e))?;

    let list_sql = format!(
        "SELECT * FROM ip_allocations {} ORDER BY ip_numeric ASC LIMIT ? OFFSET ?",
        where_clause
    );
    let mut list_query = sqlx::query(&list_sql).bind(network_id);
    if let Some(s) = status {
        list_query = list_query.bind(s);
    }
    let rows = list_query
        .bind(page_size as i64)
        .bind(((page - 1) * page_size) as i64)
        .fetch_all(pool)
        .await
        .map_err(|e| db_err("failed to list allocations", e))?;

    let mut allocations = Vec::with_capacity(rows.len());
    for row in &rows {
        allocations.push(row_to_ip(row)?);
    }
    Ok((allocations, total as usize))
}

/// Count of rows not `available` (used by the network delete guard)
pub async fn count_held(pool: &SqlitePool, network_id: &str) -> Result<usize> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM ip_allocations WHERE network_id = ? AND status != 'available'",
    )
    .bind(network_id)
    .fetch_one(pool)
    .await
    .map_err(|e| db_err("failed to count held addresses", e))?;
    Ok(count as usize)
}

#[allow(dead_code)]
pub async fn count_available(pool: &SqlitePool, network_id: &str) -> Result<usize> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM ip_allocations WHERE network_id = ? AND status = 'available'",
    )
    .bind(network_id)
    .fetch_one(pool)
    .await
    .map_err(|e| db_err("failed to count available addresses", e))?;
    Ok(count as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_db;

    async fn seed(pool: &SqlitePool, network_id: &str, count: u32) {
        let addresses: Vec<Ipv4Addr> = (1..=count)
            .map(|i| Ipv4Addr::from(u32::from(Ipv4Addr::new(10, 0, 1, 0)) + i))
            .collect();
        let mut conn = pool.acquire().await.unwrap();
        materialize_tx(&mut conn, network_id, &addresses).await.unwrap();
    }

    #[tokio::test]
    async fn test_claim_lowest_first() {
        let db = test_db().await;
        seed(db.pool(), "net-1", 3).await;

        let mut conn = db.pool().acquire().await.unwrap();
        let a = claim_next_tx(&mut conn, "net-1").await.unwrap();
        let b = claim_next_tx(&mut conn, "net-1").await.unwrap();
        assert_eq!(a.ip_address, "10.0.1.1");
        assert_eq!(b.ip_address, "10.0.1.2");
        assert_eq!(a.status, IpStatus::Allocated);
    }

    #[tokio::test]
    async fn test_exhaustion() {
        let db = test_db().await;
        seed(db.pool(), "net-1", 1).await;

        let mut conn = db.pool().acquire().await.unwrap();
        claim_next_tx(&mut conn, "net-1").await.unwrap();
        let err = claim_next_tx(&mut conn, "net-1").await.unwrap_err();
        assert!(matches!(err, Error::IpExhausted(_)));
    }

    #[tokio::test]
    async fn test_release_restores_pre_allocate_state() {
        let db = test_db().await;
        seed(db.pool(), "net-1", 2).await;

        let mut conn = db.pool().acquire().await.unwrap();
        let a = claim_next_tx(&mut conn, "net-1").await.unwrap();
        associate_tx(&mut conn, &a.id, "vm-1", Some("52:54:00:00:00:01"))
            .await
            .unwrap();
        assert_eq!(count_available(db.pool(), "net-1").await.unwrap(), 1);

        let released = release_for_vm_tx(&mut conn, "net-1", "vm-1").await.unwrap();
        assert_eq!(released, 1);
        drop(conn);
        assert_eq!(count_available(db.pool(), "net-1").await.unwrap(), 2);

        let reloaded = get(db.pool(), &a.id).await.unwrap();
        assert_eq!(reloaded.status, IpStatus::Available);
        assert!(reloaded.vm_id.is_none());
        assert!(reloaded.mac_address.is_none());
        assert!(reloaded.allocated_at.is_none());
    }

    #[tokio::test]
    async fn test_reserved_excluded_from_allocation() {
        let db = test_db().await;
        seed(db.pool(), "net-1", 2).await;

        let mut conn = db.pool().acquire().await.unwrap();
        reserve_tx(&mut conn, "net-1", "10.0.1.1").await.unwrap();
        let a = claim_next_tx(&mut conn, "net-1").await.unwrap();
        assert_eq!(a.ip_address, "10.0.1.2");

        // Reserving a held address is a precondition failure.
        assert!(reserve_tx(&mut conn, "net-1", "10.0.1.1").await.is_err());
        assert_eq!(count_held(db.pool(), "net-1").await.unwrap(), 2);
    }
}
