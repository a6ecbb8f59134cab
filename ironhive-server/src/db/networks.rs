//! Network rows

use chrono::{DateTime, Utc};
use ironhive_common::{Error, Result};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};

use super::{db_err, from_db_time, to_db_time};

/// Layer-2 domain with a CIDR for IPAM
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Network {
    pub id: String,
    pub name: String,
    pub network_type: String,
    pub cidr: String,
    pub gateway: Option<String>,
    pub mtu: u32,
    pub vlan_id: Option<u16>,
    pub node_id: Option<String>,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Network {
    /// Bridge name by convention: `br-vlan<id>` when tagged, `br-default`
    /// otherwise
    pub fn bridge_name(&self) -> String {
        match self.vlan_id {
            Some(vlan) => format!("br-vlan{}", vlan),
            None => "br-default".to_string(),
        }
    }
}

fn row_to_network(row: &SqliteRow) -> Result<Network> {
    Ok(Network {
        id: row.get("id"),
        name: row.get("name"),
        network_type: row.get("network_type"),
        cidr: row.get("cidr"),
        gateway: row.get("gateway"),
        mtu: row.get::<i64, _>("mtu") as u32,
        vlan_id: row.get::<Option<i64>, _>("vlan_id").map(|v| v as u16),
        node_id: row.get("node_id"),
        status: row.get("status"),
        created_at: from_db_time(row.get("created_at"))?,
        updated_at: from_db_time(row.get("updated_at"))?,
    })
}

pub async fn get(pool: &SqlitePool, id: &str) -> Result<Network> {
    let row = sqlx::query("SELECT * FROM networks WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(|e| db_err("failed to load network", e))?
        .ok_or_else(|| Error::NetworkNotFound(id.to_string()))?;
    row_to_network(&row)
}

pub async fn list(
    pool: &SqlitePool,
    page: usize,
    page_size: usize,
) -> Result<(Vec<Network>, usize)> {
    let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM networks")
        .fetch_one(pool)
        .await
        .map_err(|e| db_err("failed to count networks", e))?;

    let rows = sqlx::query("SELECT * FROM networks ORDER BY name LIMIT ? OFFSET ?")
        .bind(page_size as i64)
        .bind(((page - 1) * page_size) as i64)
        .fetch_all(pool)
        .await
        .map_err(|e| db_err("failed to list networks", e))?;

    let mut networks = Vec::with_capacity(rows.len());
    for row in &rows {
        networks.push(row_to_network(row)?);
    }
    Ok((networks, total as usize))
}

pub async fn insert_tx(conn: &mut SqliteConnection, n: &Network) -> Result<()> {
    sqlx::query(
        "INSERT INTO networks (id, name, network_type, cidr, gateway, mtu, vlan_id,
             node_id, status, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&n.id)
    .bind(&n.name)
    .bind(&n.network_type)
    .bind(&n.cidr)
    .bind(&n.gateway)
    .bind(n.mtu as i64)
    .bind(n.vlan_id.map(|v| v as i64))
    .bind(&n.node_id)
    .bind(&n.status)
    .bind(to_db_time(n.created_at))
    .bind(to_db_time(n.updated_at))
    .execute(conn)
    .await
    .map_err(|e| db_err("failed to insert network", e))?;
    Ok(())
}

pub async fn rename(pool: &SqlitePool, id: &str, name: &str) -> Result<()> {
    let res = sqlx::query("UPDATE networks SET name = ?, updated_at = ? WHERE id = ?")
        .bind(name)
        .bind(to_db_time(Utc::now()))
        .bind(id)
        .execute(pool)
        .await
        .map_err(|e| db_err("failed to rename network", e))?;
    if res.rows_affected() == 0 {
        return Err(Error::NetworkNotFound(id.to_string()));
    }
    Ok(())
}

pub async fn delete_tx(conn: &mut SqliteConnection, id: &str) -> Result<()> {
    let res = sqlx::query("DELETE FROM networks WHERE id = ?")
        .bind(id)
        .execute(&mut *conn)
        .await
        .map_err(|e| db_err("failed to delete network", e))?;
    if res.rows_affected() == 0 {
        return Err(Error::NetworkNotFound(id.to_string()));
    }
    // Address rows belong to the network and leave with it.
    sqlx::query("DELETE FROM ip_allocations WHERE network_id = ?")
        .bind(id)
        .execute(conn)
        .await
        .map_err(|e| db_err("failed to delete network addresses", e))?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db::test_db;

    pub(crate) fn sample_network(id: &str, vlan: Option<u16>) -> Network {
        let now = Utc::now();
        Network {
            id: id.to_string(),
            name: format!("net-{}", id),
            network_type: "bridge".to_string(),
            cidr: "10.0.1.0/24".to_string(),
            gateway: Some("10.0.1.1".to_string()),
            mtu: 1500,
            vlan_id: vlan,
            node_id: None,
            status: "active".to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_bridge_name_convention() {
        assert_eq!(sample_network("n", Some(100)).bridge_name(), "br-vlan100");
        assert_eq!(sample_network("n", None).bridge_name(), "br-default");
    }

    #[tokio::test]
    async fn test_insert_and_rename() {
        let db = test_db().await;
        let mut conn = db.pool().acquire().await.unwrap();
        insert_tx(&mut conn, &sample_network("net-1", None)).await.unwrap();
        drop(conn);

        rename(db.pool(), "net-1", "backbone").await.unwrap();
        assert_eq!(get(db.pool(), "net-1").await.unwrap().name, "backbone");
    }
}
