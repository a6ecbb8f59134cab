//! Snapshot rows

use chrono::{DateTime, Utc};
use ironhive_common::{Error, Result};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use super::{db_err, from_db_time, to_db_time};

/// Point-in-time image of a volume
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub name: String,
    pub volume_id: String,
    pub status: SnapshotStatus,
    pub size_gb: Option<u64>,
    pub snapshot_tag: String,
    pub description: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotStatus {
    Creating,
    Available,
    Deleting,
    Error,
}

impl SnapshotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotStatus::Creating => "creating",
            SnapshotStatus::Available => "available",
            SnapshotStatus::Deleting => "deleting",
            SnapshotStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "available" => SnapshotStatus::Available,
            "deleting" => SnapshotStatus::Deleting,
            "error" => SnapshotStatus::Error,
            _ => SnapshotStatus::Creating,
        }
    }
}

fn row_to_snapshot(row: &SqliteRow) -> Result<Snapshot> {
    let metadata: Option<String> = row.get("metadata");
    Ok(Snapshot {
        id: row.get("id"),
        name: row.get("name"),
        volume_id: row.get("volume_id"),
        status: SnapshotStatus::parse(row.get("status")),
        size_gb: row.get::<Option<i64>, _>("size_gb").map(|v| v as u64),
        snapshot_tag: row.get("snapshot_tag"),
        description: row.get("description"),
        metadata: metadata.and_then(|m| serde_json::from_str(&m).ok()),
        created_at: from_db_time(row.get("created_at"))?,
        updated_at: from_db_time(row.get("updated_at"))?,
    })
}

pub async fn get(pool: &SqlitePool, id: &str) -> Result<Snapshot> {
    let row = sqlx::query("SELECT * FROM snapshots WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(|e| db_err("failed to load snapshot", e))?
        .ok_or_else(|| Error::SnapshotNotFound(id.to_string()))?;
    row_to_snapshot(&row)
}

pub async fn list(
    pool: &SqlitePool,
    page: usize,
    page_size: usize,
    volume_id: Option<&str>,
) -> Result<(Vec<Snapshot>, usize)> {
    let mut where_clause = String::from("WHERE 1=1");
    if volume_id.is_some() {
        where_clause.push_str(" AND volume_id = ?");
    }

    let count_sql = format!("SELECT COUNT(*) FROM snapshots {}", where_clause);
    let mut count_query = sqlx::query_scalar::<_, i64>(&count_sql);
    if let Some(v) = volume_id {
        count_query = count_query.bind(v);
    }
    let total = count_query
        .fetch_one(pool)
        .await
        .map_err(|e| db_err("failed to count snapshots", e))?;

    let list_sql = format!(
        "SELECT * FROM snapshots {} ORDER BY created_at DESC LIMIT ? OFFSET ?",
        where_clause
    );
    let mut list_query = sqlx::query(&list_sql);
    if let Some(v) = volume_id {
        list_query = list_query.bind(v);
    }
    let rows = list_query
        .bind(page_size as i64)
        .bind(((page - 1) * page_size) as i64)
        .fetch_all(pool)
        .await
        .map_err(|e| db_err("failed to list snapshots", e))?;

    let mut snapshots = Vec::with_capacity(rows.len());
    for row in &rows {
        snapshots.push(row_to_snapshot(row)?);
    }
    Ok((snapshots, total as usize))
}

pub async fn count_for_volume(pool: &SqlitePool, volume_id: &str) -> Result<usize> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM snapshots WHERE volume_id = ?")
        .bind(volume_id)
        .fetch_one(pool)
        .await
        .map_err(|e| db_err("failed to count snapshots", e))?;
    Ok(count as usize)
}

pub async fn list_by_status(pool: &SqlitePool, status: SnapshotStatus) -> Result<Vec<Snapshot>> {
    let rows = sqlx::query("SELECT * FROM snapshots WHERE status = ?")
        .bind(status.as_str())
        .fetch_all(pool)
        .await
        .map_err(|e| db_err("failed to list snapshots by status", e))?;
    let mut snapshots = Vec::with_capacity(rows.len());
    for row in &rows {
        snapshots.push(row_to_snapshot(row)?);
    }
    Ok(snapshots)
}

pub async fn insert(pool: &SqlitePool, s: &Snapshot) -> Result<()> {
    let mut conn = pool
        .acquire()
        .await
        .map_err(|e| db_err("failed to acquire connection", e))?;
    insert_tx(&mut conn, s).await
}

pub async fn insert_tx(conn: &mut sqlx::SqliteConnection, s: &Snapshot) -> Result<()> {
    sqlx::query(
        "INSERT INTO snapshots (id, name, volume_id, status, size_gb, snapshot_tag,
             description, metadata, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&s.id)
    .bind(&s.name)
    .bind(&s.volume_id)
    .bind(s.status.as_str())
    .bind(s.size_gb.map(|v| v as i64))
    .bind(&s.snapshot_tag)
    .bind(&s.description)
    .bind(s.metadata.as_ref().map(|m| m.to_string()))
    .bind(to_db_time(s.created_at))
    .bind(to_db_time(s.updated_at))
    .execute(conn)
    .await
    .map_err(|e| db_err("failed to insert snapshot", e))?;
    Ok(())
}

pub async fn set_status(pool: &SqlitePool, id: &str, status: SnapshotStatus) -> Result<()> {
    sqlx::query("UPDATE snapshots SET status = ?, updated_at = ? WHERE id = ?")
        .bind(status.as_str())
        .bind(to_db_time(Utc::now()))
        .bind(id)
        .execute(pool)
        .await
        .map_err(|e| db_err("failed to update snapshot status", e))?;
    Ok(())
}

pub async fn finish_create(
    pool: &SqlitePool,
    id: &str,
    tag: &str,
    size_gb: Option<u64>,
) -> Result<()> {
    sqlx::query(
        "UPDATE snapshots SET status = 'available', snapshot_tag = ?, size_gb = ?, updated_at = ?
         WHERE id = ? AND status = 'creating'",
    )
    .bind(tag)
    .bind(size_gb.map(|v| v as i64))
    .bind(to_db_time(Utc::now()))
    .bind(id)
    .execute(pool)
    .await
    .map_err(|e| db_err("failed to finish snapshot creation", e))?;
    Ok(())
}

pub async fn update_name_description(
    pool: &SqlitePool,
    id: &str,
    name: &str,
    description: Option<&str>,
) -> Result<()> {
    sqlx::query("UPDATE snapshots SET name = ?, description = ?, updated_at = ? WHERE id = ?")
        .bind(name)
        .bind(description)
        .bind(to_db_time(Utc::now()))
        .bind(id)
        .execute(pool)
        .await
        .map_err(|e| db_err("failed to update snapshot", e))?;
    Ok(())
}

pub async fn delete(pool: &SqlitePool, id: &str) -> Result<()> {
    sqlx::query("DELETE FROM snapshots WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await
        .map_err(|e| db_err("failed to delete snapshot", e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_db;

    fn sample(id: &str) -> Snapshot {
        let now = Utc::now();
        Snapshot {
            id: id.to_string(),
            name: format!("snap-{}", id),
            volume_id: "v1".to_string(),
            status: SnapshotStatus::Creating,
            size_gb: None,
            snapshot_tag: String::new(),
            description: Some("before upgrade".to_string()),
            metadata: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_create_flow() {
        let db = test_db().await;
        insert(db.pool(), &sample("s1")).await.unwrap();

        finish_create(db.pool(), "s1", "snap-s1-1700000000", Some(10))
            .await
            .unwrap();
        let s = get(db.pool(), "s1").await.unwrap();
        assert_eq!(s.status, SnapshotStatus::Available);
        assert_eq!(s.snapshot_tag, "snap-s1-1700000000");
        assert_eq!(s.size_gb, Some(10));
    }

    #[tokio::test]
    async fn test_list_by_volume() {
        let db = test_db().await;
        insert(db.pool(), &sample("s1")).await.unwrap();
        let mut other = sample("s2");
        other.volume_id = "v2".to_string();
        insert(db.pool(), &other).await.unwrap();

        let (snaps, total) = list(db.pool(), 1, 10, Some("v1")).await.unwrap();
        assert_eq!(total, 1);
        assert_eq!(snaps[0].id, "s1");
    }
}
