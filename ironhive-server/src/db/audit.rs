//! Audit log rows (append-only)

use chrono::{DateTime, Utc};
use ironhive_common::Result;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use super::{db_err, from_db_time, to_db_time};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: i64,
    pub username: String,
    pub action: String,
    pub target_type: String,
    pub target_id: String,
    pub details: Option<String>,
    pub created_at: DateTime<Utc>,
}

fn row_to_entry(row: &SqliteRow) -> Result<AuditEntry> {
    Ok(AuditEntry {
        id: row.get("id"),
        username: row.get("username"),
        action: row.get("action"),
        target_type: row.get("target_type"),
        target_id: row.get("target_id"),
        details: row.get("details"),
        created_at: from_db_time(row.get("created_at"))?,
    })
}

pub async fn append(
    pool: &SqlitePool,
    username: &str,
    action: &str,
    target_type: &str,
    target_id: &str,
    details: Option<&str>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO audit_log (username, action, target_type, target_id, details, created_at)
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(username)
    .bind(action)
    .bind(target_type)
    .bind(target_id)
    .bind(details)
    .bind(to_db_time(Utc::now()))
    .execute(pool)
    .await
    .map_err(|e| db_err("failed to append audit entry", e))?;
    Ok(())
}

pub async fn list(
    pool: &SqlitePool,
    page: usize,
    page_size: usize,
) -> Result<(Vec<AuditEntry>, usize)> {
    let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM audit_log")
        .fetch_one(pool)
        .await
        .map_err(|e| db_err("failed to count audit entries", e))?;

    let rows = sqlx::query("SELECT * FROM audit_log ORDER BY id DESC LIMIT ? OFFSET ?")
        .bind(page_size as i64)
        .bind(((page - 1) * page_size) as i64)
        .fetch_all(pool)
        .await
        .map_err(|e| db_err("failed to list audit entries", e))?;

    let mut entries = Vec::with_capacity(rows.len());
    for row in &rows {
        entries.push(row_to_entry(row)?);
    }
    Ok((entries, total as usize))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_db;

    #[tokio::test]
    async fn test_append_and_list_newest_first() {
        let db = test_db().await;
        append(db.pool(), "admin", "vm.create", "vm", "vm-1", None)
            .await
            .unwrap();
        append(db.pool(), "admin", "vm.start", "vm", "vm-1", Some("{\"node\":\"n1\"}"))
            .await
            .unwrap();

        let (entries, total) = list(db.pool(), 1, 10).await.unwrap();
        assert_eq!(total, 2);
        assert_eq!(entries[0].action, "vm.start");
        assert_eq!(entries[1].action, "vm.create");
    }
}
