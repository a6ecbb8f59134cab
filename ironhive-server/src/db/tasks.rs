//! Task rows
//!
//! Tasks are the durable record of every asynchronous operation. Progress
//! is monotonically non-decreasing and a terminal status is assigned
//! exactly once; both are enforced in SQL so no caller can regress a task.

use chrono::{DateTime, Utc};
use ironhive_common::{Error, Result};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};

use super::{db_err, from_db_time, from_db_time_opt, to_db_time};

pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Durable record of an asynchronous operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub task_type: String,
    pub status: TaskStatus,
    pub progress: u8,
    pub payload: Option<serde_json::Value>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub target_type: String,
    pub target_id: String,
    pub node_id: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "running" => TaskStatus::Running,
            "completed" => TaskStatus::Completed,
            "failed" => TaskStatus::Failed,
            "cancelled" => TaskStatus::Cancelled,
            _ => TaskStatus::Pending,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

fn row_to_task(row: &SqliteRow) -> Result<Task> {
    let payload: Option<String> = row.get("payload");
    let result: Option<String> = row.get("result");
    Ok(Task {
        id: row.get("id"),
        task_type: row.get("task_type"),
        status: TaskStatus::parse(row.get("status")),
        progress: row.get::<i64, _>("progress") as u8,
        payload: payload.and_then(|p| serde_json::from_str(&p).ok()),
        result: result.and_then(|r| serde_json::from_str(&r).ok()),
        error: row.get("error"),
        target_type: row.get("target_type"),
        target_id: row.get("target_id"),
        node_id: row.get("node_id"),
        retry_count: row.get::<i64, _>("retry_count") as u32,
        max_retries: row.get::<i64, _>("max_retries") as u32,
        created_by: row.get("created_by"),
        created_at: from_db_time(row.get("created_at"))?,
        updated_at: from_db_time(row.get("updated_at"))?,
        completed_at: from_db_time_opt(row.get("completed_at"))?,
    })
}

pub async fn get(pool: &SqlitePool, id: &str) -> Result<Task> {
    let row = sqlx::query("SELECT * FROM tasks WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(|e| db_err("failed to load task", e))?
        .ok_or_else(|| Error::TaskNotFound(id.to_string()))?;
    row_to_task(&row)
}

pub async fn list(
    pool: &SqlitePool,
    page: usize,
    page_size: usize,
    status: Option<&str>,
) -> Result<(Vec<Task>, usize)> {
    let mut where_clause = String::from("WHERE 1=1");
    if status.is_some() {
        where_clause.push_str(" AND status = ?");
    }

    let count_sql = format!("SELECT COUNT(*) FROM tasks {}", where_clause);
    let mut count_query = sqlx::query_scalar::<_, i64>(&count_sql);
    if let Some(s) = status {
        count_query = count_query.bind(s);
    }
    let total = count_query
        .fetch_one(pool)
        .await
        .map_err(|e| db_err("failed to count tasks", e))?;

    let list_sql = format!(
        "SELECT * FROM tasks {} ORDER BY created_at DESC LIMIT ? OFFSET ?",
        where_clause
    );
    let mut list_query = sqlx::query(&list_sql);
    if let Some(s) = status {
        list_query = list_query.bind(s);
    }
    let rows = list_query
        .bind(page_size as i64)
        .bind(((page - 1) * page_size) as i64)
        .fetch_all(pool)
        .await
        .map_err(|e| db_err("failed to list tasks", e))?;

    let mut tasks = Vec::with_capacity(rows.len());
    for row in &rows {
        tasks.push(row_to_task(row)?);
    }
    Ok((tasks, total as usize))
}

/// Most recent task of any status for an entity
pub async fn find_latest_for_target(
    pool: &SqlitePool,
    target_type: &str,
    target_id: &str,
) -> Result<Option<Task>> {
    let row = sqlx::query(
        "SELECT * FROM tasks WHERE target_type = ? AND target_id = ?
         ORDER BY created_at DESC LIMIT 1",
    )
    .bind(target_type)
    .bind(target_id)
    .fetch_optional(pool)
    .await
    .map_err(|e| db_err("failed to find task", e))?;
    row.as_ref().map(row_to_task).transpose()
}

pub async fn insert_tx(conn: &mut SqliteConnection, task: &Task) -> Result<()> {
    sqlx::query(
        "INSERT INTO tasks (id, task_type, status, progress, payload, result, error,
             target_type, target_id, node_id, retry_count, max_retries, created_by,
             created_at, updated_at, completed_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&task.id)
    .bind(&task.task_type)
    .bind(task.status.as_str())
    .bind(task.progress as i64)
    .bind(task.payload.as_ref().map(|p| p.to_string()))
    .bind(task.result.as_ref().map(|r| r.to_string()))
    .bind(&task.error)
    .bind(&task.target_type)
    .bind(&task.target_id)
    .bind(&task.node_id)
    .bind(task.retry_count as i64)
    .bind(task.max_retries as i64)
    .bind(&task.created_by)
    .bind(to_db_time(task.created_at))
    .bind(to_db_time(task.updated_at))
    .bind(task.completed_at.map(to_db_time))
    .execute(conn)
    .await
    .map_err(|e| db_err("failed to insert task", e))?;
    Ok(())
}

/// Move a pending task to running
pub async fn mark_running(pool: &SqlitePool, id: &str) -> Result<()> {
    sqlx::query(
        "UPDATE tasks SET status = 'running', updated_at = ? WHERE id = ? AND status = 'pending'",
    )
    .bind(to_db_time(Utc::now()))
    .bind(id)
    .execute(pool)
    .await
    .map_err(|e| db_err("failed to mark task running", e))?;
    Ok(())
}

/// Raise progress; `MAX()` keeps it monotonic even with out-of-order
/// stream frames, and terminal tasks never move.
pub async fn set_progress(pool: &SqlitePool, id: &str, progress: u8) -> Result<()> {
    sqlx::query(
        "UPDATE tasks SET progress = MAX(progress, ?), updated_at = ?
         WHERE id = ? AND status IN ('pending', 'running')",
    )
    .bind(progress.min(100) as i64)
    .bind(to_db_time(Utc::now()))
    .bind(id)
    .execute(pool)
    .await
    .map_err(|e| db_err("failed to update task progress", e))?;
    Ok(())
}

/// Assign a terminal status. The WHERE clause makes the assignment
/// first-writer-wins: a task that already reached a terminal status keeps
/// it. Returns whether this call performed the transition.
pub async fn finish(
    pool: &SqlitePool,
    id: &str,
    status: TaskStatus,
    result: Option<&serde_json::Value>,
    error: Option<&str>,
) -> Result<bool> {
    debug_assert!(status.is_terminal());
    let progress = if status == TaskStatus::Completed { 100 } else { 0 };
    let res = sqlx::query(
        "UPDATE tasks SET status = ?, progress = MAX(progress, ?), result = ?, error = ?,
             updated_at = ?, completed_at = ?
         WHERE id = ? AND status IN ('pending', 'running')",
    )
    .bind(status.as_str())
    .bind(progress as i64)
    .bind(result.map(|r| r.to_string()))
    .bind(error)
    .bind(to_db_time(Utc::now()))
    .bind(to_db_time(Utc::now()))
    .bind(id)
    .execute(pool)
    .await
    .map_err(|e| db_err("failed to finish task", e))?;
    Ok(res.rows_affected() > 0)
}

/// Re-arm a failed task for another attempt, keeping the same id so the
/// agent can deduplicate. Fails the precondition once retries are spent.
pub async fn rearm_for_retry(pool: &SqlitePool, id: &str) -> Result<Task> {
    let task = get(pool, id).await?;
    if task.retry_count >= task.max_retries {
        return Err(Error::Precondition(format!(
            "task {} exhausted its {} retries",
            id, task.max_retries
        )));
    }
    sqlx::query(
        "UPDATE tasks SET status = 'running', retry_count = retry_count + 1, error = NULL,
             completed_at = NULL, updated_at = ?
         WHERE id = ?",
    )
    .bind(to_db_time(Utc::now()))
    .bind(id)
    .execute(pool)
    .await
    .map_err(|e| db_err("failed to re-arm task", e))?;
    get(pool, id).await
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db::test_db;

    pub(crate) fn sample_task(id: &str) -> Task {
        let now = Utc::now();
        Task {
            id: id.to_string(),
            task_type: "vm.start".to_string(),
            status: TaskStatus::Pending,
            progress: 0,
            payload: Some(serde_json::json!({"vm_id": "vm-1"})),
            result: None,
            error: None,
            target_type: "vm".to_string(),
            target_id: "vm-1".to_string(),
            node_id: Some("n1".to_string()),
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            created_by: "admin".to_string(),
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    #[tokio::test]
    async fn test_progress_is_monotonic() {
        let db = test_db().await;
        let mut conn = db.pool().acquire().await.unwrap();
        insert_tx(&mut conn, &sample_task("t1")).await.unwrap();
        drop(conn);

        set_progress(db.pool(), "t1", 60).await.unwrap();
        set_progress(db.pool(), "t1", 30).await.unwrap();
        assert_eq!(get(db.pool(), "t1").await.unwrap().progress, 60);
    }

    #[tokio::test]
    async fn test_terminal_status_assigned_once() {
        let db = test_db().await;
        let mut conn = db.pool().acquire().await.unwrap();
        insert_tx(&mut conn, &sample_task("t1")).await.unwrap();
        drop(conn);

        let first = finish(db.pool(), "t1", TaskStatus::Completed, None, None)
            .await
            .unwrap();
        let second = finish(db.pool(), "t1", TaskStatus::Failed, None, Some("late timeout"))
            .await
            .unwrap();
        assert!(first);
        assert!(!second);

        let task = get(db.pool(), "t1").await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.progress, 100);
        assert!(task.completed_at.is_some());
        assert!(task.error.is_none());
    }

    #[tokio::test]
    async fn test_progress_frozen_after_terminal() {
        let db = test_db().await;
        let mut conn = db.pool().acquire().await.unwrap();
        insert_tx(&mut conn, &sample_task("t1")).await.unwrap();
        drop(conn);

        finish(db.pool(), "t1", TaskStatus::Failed, None, Some("boom"))
            .await
            .unwrap();
        set_progress(db.pool(), "t1", 90).await.unwrap();
        assert_eq!(get(db.pool(), "t1").await.unwrap().progress, 0);
    }

    #[tokio::test]
    async fn test_retry_cap() {
        let db = test_db().await;
        let mut conn = db.pool().acquire().await.unwrap();
        let mut task = sample_task("t1");
        task.max_retries = 2;
        insert_tx(&mut conn, &task).await.unwrap();
        drop(conn);

        rearm_for_retry(db.pool(), "t1").await.unwrap();
        rearm_for_retry(db.pool(), "t1").await.unwrap();
        let err = rearm_for_retry(db.pool(), "t1").await.unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
    }
}
