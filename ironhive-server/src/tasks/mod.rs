//! Task bookkeeping
//!
//! Wraps the task table with the broadcast side effects every transition
//! carries: each status or progress change is pushed to the front-end
//! channel in commit order.

use chrono::Utc;
use ironhive_common::Result;
use sqlx::SqliteConnection;
use std::sync::Arc;
use uuid::Uuid;

use crate::db::tasks::{self, Task, TaskStatus, DEFAULT_MAX_RETRIES};
use crate::db::Database;
use crate::websocket::WsState;

pub struct TaskManager {
    db: Arc<Database>,
    ws: Arc<WsState>,
}

impl TaskManager {
    pub fn new(db: Arc<Database>, ws: Arc<WsState>) -> Self {
        Self { db, ws }
    }

    /// Build a pending task row. Inserted by the caller inside the same
    /// transaction that commits the entity's intent state.
    pub fn build(
        &self,
        task_type: &str,
        target_type: &str,
        target_id: &str,
        node_id: Option<&str>,
        payload: serde_json::Value,
        created_by: &str,
    ) -> Task {
        let now = Utc::now();
        Task {
            id: Uuid::new_v4().to_string(),
            task_type: task_type.to_string(),
            status: TaskStatus::Pending,
            progress: 0,
            payload: Some(payload),
            result: None,
            error: None,
            target_type: target_type.to_string(),
            target_id: target_id.to_string(),
            node_id: node_id.map(|n| n.to_string()),
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            created_by: created_by.to_string(),
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub async fn insert_tx(&self, conn: &mut SqliteConnection, task: &Task) -> Result<()> {
        tasks::insert_tx(conn, task).await
    }

    pub async fn get(&self, id: &str) -> Result<Task> {
        tasks::get(self.db.pool(), id).await
    }

    pub async fn list(
        &self,
        page: usize,
        page_size: usize,
        status: Option<&str>,
    ) -> Result<(Vec<Task>, usize)> {
        tasks::list(self.db.pool(), page, page_size, status).await
    }

    pub async fn mark_running(&self, id: &str) -> Result<()> {
        tasks::mark_running(self.db.pool(), id).await?;
        self.ws.task_status(id, "running", 0);
        Ok(())
    }

    pub async fn progress(&self, id: &str, progress: u8) -> Result<()> {
        tasks::set_progress(self.db.pool(), id, progress).await?;
        self.ws.task_status(id, "running", progress.min(100));
        Ok(())
    }

    pub async fn complete(&self, id: &str, result: Option<serde_json::Value>) -> Result<()> {
        if tasks::finish(
            self.db.pool(),
            id,
            TaskStatus::Completed,
            result.as_ref(),
            None,
        )
        .await?
        {
            self.ws.task_status(id, "completed", 100);
        }
        Ok(())
    }

    pub async fn fail(&self, id: &str, error: &str) -> Result<()> {
        if tasks::finish(self.db.pool(), id, TaskStatus::Failed, None, Some(error)).await? {
            self.ws.task_status(id, "failed", 0);
        }
        Ok(())
    }

    pub async fn cancel(&self, id: &str) -> Result<()> {
        if tasks::finish(self.db.pool(), id, TaskStatus::Cancelled, None, None).await? {
            self.ws.task_status(id, "cancelled", 0);
        }
        Ok(())
    }

    /// Re-arm a failed task for a retry that reuses the same id
    pub async fn rearm(&self, id: &str) -> Result<Task> {
        let task = tasks::rearm_for_retry(self.db.pool(), id).await?;
        self.ws.task_status(id, "running", task.progress);
        Ok(task)
    }
}
