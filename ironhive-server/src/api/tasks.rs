//! Task inspection endpoints

use axum::{
    extract::{Path, Query, State},
    Extension, Json,
};
use std::sync::Arc;

use super::PageQuery;
use crate::auth::rbac::Permission;
use crate::auth::AuthUser;
use crate::db::tasks::Task;
use crate::error::ApiError;
use crate::state::AppState;

fn task_json(task: &Task) -> serde_json::Value {
    serde_json::json!({
        "id": task.id,
        "task_type": task.task_type,
        "status": task.status,
        "progress": task.progress,
        "payload": task.payload,
        "result": task.result,
        "error": task.error,
        "target_type": task.target_type,
        "target_id": task.target_id,
        "node_id": task.node_id,
        "retry_count": task.retry_count,
        "max_retries": task.max_retries,
        "created_by": task.created_by,
        "created_at": task.created_at.to_rfc3339(),
        "updated_at": task.updated_at.to_rfc3339(),
        "completed_at": task.completed_at.map(|t| t.to_rfc3339()),
    })
}

pub async fn list(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Query(query): Query<PageQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    user.require(Permission::TaskRead)?;
    let (page, page_size) = query.normalized();
    let (tasks, total) = state
        .tasks
        .list(page, page_size, query.status.as_deref())
        .await?;
    Ok(Json(serde_json::json!({
        "tasks": tasks.iter().map(task_json).collect::<Vec<_>>(),
        "total": total,
        "page": page,
        "page_size": page_size,
    })))
}

pub async fn get(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    user.require(Permission::TaskRead)?;
    let task = state.tasks.get(&id).await?;
    Ok(Json(task_json(&task)))
}
