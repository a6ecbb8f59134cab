//! Snapshot endpoints

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Extension, Json,
};
use serde::Deserialize;
use std::sync::Arc;

use super::PageQuery;
use crate::auth::rbac::Permission;
use crate::auth::AuthUser;
use crate::db::snapshots::Snapshot;
use crate::error::ApiError;
use crate::state::AppState;
use crate::storage::snapshot::{CreateSnapshotRequest, SnapshotManager};

fn snapshot_json(snapshot: &Snapshot) -> serde_json::Value {
    serde_json::json!({
        "id": snapshot.id,
        "name": snapshot.name,
        "volume_id": snapshot.volume_id,
        "status": snapshot.status,
        "size_gb": snapshot.size_gb,
        "snapshot_tag": snapshot.snapshot_tag,
        "description": snapshot.description,
        "metadata": snapshot.metadata,
        "created_at": snapshot.created_at.to_rfc3339(),
        "updated_at": snapshot.updated_at.to_rfc3339(),
    })
}

pub async fn list(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Query(query): Query<PageQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    user.require(Permission::StorageRead)?;
    let (page, page_size) = query.normalized();
    let (snapshots, total) = SnapshotManager::new((*state).clone())
        .list(page, page_size, query.volume_id.as_deref())
        .await?;
    Ok(Json(serde_json::json!({
        "snapshots": snapshots.iter().map(snapshot_json).collect::<Vec<_>>(),
        "total": total,
        "page": page,
        "page_size": page_size,
    })))
}

pub async fn create(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Json(request): Json<CreateSnapshotRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    user.require(Permission::StorageWrite)?;
    let (snapshot, task_id) = SnapshotManager::new((*state).clone())
        .create(request, &user.username)
        .await?;
    let mut body = snapshot_json(&snapshot);
    body["task_id"] = serde_json::json!(task_id);
    Ok((StatusCode::ACCEPTED, Json(body)))
}

#[derive(Debug, Deserialize)]
pub struct VolumeSnapshotRequest {
    pub name: String,
    pub description: Option<String>,
}

/// `POST /storage/volumes/{id}/snapshot` convenience route
pub async fn create_for_volume(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(volume_id): Path<String>,
    Json(request): Json<VolumeSnapshotRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    user.require(Permission::StorageWrite)?;
    let (snapshot, task_id) = SnapshotManager::new((*state).clone())
        .create(
            CreateSnapshotRequest {
                volume_id,
                name: request.name,
                description: request.description,
            },
            &user.username,
        )
        .await?;
    let mut body = snapshot_json(&snapshot);
    body["task_id"] = serde_json::json!(task_id);
    Ok((StatusCode::ACCEPTED, Json(body)))
}

pub async fn get(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    user.require(Permission::StorageRead)?;
    let snapshot = SnapshotManager::new((*state).clone()).get(&id).await?;
    Ok(Json(snapshot_json(&snapshot)))
}

#[derive(Debug, Deserialize)]
pub struct UpdateSnapshotRequest {
    pub name: String,
    pub description: Option<String>,
}

pub async fn update(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
    Json(request): Json<UpdateSnapshotRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    user.require(Permission::StorageWrite)?;
    let snapshot = SnapshotManager::new((*state).clone())
        .update(&id, &request.name, request.description.as_deref(), &user.username)
        .await?;
    Ok(Json(snapshot_json(&snapshot)))
}

pub async fn remove(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    user.require(Permission::StorageWrite)?;
    let task_id = SnapshotManager::new((*state).clone())
        .delete(&id, &user.username)
        .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "task_id": task_id })),
    ))
}

pub async fn restore(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    user.require(Permission::StorageWrite)?;
    let task_id = SnapshotManager::new((*state).clone())
        .restore(&id, &user.username)
        .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "task_id": task_id })),
    ))
}
