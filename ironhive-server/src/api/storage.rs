//! Storage pool and volume endpoints

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
use crate::db::pools::StoragePool;
use crate::db::volumes::Volume;
use crate::error::ApiError;
use crate::state::AppState;
use crate::storage::{
    CreatePoolRequest, CreateVolumeRequest, StorageManager, UpdatePoolRequest,
};

fn pool_json(pool: &StoragePool) -> serde_json::Value {
    serde_json::json!({
        "id": pool.id,
        "name": pool.name,
        "type": pool.pool_type,
        "status": pool.status,
        "config": pool.config,
        "capacity_gb": pool.capacity_gb,
        "allocated_gb": pool.allocated_gb,
        "available_gb": pool.available_gb(),
        "node_id": pool.node_id,
        "created_at": pool.created_at.to_rfc3339(),
        "updated_at": pool.updated_at.to_rfc3339(),
    })
}

fn volume_json(volume: &Volume) -> serde_json::Value {
    serde_json::json!({
        "id": volume.id,
        "name": volume.name,
        "type": volume.volume_type,
        "size_gb": volume.size_gb,
        "pool_id": volume.pool_id,
        "path": volume.path,
        "status": volume.status,
        "vm_id": volume.vm_id,
        "metadata": volume.metadata,
        "created_at": volume.created_at.to_rfc3339(),
        "updated_at": volume.updated_at.to_rfc3339(),
    })
}

// -- pools ------------------------------------------------------------------

pub async fn list_pools(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Query(query): Query<PageQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    user.require(Permission::StorageRead)?;
    let (page, page_size) = query.normalized();
    let (pools, total) = StorageManager::new((*state).clone())
        .list_pools(page, page_size)
        .await?;
    Ok(Json(serde_json::json!({
        "pools": pools.iter().map(pool_json).collect::<Vec<_>>(),
        "total": total,
        "page": page,
        "page_size": page_size,
    })))
}

pub async fn create_pool(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Json(request): Json<CreatePoolRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    user.require(Permission::StorageWrite)?;
    let pool = StorageManager::new((*state).clone())
        .create_pool(request, &user.username)
        .await?;
    Ok((StatusCode::CREATED, Json(pool_json(&pool))))
}

pub async fn get_pool(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    user.require(Permission::StorageRead)?;
    let pool = StorageManager::new((*state).clone()).get_pool(&id).await?;
    Ok(Json(pool_json(&pool)))
}

pub async fn update_pool(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
    Json(request): Json<UpdatePoolRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    user.require(Permission::StorageWrite)?;
    let pool = StorageManager::new((*state).clone())
        .update_pool(&id, request, &user.username)
        .await?;
    Ok(Json(pool_json(&pool)))
}

pub async fn delete_pool(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    user.require(Permission::StorageWrite)?;
    StorageManager::new((*state).clone())
        .delete_pool(&id, &user.username)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

// -- volumes ----------------------------------------------------------------

pub async fn list_volumes(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Query(query): Query<PageQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    user.require(Permission::StorageRead)?;
    let (page, page_size) = query.normalized();
    let (volumes, total) = StorageManager::new((*state).clone())
        .list_volumes(page, page_size, query.pool_id.as_deref(), query.status.as_deref())
        .await?;
    Ok(Json(serde_json::json!({
        "volumes": volumes.iter().map(volume_json).collect::<Vec<_>>(),
        "total": total,
        "page": page,
        "page_size": page_size,
    })))
}

pub async fn create_volume(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Json(request): Json<CreateVolumeRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    user.require(Permission::StorageWrite)?;
    let (volume, task_id) = StorageManager::new((*state).clone())
        .create_volume(request, &user.username)
        .await?;
    let mut body = volume_json(&volume);
    body["task_id"] = serde_json::json!(task_id);
    Ok((StatusCode::ACCEPTED, Json(body)))
}

pub async fn get_volume(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    user.require(Permission::StorageRead)?;
    let volume = StorageManager::new((*state).clone()).get_volume(&id).await?;
    Ok(Json(volume_json(&volume)))
}

pub async fn delete_volume(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    user.require(Permission::StorageWrite)?;
    let task_id = StorageManager::new((*state).clone())
        .delete_volume(&id, &user.username)
        .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "task_id": task_id })),
    ))
}

#[derive(Debug, Deserialize)]
pub struct ResizeRequest {
    pub new_size_gb: u64,
}

pub async fn resize_volume(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
    Json(request): Json<ResizeRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    user.require(Permission::StorageWrite)?;
    let task_id = StorageManager::new((*state).clone())
        .resize_volume(&id, request.new_size_gb, &user.username)
        .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "task_id": task_id })),
    ))
}

#[derive(Debug, Deserialize)]
pub struct CloneRequest {
    pub name: String,
}

pub async fn clone_volume(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
    Json(request): Json<CloneRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    user.require(Permission::StorageWrite)?;
    let (clone, task_id) = StorageManager::new((*state).clone())
        .clone_volume(&id, &request.name, &user.username)
        .await?;
    let mut body = volume_json(&clone);
    body["task_id"] = serde_json::json!(task_id);
    Ok((StatusCode::ACCEPTED, Json(body)))
}
