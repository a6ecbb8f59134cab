//! Node endpoints

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Extension, Json,
};
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

use super::PageQuery;
use crate::auth::rbac::Permission;
use crate::auth::AuthUser;
use crate::db::nodes::{self, Node};
use crate::error::ApiError;
use crate::node::{NodeManager, UpdateNodeRequest};
use crate::state::AppState;

fn node_json(node: &Node) -> serde_json::Value {
    serde_json::json!({
        "id": node.id,
        "hostname": node.hostname,
        "ip_address": node.ip_address,
        "status": node.status,
        "hypervisor_type": node.hypervisor_type,
        "hypervisor_version": node.hypervisor_version,
        "cpu_cores": node.cpu_cores,
        "cpu_threads": node.cpu_threads,
        "memory_total_bytes": node.memory_total_bytes,
        "disk_total_bytes": node.disk_total_bytes,
        "metadata": node.metadata,
        "last_heartbeat": node.last_heartbeat.map(|t| t.to_rfc3339()),
        "created_at": node.created_at.to_rfc3339(),
        "updated_at": node.updated_at.to_rfc3339(),
    })
}

pub async fn list(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Query(query): Query<PageQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    user.require(Permission::NodeRead)?;
    let (page, page_size) = query.normalized();
    let (nodes, total) = NodeManager::new((*state).clone()).list(page, page_size).await?;
    Ok(Json(serde_json::json!({
        "nodes": nodes.iter().map(node_json).collect::<Vec<_>>(),
        "total": total,
        "page": page,
        "page_size": page_size,
    })))
}

#[derive(Debug, Deserialize)]
pub struct CreateNodeRequest {
    pub hostname: String,
    pub ip_address: String,
}

/// Pre-provision a node row before its agent first connects
pub async fn create(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Json(request): Json<CreateNodeRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    user.require(Permission::NodeWrite)?;
    if request.hostname.is_empty() || request.ip_address.is_empty() {
        return Err(ApiError::bad_request("hostname and ip_address are required"));
    }

    let id = Uuid::new_v4().to_string();
    let now = crate::db::to_db_time(Utc::now());
    sqlx::query(
        "INSERT INTO nodes (id, hostname, ip_address, status, created_at, updated_at)
         VALUES (?, ?, ?, 'offline', ?, ?)",
    )
    .bind(&id)
    .bind(&request.hostname)
    .bind(&request.ip_address)
    .bind(&now)
    .bind(&now)
    .execute(state.db.pool())
    .await
    .map_err(|e| ApiError::internal(format!("failed to insert node: {}", e)))?;

    state
        .audit
        .record(&user.username, "node.create", "node", &id, None)
        .await;
    let node = nodes::get(state.db.pool(), &id).await?;
    Ok((StatusCode::CREATED, Json(node_json(&node))))
}

pub async fn get(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    user.require(Permission::NodeRead)?;
    let node = NodeManager::new((*state).clone()).get(&id).await?;
    Ok(Json(node_json(&node)))
}

pub async fn update(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
    Json(request): Json<UpdateNodeRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    user.require(Permission::NodeWrite)?;
    let node = NodeManager::new((*state).clone())
        .update(&id, request, &user.username)
        .await?;
    Ok(Json(node_json(&node)))
}

pub async fn remove(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    user.require(Permission::NodeWrite)?;
    NodeManager::new((*state).clone())
        .delete(&id, &user.username)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn heartbeat(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    user.require(Permission::NodeRead)?;
    let node = NodeManager::new((*state).clone()).heartbeat(&id).await?;
    Ok(Json(node_json(&node)))
}

pub async fn stats(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<serde_json::Value>, ApiError> {
    user.require(Permission::NodeRead)?;
    let stats = NodeManager::new((*state).clone()).stats().await?;
    Ok(Json(serde_json::to_value(stats).map_err(|e| {
        ApiError::internal(format!("failed to serialize stats: {}", e))
    })?))
}
