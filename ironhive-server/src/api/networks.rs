//! Network and IP allocation endpoints

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
use crate::db::ips::IpAllocation;
use crate::db::networks::Network;
use crate::error::ApiError;
use crate::network::{CreateNetworkRequest, NetworkManager};
use crate::state::AppState;

fn network_json(network: &Network) -> serde_json::Value {
    serde_json::json!({
        "id": network.id,
        "name": network.name,
        "type": network.network_type,
        "cidr": network.cidr,
        "gateway": network.gateway,
        "mtu": network.mtu,
        "vlan_id": network.vlan_id,
        "node_id": network.node_id,
        "status": network.status,
        "bridge": network.bridge_name(),
        "created_at": network.created_at.to_rfc3339(),
        "updated_at": network.updated_at.to_rfc3339(),
    })
}

fn allocation_json(allocation: &IpAllocation) -> serde_json::Value {
    serde_json::json!({
        "id": allocation.id,
        "network_id": allocation.network_id,
        "ip_address": allocation.ip_address,
        "mac_address": allocation.mac_address,
        "vm_id": allocation.vm_id,
        "status": allocation.status,
        "allocated_at": allocation.allocated_at.map(|t| t.to_rfc3339()),
        "created_at": allocation.created_at.to_rfc3339(),
    })
}

pub async fn list(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Query(query): Query<PageQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    user.require(Permission::NetworkRead)?;
    let (page, page_size) = query.normalized();
    let (networks, total) = NetworkManager::new((*state).clone())
        .list(page, page_size)
        .await?;
    Ok(Json(serde_json::json!({
        "networks": networks.iter().map(network_json).collect::<Vec<_>>(),
        "total": total,
        "page": page,
        "page_size": page_size,
    })))
}

pub async fn create(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Json(request): Json<CreateNetworkRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    user.require(Permission::NetworkWrite)?;
    let network = NetworkManager::new((*state).clone())
        .create(request, &user.username)
        .await?;
    Ok((StatusCode::CREATED, Json(network_json(&network))))
}

pub async fn get(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    user.require(Permission::NetworkRead)?;
    let network = NetworkManager::new((*state).clone()).get(&id).await?;
    Ok(Json(network_json(&network)))
}

#[derive(Debug, Deserialize)]
pub struct UpdateNetworkRequest {
    pub name: String,
}

pub async fn update(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
    Json(request): Json<UpdateNetworkRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    user.require(Permission::NetworkWrite)?;
    let network = NetworkManager::new((*state).clone())
        .rename(&id, &request.name, &user.username)
        .await?;
    Ok(Json(network_json(&network)))
}

pub async fn remove(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    user.require(Permission::NetworkWrite)?;
    NetworkManager::new((*state).clone())
        .delete(&id, &user.username)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_ips(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
    Query(query): Query<PageQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    user.require(Permission::NetworkRead)?;
    let (page, page_size) = query.normalized();
    let (allocations, total) = NetworkManager::new((*state).clone())
        .list_ips(&id, page, page_size, query.status.as_deref())
        .await?;
    Ok(Json(serde_json::json!({
        "allocations": allocations.iter().map(allocation_json).collect::<Vec<_>>(),
        "total": total,
        "page": page,
        "page_size": page_size,
    })))
}

pub async fn allocate_ip(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    user.require(Permission::NetworkWrite)?;
    let allocation = NetworkManager::new((*state).clone()).allocate_ip(&id).await?;
    state
        .audit
        .record(&user.username, "network.allocate_ip", "network", &id, None)
        .await;
    Ok(Json(allocation_json(&allocation)))
}

#[derive(Debug, Deserialize)]
pub struct AddressRequest {
    pub ip_address: String,
}

pub async fn release_ip(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
    Json(request): Json<AddressRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    user.require(Permission::NetworkWrite)?;
    NetworkManager::new((*state).clone())
        .release_ip(&id, &request.ip_address)
        .await?;
    state
        .audit
        .record(&user.username, "network.release_ip", "network", &id, None)
        .await;
    Ok(Json(serde_json::json!({ "ok": true })))
}

pub async fn reserve_ip(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
    Json(request): Json<AddressRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    user.require(Permission::NetworkWrite)?;
    let allocation = NetworkManager::new((*state).clone())
        .reserve_ip(&id, &request.ip_address)
        .await?;
    state
        .audit
        .record(&user.username, "network.reserve_ip", "network", &id, None)
        .await;
    Ok(Json(allocation_json(&allocation)))
}
