//! Virtual machine endpoints

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
use crate::db::vms::Vm;
use crate::db::{networks, volumes};
use crate::error::ApiError;
use crate::state::AppState;
use crate::vm::{CreateVmRequest, UpdateVmRequest, VmManager, VolumeRef};

fn vm_json(vm: &Vm) -> serde_json::Value {
    serde_json::json!({
        "id": vm.id,
        "uuid": vm.uuid,
        "name": vm.name,
        "node_id": vm.node_id,
        "status": vm.status,
        "vcpu": vm.vcpu,
        "memory_mb": vm.memory_mb,
        "os_type": vm.os_type,
        "disks": vm.disks,
        "network_interfaces": vm.network_interfaces,
        "metadata": vm.metadata,
        "started_at": vm.started_at.map(|t| t.to_rfc3339()),
        "stopped_at": vm.stopped_at.map(|t| t.to_rfc3339()),
        "created_at": vm.created_at.to_rfc3339(),
        "updated_at": vm.updated_at.to_rfc3339(),
    })
}

fn accepted(task_id: &str) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "task_id": task_id })),
    )
}

pub async fn list(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Query(query): Query<PageQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    user.require(Permission::VmRead)?;
    let (page, page_size) = query.normalized();
    let (vms, total) = VmManager::new((*state).clone())
        .list(page, page_size, query.node_id.as_deref(), query.status.as_deref())
        .await?;
    Ok(Json(serde_json::json!({
        "vms": vms.iter().map(vm_json).collect::<Vec<_>>(),
        "total": total,
        "page": page,
        "page_size": page_size,
    })))
}

pub async fn create(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Json(request): Json<CreateVmRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    user.require(Permission::VmWrite)?;
    let vm = VmManager::new((*state).clone())
        .create(request, &user.username)
        .await?;
    Ok((StatusCode::CREATED, Json(vm_json(&vm))))
}

pub async fn get(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    user.require(Permission::VmRead)?;
    let vm = VmManager::new((*state).clone()).get(&id).await?;
    Ok(Json(vm_json(&vm)))
}

pub async fn update(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
    Json(request): Json<UpdateVmRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    user.require(Permission::VmWrite)?;
    let vm = VmManager::new((*state).clone())
        .update(&id, request, &user.username)
        .await?;
    Ok(Json(vm_json(&vm)))
}

pub async fn remove(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    user.require(Permission::VmWrite)?;
    VmManager::new((*state).clone())
        .delete(&id, &user.username)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn start(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    user.require(Permission::VmWrite)?;
    let task_id = VmManager::new((*state).clone())
        .start(&id, &user.username)
        .await?;
    Ok(accepted(&task_id))
}

#[derive(Debug, Default, Deserialize)]
pub struct StopRequest {
    #[serde(default)]
    pub force: bool,
}

pub async fn stop(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
    body: Option<Json<StopRequest>>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    user.require(Permission::VmWrite)?;
    let force = body.map(|Json(b)| b.force).unwrap_or(false);
    let task_id = VmManager::new((*state).clone())
        .stop(&id, force, &user.username)
        .await?;
    Ok(accepted(&task_id))
}

pub async fn restart(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    user.require(Permission::VmWrite)?;
    let task_id = VmManager::new((*state).clone())
        .restart(&id, &user.username)
        .await?;
    Ok(accepted(&task_id))
}

#[derive(Debug, Deserialize)]
pub struct MigrateRequest {
    pub target_node_id: String,
}

pub async fn migrate(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
    Json(request): Json<MigrateRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    user.require(Permission::VmWrite)?;
    match VmManager::new((*state).clone())
        .migrate(&id, &request.target_node_id, &user.username)
        .await?
    {
        Some(task_id) => Ok(accepted(&task_id)),
        None => Ok((
            StatusCode::OK,
            Json(serde_json::json!({ "node_id": request.target_node_id })),
        )),
    }
}

pub async fn attach_volume(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
    Json(request): Json<VolumeRef>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    user.require(Permission::VmWrite)?;
    match VmManager::new((*state).clone())
        .attach_volume(&id, request, &user.username)
        .await?
    {
        Some(task_id) => Ok(accepted(&task_id)),
        None => Ok((StatusCode::OK, Json(serde_json::json!({ "ok": true })))),
    }
}

#[derive(Debug, Deserialize)]
pub struct DetachRequest {
    pub volume_id: String,
}

pub async fn detach_volume(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
    Json(request): Json<DetachRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    user.require(Permission::VmWrite)?;
    match VmManager::new((*state).clone())
        .detach_volume(&id, &request.volume_id, &user.username)
        .await?
    {
        Some(task_id) => Ok(accepted(&task_id)),
        None => Ok((StatusCode::OK, Json(serde_json::json!({ "ok": true })))),
    }
}

/// Expanded disk projection for the UI
pub async fn list_volumes(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    user.require(Permission::VmRead)?;
    let vm = VmManager::new((*state).clone()).get(&id).await?;

    let mut disks = Vec::with_capacity(vm.disks.len());
    for disk in &vm.disks {
        let volume = volumes::get(state.db.pool(), &disk.volume_id).await.ok();
        disks.push(serde_json::json!({
            "volume_id": disk.volume_id,
            "device": disk.device,
            "bootable": disk.bootable,
            "volume_name": volume.as_ref().map(|v| v.name.clone()),
            "size_gb": volume.as_ref().map(|v| v.size_gb),
            "volume_type": volume.as_ref().map(|v| v.volume_type.clone()),
            "path": volume.as_ref().and_then(|v| v.path.clone()),
        }));
    }
    Ok(Json(serde_json::json!({ "volumes": disks })))
}

/// Expanded NIC projection for the UI
pub async fn list_networks(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    user.require(Permission::VmRead)?;
    let vm = VmManager::new((*state).clone()).get(&id).await?;

    let mut nics = Vec::with_capacity(vm.network_interfaces.len());
    for nic in &vm.network_interfaces {
        let network = networks::get(state.db.pool(), &nic.network_id).await.ok();
        nics.push(serde_json::json!({
            "network_id": nic.network_id,
            "network_name": network.as_ref().map(|n| n.name.clone()),
            "mac_address": nic.mac_address,
            "ip_address": nic.ip_address,
            "model": nic.model,
            "bridge": nic.bridge,
            "cidr": network.as_ref().map(|n| n.cidr.clone()),
            "vlan_id": network.as_ref().and_then(|n| n.vlan_id),
        }));
    }
    Ok(Json(serde_json::json!({ "networks": nics })))
}
