//! Virtual machine lifecycle
//!
//! State machine: stopped, starting, running, stopping, paused,
//! restarting, migrating, error. Every state-transitioning operation
//! serializes on the VM's advisory lock, commits its intent state together
//! with a task row, then dispatches to the agent; the reply drives the
//! terminal transition. Create and delete are pure metadata operations
//! and never call the agent.

use chrono::Utc;
use ironhive_common::rpc::conn::{DEFAULT_CALL_TIMEOUT, LONG_CALL_TIMEOUT};
use ironhive_common::rpc::types::{
    AttachDiskRequest, DefineAndStartRequest, DefineAndStartResponse, DetachDiskRequest,
    DiskAttachment, MigrateVmRequest, NicSpec, RestartVmRequest, StopVmRequest, VmSpec,
};
use ironhive_common::rpc::{methods, RpcError};
use ironhive_common::{Error, Result};
use rand::Rng;
use serde::Deserialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::db::networks;
use crate::db::nodes::{self, NodeStatus};
use crate::db::vms::{self, Vm, VmDisk, VmNic, VmStatus};
use crate::db::volumes::{self, VolumeStatus};
use crate::db::{db_err, ips};
use crate::state::AppState;

pub struct VmManager {
    state: AppState,
}

#[derive(Debug, Deserialize)]
pub struct CreateVmRequest {
    pub name: String,
    pub node_id: String,
    pub vcpu: u32,
    pub memory_mb: u64,
    pub os_type: Option<String>,
    #[serde(default)]
    pub disks: Vec<DiskRequest>,
    #[serde(default)]
    pub networks: Vec<NicRequest>,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct DiskRequest {
    pub volume_id: String,
    pub device: Option<String>,
    #[serde(default)]
    pub bootable: bool,
}

#[derive(Debug, Deserialize)]
pub struct NicRequest {
    pub network_id: String,
    pub mac_address: Option<String>,
    pub model: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateVmRequest {
    pub name: Option<String>,
    pub vcpu: Option<u32>,
    pub memory_mb: Option<u64>,
    pub os_type: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct VolumeRef {
    pub volume_id: String,
    pub device: Option<String>,
}

impl VmManager {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    pub async fn get(&self, id: &str) -> Result<Vm> {
        vms::get(self.state.db.pool(), id).await
    }

    pub async fn list(
        &self,
        page: usize,
        page_size: usize,
        node_id: Option<&str>,
        status: Option<&str>,
    ) -> Result<(Vec<Vm>, usize)> {
        vms::list(self.state.db.pool(), page, page_size, node_id, status).await
    }

    /// Create a VM: pure metadata. Network IPs are claimed and attached
    /// volumes marked in_use inside the same transaction as the row
    /// insert; no agent RPC is issued.
    pub async fn create(&self, req: CreateVmRequest, actor: &str) -> Result<Vm> {
        if req.name.is_empty() {
            return Err(Error::Validation("vm name must not be empty".into()));
        }
        if req.vcpu == 0 || req.memory_mb == 0 {
            return Err(Error::Validation("vcpu and memory must be non-zero".into()));
        }
        nodes::get(self.state.db.pool(), &req.node_id).await?;

        // Validate volumes before touching anything.
        for disk in &req.disks {
            let volume = volumes::get(self.state.db.pool(), &disk.volume_id).await?;
            if volume.status != VolumeStatus::Available {
                return Err(Error::Precondition(format!(
                    "volume '{}' is {}",
                    volume.name,
                    volume.status.as_str()
                )));
            }
            if volume.vm_id.is_some() {
                return Err(Error::Precondition(format!(
                    "volume '{}' is attached to another virtual machine",
                    volume.name
                )));
            }
        }

        // Resolve networks and derive bridge names.
        let mut nic_plans = Vec::with_capacity(req.networks.len());
        for nic in &req.networks {
            let network = networks::get(self.state.db.pool(), &nic.network_id).await?;
            nic_plans.push((
                network.id.clone(),
                network.bridge_name(),
                nic.mac_address.clone().unwrap_or_else(generate_mac),
                nic.model.clone().unwrap_or_else(|| "virtio".to_string()),
            ));
        }

        // Per-network allocation locks, in sorted order so two concurrent
        // creates can never deadlock on each other.
        let mut lock_ids: Vec<String> = nic_plans.iter().map(|(id, ..)| id.clone()).collect();
        lock_ids.sort();
        lock_ids.dedup();
        let mut guards = Vec::with_capacity(lock_ids.len());
        for id in &lock_ids {
            guards.push(self.state.network_locks.lock(id).await);
        }

        let vm_id = Uuid::new_v4().to_string();
        let now = Utc::now();

        let mut tx = self
            .state
            .db
            .pool()
            .begin()
            .await
            .map_err(|e| db_err("failed to begin transaction", e))?;

        let mut nics = Vec::with_capacity(nic_plans.len());
        for (network_id, bridge, mac, model) in &nic_plans {
            let allocation = ips::claim_next_tx(&mut tx, network_id).await?;
            ips::associate_tx(&mut tx, &allocation.id, &vm_id, Some(mac)).await?;
            nics.push(VmNic {
                network_id: network_id.clone(),
                mac_address: mac.clone(),
                ip_address: Some(allocation.ip_address),
                model: model.clone(),
                bridge: bridge.clone(),
            });
        }

        let mut disks = Vec::with_capacity(req.disks.len());
        for (idx, disk) in req.disks.iter().enumerate() {
            volumes::set_attachment_tx(&mut tx, &disk.volume_id, Some(&vm_id)).await?;
            disks.push(VmDisk {
                volume_id: disk.volume_id.clone(),
                device: disk
                    .device
                    .clone()
                    .unwrap_or_else(|| device_name(idx)),
                bootable: disk.bootable || idx == 0,
            });
        }

        let vm = Vm {
            id: vm_id.clone(),
            uuid: None,
            name: req.name,
            node_id: Some(req.node_id),
            status: VmStatus::Stopped,
            vcpu: req.vcpu,
            memory_mb: req.memory_mb,
            os_type: req.os_type.unwrap_or_else(|| "linux".to_string()),
            disks,
            network_interfaces: nics,
            metadata: req.metadata,
            started_at: None,
            stopped_at: None,
            created_at: now,
            updated_at: now,
        };
        vms::insert_tx(&mut tx, &vm).await?;
        tx.commit()
            .await
            .map_err(|e| db_err("failed to commit vm creation", e))?;

        self.state
            .audit
            .record(actor, "vm.create", "vm", &vm.id, None)
            .await;
        info!(vm = %vm.id, name = %vm.name, "virtual machine created");
        Ok(vm)
    }

    pub async fn update(&self, id: &str, req: UpdateVmRequest, actor: &str) -> Result<Vm> {
        let _guard = self.state.vm_locks.lock(id).await;
        let vm = vms::get(self.state.db.pool(), id).await?;
        if vm.status.is_transitional() {
            return Err(Error::Precondition(format!(
                "an operation is in progress ({})",
                vm.status.as_str()
            )));
        }

        vms::update_shape(
            self.state.db.pool(),
            id,
            req.name.as_deref().unwrap_or(&vm.name),
            req.vcpu.unwrap_or(vm.vcpu),
            req.memory_mb.unwrap_or(vm.memory_mb),
            req.os_type.as_deref().unwrap_or(&vm.os_type),
            req.metadata.as_ref(),
        )
        .await?;

        self.state.audit.record(actor, "vm.update", "vm", id, None).await;
        vms::get(self.state.db.pool(), id).await
    }

    /// Delete a non-running VM: release its addresses, detach its
    /// volumes, and drop the row. A running VM is rejected.
    pub async fn delete(&self, id: &str, actor: &str) -> Result<()> {
        let _guard = self.state.vm_locks.lock(id).await;
        let vm = vms::get(self.state.db.pool(), id).await?;

        if vm.status == VmStatus::Running {
            return Err(Error::Precondition(
                "virtual machine is running; stop it first".into(),
            ));
        }
        if vm.status.is_transitional() {
            return Err(Error::Precondition(format!(
                "an operation is in progress ({})",
                vm.status.as_str()
            )));
        }

        let mut network_ids: Vec<String> = vm
            .network_interfaces
            .iter()
            .map(|n| n.network_id.clone())
            .collect();
        network_ids.sort();
        network_ids.dedup();
        let mut guards = Vec::with_capacity(network_ids.len());
        for nid in &network_ids {
            guards.push(self.state.network_locks.lock(nid).await);
        }

        let mut tx = self
            .state
            .db
            .pool()
            .begin()
            .await
            .map_err(|e| db_err("failed to begin transaction", e))?;
        for nid in &network_ids {
            ips::release_for_vm_tx(&mut tx, nid, id).await?;
        }
        for disk in &vm.disks {
            volumes::set_attachment_tx(&mut tx, &disk.volume_id, None).await?;
        }
        vms::delete_tx(&mut tx, id).await?;
        tx.commit()
            .await
            .map_err(|e| db_err("failed to commit vm delete", e))?;

        drop(guards);
        self.state.vm_locks.forget(id).await;
        self.state.audit.record(actor, "vm.delete", "vm", id, None).await;
        info!(vm = id, "virtual machine deleted");
        Ok(())
    }

    /// Resolve the agent-facing spec from current rows
    async fn build_spec(&self, vm: &Vm) -> Result<VmSpec> {
        let mut disks = Vec::with_capacity(vm.disks.len());
        for disk in &vm.disks {
            let volume = volumes::get(self.state.db.pool(), &disk.volume_id).await?;
            let path = volume.path.clone().ok_or_else(|| {
                Error::Precondition(format!(
                    "volume '{}' has no backing path yet",
                    volume.name
                ))
            })?;
            disks.push(DiskAttachment {
                volume_id: disk.volume_id.clone(),
                path,
                device: disk.device.clone(),
                format: volume.format().to_string(),
                bootable: disk.bootable,
            });
        }
        let nics = vm
            .network_interfaces
            .iter()
            .map(|nic| NicSpec {
                network_id: nic.network_id.clone(),
                mac_address: nic.mac_address.clone(),
                ip_address: nic.ip_address.clone(),
                model: nic.model.clone(),
                bridge: nic.bridge.clone(),
            })
            .collect();

        Ok(VmSpec {
            vm_id: vm.id.clone(),
            name: vm.name.clone(),
            vcpu: vm.vcpu,
            memory_mb: vm.memory_mb,
            os_type: vm.os_type.clone(),
            disks,
            nics,
        })
    }

    fn node_of(vm: &Vm) -> Result<String> {
        vm.node_id
            .clone()
            .ok_or_else(|| Error::Precondition("virtual machine has no node assigned".into()))
    }

    async fn require_node_online(&self, node_id: &str) -> Result<()> {
        let node = nodes::get(self.state.db.pool(), node_id).await?;
        if node.status != NodeStatus::Online {
            return Err(Error::NodeOffline(node_id.to_string()));
        }
        if !self.state.registry.is_online(node_id).await {
            return Err(Error::NodeOffline(node_id.to_string()));
        }
        Ok(())
    }

    /// Start (define-and-boot) a VM. Allowed from stopped or error.
    pub async fn start(&self, id: &str, actor: &str) -> Result<String> {
        let _guard = self.state.vm_locks.lock(id).await;
        let vm = vms::get(self.state.db.pool(), id).await?;

        if !matches!(vm.status, VmStatus::Stopped | VmStatus::Error) {
            return Err(Error::Precondition(format!(
                "cannot start a {} virtual machine",
                vm.status.as_str()
            )));
        }
        let node_id = Self::node_of(&vm)?;
        self.require_node_online(&node_id).await?;
        let spec = self.build_spec(&vm).await?;

        let task = self.state.tasks.build(
            "vm.start",
            "vm",
            id,
            Some(&node_id),
            serde_json::json!({ "vm_id": id }),
            actor,
        );
        let rpc_req = DefineAndStartRequest {
            task_id: task.id.clone(),
            spec,
        };

        let mut tx = self
            .state
            .db
            .pool()
            .begin()
            .await
            .map_err(|e| db_err("failed to begin transaction", e))?;
        vms::set_status_tx(&mut tx, id, VmStatus::Starting).await?;
        self.state.tasks.insert_tx(&mut tx, &task).await?;
        tx.commit()
            .await
            .map_err(|e| db_err("failed to commit start intent", e))?;
        self.state.ws.vm_status(id, "starting", None);
        self.state.audit.record(actor, "vm.start", "vm", id, None).await;

        let state = self.state.clone();
        let task_id = task.id.clone();
        let vm_id = id.to_string();
        tokio::spawn(async move {
            let _ = state.tasks.mark_running(&task_id).await;
            let payload = serde_json::to_value(&rpc_req).unwrap_or_default();
            let reply = state
                .registry
                .call(&node_id, methods::VM_DEFINE_AND_START, payload, DEFAULT_CALL_TIMEOUT)
                .await;
            settle_start(&state, &task_id, &vm_id, reply).await;
        });

        Ok(task.id)
    }

    /// Stop a VM; the agent also undefines the domain so the next start
    /// redefines it from controller state.
    pub async fn stop(&self, id: &str, force: bool, actor: &str) -> Result<String> {
        let _guard = self.state.vm_locks.lock(id).await;
        let vm = vms::get(self.state.db.pool(), id).await?;

        if !matches!(vm.status, VmStatus::Running | VmStatus::Paused | VmStatus::Error) {
            return Err(Error::Precondition(format!(
                "cannot stop a {} virtual machine",
                vm.status.as_str()
            )));
        }
        let node_id = Self::node_of(&vm)?;

        let task = self.state.tasks.build(
            "vm.stop",
            "vm",
            id,
            Some(&node_id),
            serde_json::json!({ "vm_id": id, "force": force }),
            actor,
        );
        let rpc_req = StopVmRequest {
            task_id: task.id.clone(),
            vm_id: id.to_string(),
            force,
        };

        let mut tx = self
            .state
            .db
            .pool()
            .begin()
            .await
            .map_err(|e| db_err("failed to begin transaction", e))?;
        vms::set_status_tx(&mut tx, id, VmStatus::Stopping).await?;
        self.state.tasks.insert_tx(&mut tx, &task).await?;
        tx.commit()
            .await
            .map_err(|e| db_err("failed to commit stop intent", e))?;
        self.state.ws.vm_status(id, "stopping", None);
        self.state.audit.record(actor, "vm.stop", "vm", id, None).await;

        let state = self.state.clone();
        let task_id = task.id.clone();
        let vm_id = id.to_string();
        tokio::spawn(async move {
            let _ = state.tasks.mark_running(&task_id).await;
            let payload = serde_json::to_value(&rpc_req).unwrap_or_default();
            let reply = state
                .registry
                .call(&node_id, methods::VM_STOP, payload, DEFAULT_CALL_TIMEOUT)
                .await;
            settle_simple(&state, &task_id, &vm_id, reply, VmStatus::Stopped, "stopped").await;
        });

        Ok(task.id)
    }

    /// Graceful restart with forced fallback, performed by the agent
    pub async fn restart(&self, id: &str, actor: &str) -> Result<String> {
        let _guard = self.state.vm_locks.lock(id).await;
        let vm = vms::get(self.state.db.pool(), id).await?;

        if vm.status != VmStatus::Running {
            return Err(Error::Precondition(format!(
                "cannot restart a {} virtual machine",
                vm.status.as_str()
            )));
        }
        let node_id = Self::node_of(&vm)?;

        let task = self.state.tasks.build(
            "vm.restart",
            "vm",
            id,
            Some(&node_id),
            serde_json::json!({ "vm_id": id }),
            actor,
        );
        let rpc_req = RestartVmRequest {
            task_id: task.id.clone(),
            vm_id: id.to_string(),
        };

        let mut tx = self
            .state
            .db
            .pool()
            .begin()
            .await
            .map_err(|e| db_err("failed to begin transaction", e))?;
        vms::set_status_tx(&mut tx, id, VmStatus::Restarting).await?;
        self.state.tasks.insert_tx(&mut tx, &task).await?;
        tx.commit()
            .await
            .map_err(|e| db_err("failed to commit restart intent", e))?;
        self.state.ws.vm_status(id, "restarting", None);
        self.state.audit.record(actor, "vm.restart", "vm", id, None).await;

        let state = self.state.clone();
        let task_id = task.id.clone();
        let vm_id = id.to_string();
        tokio::spawn(async move {
            let _ = state.tasks.mark_running(&task_id).await;
            let payload = serde_json::to_value(&rpc_req).unwrap_or_default();
            let reply = state
                .registry
                .call(&node_id, methods::VM_RESTART, payload, LONG_CALL_TIMEOUT)
                .await;
            settle_simple(&state, &task_id, &vm_id, reply, VmStatus::Running, "running").await;
        });

        Ok(task.id)
    }

    /// Migrate a VM to another node. A running VM migrates live through
    /// the source agent; a stopped VM is a metadata move (shared storage).
    pub async fn migrate(
        &self,
        id: &str,
        target_node_id: &str,
        actor: &str,
    ) -> Result<Option<String>> {
        let _guard = self.state.vm_locks.lock(id).await;
        let vm = vms::get(self.state.db.pool(), id).await?;
        let source_node_id = Self::node_of(&vm)?;

        if source_node_id == target_node_id {
            return Err(Error::Validation(
                "source and target node are the same".into(),
            ));
        }
        let target = nodes::get(self.state.db.pool(), target_node_id).await?;

        match vm.status {
            VmStatus::Stopped => {
                let mut conn = self
                    .state
                    .db
                    .pool()
                    .acquire()
                    .await
                    .map_err(|e| db_err("failed to acquire connection", e))?;
                vms::set_node_tx(&mut conn, id, target_node_id).await?;
                self.state
                    .audit
                    .record(actor, "vm.migrate", "vm", id, None)
                    .await;
                info!(vm = id, target = target_node_id, "stopped vm reassigned");
                Ok(None)
            }
            VmStatus::Running => {
                self.require_node_online(&source_node_id).await?;
                self.require_node_online(target_node_id).await?;

                let task = self.state.tasks.build(
                    "vm.migrate",
                    "vm",
                    id,
                    Some(&source_node_id),
                    serde_json::json!({ "vm_id": id, "target_node_id": target_node_id }),
                    actor,
                );
                let rpc_req = MigrateVmRequest {
                    task_id: task.id.clone(),
                    vm_id: id.to_string(),
                    target_node_id: target_node_id.to_string(),
                    target_address: target.ip_address,
                };

                let mut tx = self
                    .state
                    .db
                    .pool()
                    .begin()
                    .await
                    .map_err(|e| db_err("failed to begin transaction", e))?;
                vms::set_status_tx(&mut tx, id, VmStatus::Migrating).await?;
                self.state.tasks.insert_tx(&mut tx, &task).await?;
                tx.commit()
                    .await
                    .map_err(|e| db_err("failed to commit migrate intent", e))?;
                self.state.ws.vm_status(id, "migrating", None);
                self.state
                    .audit
                    .record(actor, "vm.migrate", "vm", id, None)
                    .await;

                let state = self.state.clone();
                let task_id = task.id.clone();
                let vm_id = id.to_string();
                let target_node = target_node_id.to_string();
                tokio::spawn(async move {
                    let _ = state.tasks.mark_running(&task_id).await;
                    let payload = serde_json::to_value(&rpc_req).unwrap_or_default();
                    let reply = state
                        .registry
                        .call(&source_node_id, methods::VM_MIGRATE, payload, LONG_CALL_TIMEOUT)
                        .await;
                    match reply {
                        Ok(_) => {
                            let moved = async {
                                let mut conn = state
                                    .db
                                    .pool()
                                    .acquire()
                                    .await
                                    .map_err(|e| db_err("failed to acquire connection", e))?;
                                vms::set_node_tx(&mut conn, &vm_id, &target_node).await?;
                                vms::set_status_tx(&mut conn, &vm_id, VmStatus::Running).await
                            }
                            .await;
                            match moved {
                                Ok(()) => {
                                    let _ = state.tasks.complete(&task_id, None).await;
                                    state.ws.vm_status(&vm_id, "running", None);
                                    info!(vm = %vm_id, target = %target_node, "migration completed");
                                }
                                Err(e) => {
                                    error!(vm = %vm_id, "failed to record migration: {}", e);
                                    let _ = state.tasks.fail(&task_id, &e.to_string()).await;
                                }
                            }
                        }
                        Err(e) if e.is_retryable() => {
                            warn!(vm = %vm_id, "migration in doubt: {}", e);
                            let _ = state.tasks.fail(&task_id, &e.to_string()).await;
                        }
                        Err(e) => {
                            // node_id stays on the source.
                            error!(vm = %vm_id, "migration failed: {}", e);
                            let _ = state.tasks.fail(&task_id, &e.to_string()).await;
                            let _ =
                                vms::set_status(state.db.pool(), &vm_id, VmStatus::Error).await;
                            state.ws.vm_status(&vm_id, "error", Some(e.to_string()));
                        }
                    }
                });

                Ok(Some(task.id))
            }
            other => Err(Error::Precondition(format!(
                "cannot migrate a {} virtual machine",
                other.as_str()
            ))),
        }
    }

    /// Attach an available volume. Running VMs get a hot-plug RPC; the
    /// attachment is committed up front and rolled back if the agent
    /// rejects it.
    pub async fn attach_volume(
        &self,
        id: &str,
        req: VolumeRef,
        actor: &str,
    ) -> Result<Option<String>> {
        let _guard = self.state.vm_locks.lock(id).await;
        let vm = vms::get(self.state.db.pool(), id).await?;
        if vm.status.is_transitional() {
            return Err(Error::Precondition(format!(
                "an operation is in progress ({})",
                vm.status.as_str()
            )));
        }

        let _vol_guard = self.state.volume_locks.lock(&req.volume_id).await;
        let volume = volumes::get(self.state.db.pool(), &req.volume_id).await?;
        if volume.status != VolumeStatus::Available || volume.vm_id.is_some() {
            return Err(Error::Precondition(format!(
                "volume '{}' is not available",
                volume.name
            )));
        }

        let device = req
            .device
            .unwrap_or_else(|| device_name(vm.disks.len()));
        if vm.disks.iter().any(|d| d.device == device) {
            return Err(Error::Validation(format!(
                "device '{}' is already in use",
                device
            )));
        }

        let mut disks = vm.disks.clone();
        disks.push(VmDisk {
            volume_id: req.volume_id.clone(),
            device: device.clone(),
            bootable: false,
        });

        let running = vm.status == VmStatus::Running;
        let task = if running {
            let node_id = Self::node_of(&vm)?;
            self.require_node_online(&node_id).await?;
            // The hot-plug needs a resolved path; check before anything
            // is committed.
            let path = volume.path.clone().ok_or_else(|| {
                Error::Precondition(format!("volume '{}' has no backing path", volume.name))
            })?;
            let task = self.state.tasks.build(
                "vm.attach_disk",
                "vm",
                id,
                Some(&node_id),
                serde_json::json!({ "vm_id": id, "volume_id": req.volume_id }),
                actor,
            );
            Some((task, node_id, path))
        } else {
            None
        };

        let mut tx = self
            .state
            .db
            .pool()
            .begin()
            .await
            .map_err(|e| db_err("failed to begin transaction", e))?;
        vms::set_disks_tx(&mut tx, id, &disks).await?;
        volumes::set_attachment_tx(&mut tx, &req.volume_id, Some(id)).await?;
        if let Some((task, ..)) = &task {
            self.state.tasks.insert_tx(&mut tx, task).await?;
        }
        tx.commit()
            .await
            .map_err(|e| db_err("failed to commit attach", e))?;

        self.state
            .audit
            .record(actor, "vm.attach_volume", "vm", id, None)
            .await;

        let Some((task, node_id, path)) = task else {
            return Ok(None);
        };

        let rpc_req = AttachDiskRequest {
            task_id: task.id.clone(),
            vm_id: id.to_string(),
            disk: DiskAttachment {
                volume_id: req.volume_id.clone(),
                path,
                device,
                format: volume.format().to_string(),
                bootable: false,
            },
        };

        let state = self.state.clone();
        let task_id = task.id.clone();
        let vm_id = id.to_string();
        let volume_id = req.volume_id.clone();
        let prior_disks = vm.disks.clone();
        tokio::spawn(async move {
            let _ = state.tasks.mark_running(&task_id).await;
            let payload = serde_json::to_value(&rpc_req).unwrap_or_default();
            let reply = state
                .registry
                .call(&node_id, methods::VM_ATTACH_DISK, payload, DEFAULT_CALL_TIMEOUT)
                .await;
            match reply {
                Ok(_) => {
                    let _ = state.tasks.complete(&task_id, None).await;
                }
                Err(e) if e.is_retryable() => {
                    warn!(vm = %vm_id, "hot attach in doubt: {}", e);
                    let _ = state.tasks.fail(&task_id, &e.to_string()).await;
                }
                Err(e) => {
                    error!(vm = %vm_id, "hot attach failed, rolling back: {}", e);
                    let _ = state.tasks.fail(&task_id, &e.to_string()).await;
                    let rollback = async {
                        let mut tx = state
                            .db
                            .pool()
                            .begin()
                            .await
                            .map_err(|e| db_err("failed to begin transaction", e))?;
                        vms::set_disks_tx(&mut tx, &vm_id, &prior_disks).await?;
                        volumes::set_attachment_tx(&mut tx, &volume_id, None).await?;
                        tx.commit()
                            .await
                            .map_err(|e| db_err("failed to commit rollback", e))
                    }
                    .await;
                    if let Err(e) = rollback {
                        error!(vm = %vm_id, "attach rollback failed: {}", e);
                    }
                }
            }
        });

        Ok(Some(task.id))
    }

    /// Detach a volume; mirror of attach
    pub async fn detach_volume(
        &self,
        id: &str,
        volume_id: &str,
        actor: &str,
    ) -> Result<Option<String>> {
        let _guard = self.state.vm_locks.lock(id).await;
        let vm = vms::get(self.state.db.pool(), id).await?;
        if vm.status.is_transitional() {
            return Err(Error::Precondition(format!(
                "an operation is in progress ({})",
                vm.status.as_str()
            )));
        }

        let Some(disk) = vm.disks.iter().find(|d| d.volume_id == volume_id).cloned() else {
            return Err(Error::Precondition(
                "volume is not attached to this virtual machine".into(),
            ));
        };

        let _vol_guard = self.state.volume_locks.lock(volume_id).await;
        let disks: Vec<VmDisk> = vm
            .disks
            .iter()
            .filter(|d| d.volume_id != volume_id)
            .cloned()
            .collect();

        let running = vm.status == VmStatus::Running;
        let task = if running {
            let node_id = Self::node_of(&vm)?;
            self.require_node_online(&node_id).await?;
            let task = self.state.tasks.build(
                "vm.detach_disk",
                "vm",
                id,
                Some(&node_id),
                serde_json::json!({ "vm_id": id, "volume_id": volume_id }),
                actor,
            );
            Some((task, node_id))
        } else {
            None
        };

        let mut tx = self
            .state
            .db
            .pool()
            .begin()
            .await
            .map_err(|e| db_err("failed to begin transaction", e))?;
        vms::set_disks_tx(&mut tx, id, &disks).await?;
        volumes::set_attachment_tx(&mut tx, volume_id, None).await?;
        if let Some((task, _)) = &task {
            self.state.tasks.insert_tx(&mut tx, task).await?;
        }
        tx.commit()
            .await
            .map_err(|e| db_err("failed to commit detach", e))?;

        self.state
            .audit
            .record(actor, "vm.detach_volume", "vm", id, None)
            .await;

        let Some((task, node_id)) = task else {
            return Ok(None);
        };

        let rpc_req = DetachDiskRequest {
            task_id: task.id.clone(),
            vm_id: id.to_string(),
            volume_id: volume_id.to_string(),
            device: disk.device.clone(),
        };

        let state = self.state.clone();
        let task_id = task.id.clone();
        let vm_id = id.to_string();
        let volume_id = volume_id.to_string();
        let prior_disks = vm.disks.clone();
        tokio::spawn(async move {
            let _ = state.tasks.mark_running(&task_id).await;
            let payload = serde_json::to_value(&rpc_req).unwrap_or_default();
            let reply = state
                .registry
                .call(&node_id, methods::VM_DETACH_DISK, payload, DEFAULT_CALL_TIMEOUT)
                .await;
            match reply {
                Ok(_) => {
                    let _ = state.tasks.complete(&task_id, None).await;
                }
                Err(e) if e.is_retryable() => {
                    warn!(vm = %vm_id, "hot detach in doubt: {}", e);
                    let _ = state.tasks.fail(&task_id, &e.to_string()).await;
                }
                Err(e) => {
                    error!(vm = %vm_id, "hot detach failed, rolling back: {}", e);
                    let _ = state.tasks.fail(&task_id, &e.to_string()).await;
                    let rollback = async {
                        let mut tx = state
                            .db
                            .pool()
                            .begin()
                            .await
                            .map_err(|e| db_err("failed to begin transaction", e))?;
                        vms::set_disks_tx(&mut tx, &vm_id, &prior_disks).await?;
                        volumes::set_attachment_tx(&mut tx, &volume_id, Some(&vm_id)).await?;
                        tx.commit()
                            .await
                            .map_err(|e| db_err("failed to commit rollback", e))
                    }
                    .await;
                    if let Err(e) = rollback {
                        error!(vm = %vm_id, "detach rollback failed: {}", e);
                    }
                }
            }
        });

        Ok(Some(task.id))
    }
}

/// Fold a vm.define_and_start reply into the row
async fn settle_start(
    state: &AppState,
    task_id: &str,
    vm_id: &str,
    reply: std::result::Result<ironhive_common::rpc::RpcMessage, RpcError>,
) {
    match reply {
        Ok(msg) => {
            if let Some(resp) = msg
                .payload
                .and_then(|p| serde_json::from_value::<DefineAndStartResponse>(p).ok())
            {
                let _ = vms::set_uuid(state.db.pool(), vm_id, &resp.uuid).await;
            }
            let _ = vms::set_status(state.db.pool(), vm_id, VmStatus::Running).await;
            let _ = state.tasks.complete(task_id, None).await;
            state.ws.vm_status(vm_id, "running", None);
            info!(vm = vm_id, "virtual machine running");
        }
        Err(e) if e.is_retryable() => {
            // In doubt: the row stays in `starting` for the sweep.
            warn!(vm = vm_id, "start in doubt: {}", e);
            let _ = state.tasks.fail(task_id, &e.to_string()).await;
        }
        Err(e) => {
            // Attached volumes stay in_use and addresses are retained.
            error!(vm = vm_id, "start failed: {}", e);
            let _ = state.tasks.fail(task_id, &e.to_string()).await;
            let _ = vms::set_status(state.db.pool(), vm_id, VmStatus::Error).await;
            state.ws.vm_status(vm_id, "error", Some(e.to_string()));
        }
    }
}

/// Fold a stop/restart reply into the row
async fn settle_simple(
    state: &AppState,
    task_id: &str,
    vm_id: &str,
    reply: std::result::Result<ironhive_common::rpc::RpcMessage, RpcError>,
    on_success: VmStatus,
    label: &str,
) {
    match reply {
        Ok(_) => {
            let _ = vms::set_status(state.db.pool(), vm_id, on_success).await;
            let _ = state.tasks.complete(task_id, None).await;
            state.ws.vm_status(vm_id, label, None);
            info!(vm = vm_id, status = label, "virtual machine settled");
        }
        Err(e) if e.is_retryable() => {
            warn!(vm = vm_id, "operation in doubt: {}", e);
            let _ = state.tasks.fail(task_id, &e.to_string()).await;
        }
        Err(e) => {
            error!(vm = vm_id, "operation failed: {}", e);
            let _ = state.tasks.fail(task_id, &e.to_string()).await;
            let _ = vms::set_status(state.db.pool(), vm_id, VmStatus::Error).await;
            state.ws.vm_status(vm_id, "error", Some(e.to_string()));
        }
    }
}

/// Guest device names: vda, vdb, ... vdz
fn device_name(index: usize) -> String {
    let letter = (b'a' + (index as u8).min(25)) as char;
    format!("vd{}", letter)
}

/// QEMU/KVM locally administered MAC prefix
fn generate_mac() -> String {
    let mut rng = rand::thread_rng();
    format!(
        "52:54:00:{:02x}:{:02x}:{:02x}",
        rng.gen::<u8>(),
        rng.gen::<u8>(),
        rng.gen::<u8>()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::ips::IpStatus;
    use crate::db::nodes::upsert_registration;
    use crate::db::pools::{self, tests::sample_pool};
    use crate::db::volumes::tests::sample_volume;
    use crate::network::{CreateNetworkRequest, NetworkManager};
    use crate::state::AppState;

    async fn setup() -> (VmManager, String) {
        let state = AppState::for_tests().await;
        upsert_registration(state.db.pool(), "n1", "host-a", "10.0.0.1")
            .await
            .unwrap();
        pools::insert(state.db.pool(), &sample_pool("p1", "nfs0"))
            .await
            .unwrap();

        let mut volume = sample_volume("v1", "p1", 10);
        volume.status = VolumeStatus::Available;
        volume.path = Some("/mnt/ironhive/nfs0/v1.qcow2".to_string());
        let mut conn = state.db.pool().acquire().await.unwrap();
        volumes::insert_tx(&mut conn, &volume).await.unwrap();
        drop(conn);

        let network = NetworkManager::new(state.clone())
            .create(
                CreateNetworkRequest {
                    name: "lab".into(),
                    network_type: "bridge".into(),
                    cidr: "10.0.1.0/29".into(),
                    gateway: None,
                    mtu: None,
                    vlan_id: Some(100),
                    node_id: None,
                },
                "tester",
            )
            .await
            .unwrap();

        (VmManager::new(state), network.id)
    }

    fn create_request(network_id: &str) -> CreateVmRequest {
        CreateVmRequest {
            name: "vm1".into(),
            node_id: "n1".into(),
            vcpu: 2,
            memory_mb: 2048,
            os_type: None,
            disks: vec![DiskRequest {
                volume_id: "v1".into(),
                device: Some("vda".into()),
                bootable: true,
            }],
            networks: vec![NicRequest {
                network_id: network_id.to_string(),
                mac_address: None,
                model: Some("virtio".into()),
            }],
            metadata: None,
        }
    }

    #[tokio::test]
    async fn test_create_claims_ip_and_volume() {
        let (manager, network_id) = setup().await;
        let vm = manager.create(create_request(&network_id), "tester").await.unwrap();

        assert_eq!(vm.status, VmStatus::Stopped);
        assert_eq!(vm.disks[0].device, "vda");
        let nic = &vm.network_interfaces[0];
        assert_eq!(nic.bridge, "br-vlan100");
        assert!(nic.mac_address.starts_with("52:54:00:"));
        assert!(nic.ip_address.is_some());

        // Exactly one allocation carries the VM id.
        let (allocations, _) = ips::list(
            manager.state.db.pool(),
            &network_id,
            1,
            100,
            Some("allocated"),
        )
        .await
        .unwrap();
        assert_eq!(allocations.len(), 1);
        assert_eq!(allocations[0].vm_id.as_deref(), Some(vm.id.as_str()));
        assert_eq!(allocations[0].status, IpStatus::Allocated);

        // The volume is held even though the VM is stopped.
        let volume = volumes::get(manager.state.db.pool(), "v1").await.unwrap();
        assert_eq!(volume.status, VolumeStatus::InUse);
        assert_eq!(volume.vm_id.as_deref(), Some(vm.id.as_str()));
    }

    #[tokio::test]
    async fn test_create_rejects_attached_volume() {
        let (manager, network_id) = setup().await;
        manager.create(create_request(&network_id), "tester").await.unwrap();

        // Second VM wants the same volume.
        let mut req = create_request(&network_id);
        req.name = "vm2".into();
        let err = manager.create(req, "tester").await.unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
    }

    #[tokio::test]
    async fn test_delete_running_rejected_then_delete_releases() {
        let (manager, network_id) = setup().await;
        let vm = manager.create(create_request(&network_id), "tester").await.unwrap();

        vms::set_status(manager.state.db.pool(), &vm.id, VmStatus::Running)
            .await
            .unwrap();
        let err = manager.delete(&vm.id, "tester").await.unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));

        vms::set_status(manager.state.db.pool(), &vm.id, VmStatus::Stopped)
            .await
            .unwrap();
        manager.delete(&vm.id, "tester").await.unwrap();

        // Addresses returned, volume released, row gone.
        let (held, _) = ips::list(
            manager.state.db.pool(),
            &network_id,
            1,
            100,
            Some("allocated"),
        )
        .await
        .unwrap();
        assert!(held.is_empty());
        let volume = volumes::get(manager.state.db.pool(), "v1").await.unwrap();
        assert_eq!(volume.status, VolumeStatus::Available);
        assert!(manager.get(&vm.id).await.is_err());
    }

    #[tokio::test]
    async fn test_start_requires_stopped_or_error() {
        let (manager, network_id) = setup().await;
        let vm = manager.create(create_request(&network_id), "tester").await.unwrap();

        vms::set_status(manager.state.db.pool(), &vm.id, VmStatus::Running)
            .await
            .unwrap();
        let err = manager.start(&vm.id, "tester").await.unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
    }

    #[tokio::test]
    async fn test_start_requires_online_node() {
        let (manager, network_id) = setup().await;
        let vm = manager.create(create_request(&network_id), "tester").await.unwrap();

        // Node row is online but no agent session exists.
        let err = manager.start(&vm.id, "tester").await.unwrap_err();
        assert!(matches!(err, Error::NodeOffline(_)));
        // The row did not move to an intent state.
        assert_eq!(manager.get(&vm.id).await.unwrap().status, VmStatus::Stopped);
    }

    #[tokio::test]
    async fn test_attach_detach_offline_vm() {
        let (manager, network_id) = setup().await;
        let mut req = create_request(&network_id);
        req.disks.clear();
        let vm = manager.create(req, "tester").await.unwrap();

        let task = manager
            .attach_volume(
                &vm.id,
                VolumeRef {
                    volume_id: "v1".into(),
                    device: None,
                },
                "tester",
            )
            .await
            .unwrap();
        // Stopped VM: metadata only, no task.
        assert!(task.is_none());
        let vm = manager.get(&vm.id).await.unwrap();
        assert_eq!(vm.disks.len(), 1);
        assert_eq!(vm.disks[0].device, "vda");
        assert_eq!(
            volumes::get(manager.state.db.pool(), "v1").await.unwrap().status,
            VolumeStatus::InUse
        );

        let task = manager.detach_volume(&vm.id, "v1", "tester").await.unwrap();
        assert!(task.is_none());
        assert_eq!(
            volumes::get(manager.state.db.pool(), "v1").await.unwrap().status,
            VolumeStatus::Available
        );
        assert!(manager.get(&vm.id).await.unwrap().disks.is_empty());
    }

    #[tokio::test]
    async fn test_migrate_stopped_is_metadata_move() {
        let (manager, network_id) = setup().await;
        upsert_registration(manager.state.db.pool(), "n2", "host-b", "10.0.0.2")
            .await
            .unwrap();
        let vm = manager.create(create_request(&network_id), "tester").await.unwrap();

        let task = manager.migrate(&vm.id, "n2", "tester").await.unwrap();
        assert!(task.is_none());
        assert_eq!(manager.get(&vm.id).await.unwrap().node_id.as_deref(), Some("n2"));

        let err = manager.migrate(&vm.id, "n2", "tester").await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_device_names() {
        assert_eq!(device_name(0), "vda");
        assert_eq!(device_name(1), "vdb");
        assert_eq!(device_name(25), "vdz");
    }

    #[test]
    fn test_generated_mac_shape() {
        let mac = generate_mac();
        assert!(mac.starts_with("52:54:00:"));
        assert_eq!(mac.len(), 17);
    }
}
