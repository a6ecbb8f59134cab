//! RPC method handlers
//!
//! Registers every `vm.*`, `volume.*`, `snapshot.*`, and `network.*`
//! method on the shared router. Side-effecting methods are idempotent by
//! task id: a retried request whose task already completed gets the
//! cached result without repeating the work.

use ironhive_common::rpc::types::{
    Ack, AttachDiskRequest, AttachTapRequest, CloneVolumeRequest, CreateSnapshotRequest,
    CreateVolumeRequest, DefineAndStartRequest, DeleteSnapshotRequest, DeleteVolumeRequest,
    DescribeVmRequest, DescribeVolumeRequest, DetachDiskRequest, DetachTapRequest,
    EnsureNetworkRequest, MigrateVmRequest, NetworkSpec, NicSpec, RestartVmRequest,
    RestoreSnapshotRequest, ResizeVolumeRequest, SnapshotMode, StopVmRequest,
};
use ironhive_common::rpc::{methods, RpcError, RpcErrorCode, RpcRouter};
use ironhive_common::Error;
use std::future::Future;
use std::sync::Arc;

use crate::hypervisor::HypervisorManager;
use crate::network::NetworkManager;
use crate::storage::{self, CancelFlag};
use crate::task_cache::TaskCache;

pub struct AgentHandlers {
    pub hypervisor: Arc<HypervisorManager>,
    pub network: Arc<NetworkManager>,
    pub cache: TaskCache,
}

/// Map a driver error into its wire code
fn to_rpc(err: Error) -> RpcError {
    let code = match &err {
        Error::VmNotFound(_) => RpcErrorCode::VmNotFound,
        Error::VolumeNotFound(_) => RpcErrorCode::VolumeNotFound,
        Error::NetworkNotFound(_) => RpcErrorCode::NetworkNotFound,
        Error::SnapshotNotFound(_) => RpcErrorCode::SnapshotNotFound,
        Error::PoolNotFound(_) => RpcErrorCode::PoolNotFound,
        Error::Validation(_) => RpcErrorCode::InvalidRequest,
        Error::Precondition(_) => RpcErrorCode::PreconditionFailed,
        Error::Hypervisor(_) => RpcErrorCode::HypervisorError,
        Error::Storage(_) => RpcErrorCode::StorageError,
        Error::Network(_) => RpcErrorCode::NetworkError,
        _ => RpcErrorCode::InternalError,
    };
    RpcError::new(code, err.to_string())
}

fn parse<T: serde::de::DeserializeOwned>(payload: serde_json::Value) -> Result<T, RpcError> {
    serde_json::from_value(payload)
        .map_err(|e| RpcError::invalid_request(format!("bad payload: {}", e)))
}

/// Run `work` once per task id, returning the cached result on a retry
async fn idempotent<F, Fut>(
    cache: &TaskCache,
    task_id: &str,
    work: F,
) -> Result<serde_json::Value, RpcError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<serde_json::Value, RpcError>>,
{
    if let Some(cached) = cache.get(task_id).await {
        tracing::debug!(task_id, "returning cached result");
        return Ok(cached);
    }
    let result = work().await?;
    cache.put(task_id, result.clone()).await;
    cache.clear_cancelled(task_id);
    Ok(result)
}

impl AgentHandlers {
    fn cancel_flag(&self, task_id: &str) -> CancelFlag {
        let cache = self.cache.clone();
        let task_id = task_id.to_string();
        Arc::new(move || cache.is_cancelled(&task_id))
    }

    /// The deterministic on-disk snapshot tag for a snapshot id. No
    /// timestamp: a retried create must produce the same tag.
    fn snapshot_tag(snapshot_id: &str) -> String {
        format!("ih-snap-{}", snapshot_id)
    }
}

/// Register every method the agent serves
pub fn build_router(handlers: Arc<AgentHandlers>) -> RpcRouter {
    let mut router = RpcRouter::new();

    // -- vm.* ---------------------------------------------------------------

    let h = handlers.clone();
    router.register(methods::VM_DEFINE_AND_START, move |payload| {
        let h = h.clone();
        async move {
            let req: DefineAndStartRequest = parse(payload)?;
            idempotent(&h.cache, &req.task_id, || async {
                // Materialize each NIC's bridge before the domain boots.
                for nic in &req.spec.nics {
                    let network = network_spec_for(nic);
                    h.network.ensure_network(&network).await.map_err(to_rpc)?;
                }
                let uuid = h.hypervisor.define_and_start(&req.spec).await.map_err(to_rpc)?;
                Ok(serde_json::json!({ "uuid": uuid }))
            })
            .await
        }
    });

    let h = handlers.clone();
    router.register(methods::VM_STOP, move |payload| {
        let h = h.clone();
        async move {
            let req: StopVmRequest = parse(payload)?;
            idempotent(&h.cache, &req.task_id, || async {
                h.hypervisor.stop(&req.vm_id, req.force).await.map_err(to_rpc)?;
                Ok(Ack::ok())
            })
            .await
        }
    });

    let h = handlers.clone();
    router.register(methods::VM_RESTART, move |payload| {
        let h = h.clone();
        async move {
            let req: RestartVmRequest = parse(payload)?;
            idempotent(&h.cache, &req.task_id, || async {
                h.hypervisor.restart(&req.vm_id).await.map_err(to_rpc)?;
                Ok(Ack::ok())
            })
            .await
        }
    });

    let h = handlers.clone();
    router.register(methods::VM_ATTACH_DISK, move |payload| {
        let h = h.clone();
        async move {
            let req: AttachDiskRequest = parse(payload)?;
            idempotent(&h.cache, &req.task_id, || async {
                h.hypervisor
                    .attach_disk(&req.vm_id, &req.disk.path, &req.disk.device, &req.disk.format)
                    .await
                    .map_err(to_rpc)?;
                Ok(Ack::ok())
            })
            .await
        }
    });

    let h = handlers.clone();
    router.register(methods::VM_DETACH_DISK, move |payload| {
        let h = h.clone();
        async move {
            let req: DetachDiskRequest = parse(payload)?;
            idempotent(&h.cache, &req.task_id, || async {
                h.hypervisor
                    .detach_disk(&req.vm_id, &req.device)
                    .await
                    .map_err(to_rpc)?;
                Ok(Ack::ok())
            })
            .await
        }
    });

    let h = handlers.clone();
    router.register(methods::VM_DESCRIBE, move |payload| {
        let h = h.clone();
        async move {
            let req: DescribeVmRequest = parse(payload)?;
            let desc = h.hypervisor.describe(&req.vm_id).await.map_err(to_rpc)?;
            serde_json::to_value(&desc)
                .map_err(|e| RpcError::new(RpcErrorCode::InternalError, e.to_string()))
        }
    });

    let h = handlers.clone();
    router.register(methods::VM_MIGRATE, move |payload| {
        let h = h.clone();
        async move {
            let req: MigrateVmRequest = parse(payload)?;
            idempotent(&h.cache, &req.task_id, || async {
                h.hypervisor
                    .migrate(&req.vm_id, &req.target_address)
                    .await
                    .map_err(to_rpc)?;
                Ok(Ack::ok())
            })
            .await
        }
    });

    // -- volume.* -----------------------------------------------------------

    let h = handlers.clone();
    router.register(methods::VOLUME_CREATE, move |payload| {
        let h = h.clone();
        async move {
            let req: CreateVolumeRequest = parse(payload)?;
            idempotent(&h.cache, &req.task_id.clone(), || async {
                let driver = storage::driver_for(&req.pool);
                let info = driver
                    .create_volume(
                        &req.volume_id,
                        req.size_gb,
                        &req.format,
                        req.source.as_deref(),
                        h.cancel_flag(&req.task_id),
                    )
                    .await
                    .map_err(to_rpc)?;
                Ok(serde_json::json!({ "path": info.path, "size_gb": info.size_gb }))
            })
            .await
        }
    });

    let h = handlers.clone();
    router.register(methods::VOLUME_DELETE, move |payload| {
        let h = h.clone();
        async move {
            let req: DeleteVolumeRequest = parse(payload)?;
            idempotent(&h.cache, &req.task_id, || async {
                let driver = storage::driver_for(&req.pool);
                // Format does not matter for lookups on block backends;
                // file backends try both layouts.
                for format in ["qcow2", "raw"] {
                    driver
                        .delete_volume(&req.volume_id, format)
                        .await
                        .map_err(to_rpc)?;
                }
                Ok(Ack::ok())
            })
            .await
        }
    });

    let h = handlers.clone();
    router.register(methods::VOLUME_RESIZE, move |payload| {
        let h = h.clone();
        async move {
            let req: ResizeVolumeRequest = parse(payload)?;
            idempotent(&h.cache, &req.task_id, || async {
                let driver = storage::driver_for(&req.pool);
                let format = existing_format(driver.as_ref(), &req.volume_id).await?;
                driver
                    .resize_volume(&req.volume_id, &format, req.new_size_gb)
                    .await
                    .map_err(to_rpc)?;
                Ok(Ack::ok())
            })
            .await
        }
    });

    let h = handlers.clone();
    router.register(methods::VOLUME_CLONE, move |payload| {
        let h = h.clone();
        async move {
            let req: CloneVolumeRequest = parse(payload)?;
            idempotent(&h.cache, &req.task_id, || async {
                let driver = storage::driver_for(&req.pool);
                let format = existing_format(driver.as_ref(), &req.source_volume_id).await?;
                let info = driver
                    .clone_volume(&req.source_volume_id, &req.clone_volume_id, &format)
                    .await
                    .map_err(to_rpc)?;
                Ok(serde_json::json!({ "path": info.path, "size_gb": info.size_gb }))
            })
            .await
        }
    });

    router.register(methods::VOLUME_DESCRIBE, move |payload| {
        async move {
            let req: DescribeVolumeRequest = parse(payload)?;
            let driver = storage::driver_for(&req.pool);
            for format in ["qcow2", "raw"] {
                if let Some(info) = driver
                    .describe_volume(&req.volume_id, format)
                    .await
                    .map_err(to_rpc)?
                {
                    return Ok(serde_json::json!({
                        "volume_id": req.volume_id,
                        "exists": true,
                        "path": info.path,
                        "size_gb": info.size_gb,
                        "format": info.format,
                    }));
                }
            }
            Ok(serde_json::json!({ "volume_id": req.volume_id, "exists": false }))
        }
    });

    // -- snapshot.* ---------------------------------------------------------

    let h = handlers.clone();
    router.register(methods::SNAPSHOT_CREATE, move |payload| {
        let h = h.clone();
        async move {
            let req: CreateSnapshotRequest = parse(payload)?;
            idempotent(&h.cache, &req.task_id, || async {
                let tag = AgentHandlers::snapshot_tag(&req.snapshot_id);
                let driver = storage::driver_for(&req.pool);
                let size_gb = match req.mode {
                    SnapshotMode::Live => {
                        let vm_id = req.vm_id.as_deref().ok_or_else(|| {
                            RpcError::invalid_request("live snapshot without vm_id")
                        })?;
                        h.hypervisor
                            .snapshot_create(vm_id, &tag)
                            .await
                            .map_err(to_rpc)?;
                        None
                    }
                    SnapshotMode::Offline => {
                        let format = existing_format(driver.as_ref(), &req.volume_id).await?;
                        driver
                            .snapshot_create(&req.volume_id, &format, &tag)
                            .await
                            .map_err(to_rpc)?;
                        driver
                            .describe_volume(&req.volume_id, &format)
                            .await
                            .map_err(to_rpc)?
                            .map(|info| info.size_gb)
                    }
                };
                Ok(serde_json::json!({ "tag": tag, "size_gb": size_gb }))
            })
            .await
        }
    });

    let h = handlers.clone();
    router.register(methods::SNAPSHOT_DELETE, move |payload| {
        let h = h.clone();
        async move {
            let req: DeleteSnapshotRequest = parse(payload)?;
            idempotent(&h.cache, &req.task_id, || async {
                match req.mode {
                    SnapshotMode::Live => {
                        let vm_id = req.vm_id.as_deref().ok_or_else(|| {
                            RpcError::invalid_request("live snapshot delete without vm_id")
                        })?;
                        h.hypervisor
                            .snapshot_delete(vm_id, &req.tag)
                            .await
                            .map_err(to_rpc)?;
                    }
                    SnapshotMode::Offline => {
                        let driver = storage::driver_for(&req.pool);
                        let format = existing_format(driver.as_ref(), &req.volume_id).await?;
                        driver
                            .snapshot_delete(&req.volume_id, &format, &req.tag)
                            .await
                            .map_err(to_rpc)?;
                    }
                }
                Ok(Ack::ok())
            })
            .await
        }
    });

    let h = handlers.clone();
    router.register(methods::SNAPSHOT_RESTORE, move |payload| {
        let h = h.clone();
        async move {
            let req: RestoreSnapshotRequest = parse(payload)?;
            idempotent(&h.cache, &req.task_id, || async {
                let driver = storage::driver_for(&req.pool);
                let format = existing_format(driver.as_ref(), &req.volume_id).await?;
                driver
                    .snapshot_restore(&req.volume_id, &format, &req.tag)
                    .await
                    .map_err(to_rpc)?;
                Ok(Ack::ok())
            })
            .await
        }
    });

    // -- network.* ----------------------------------------------------------

    let h = handlers.clone();
    router.register(methods::NETWORK_ENSURE, move |payload| {
        let h = h.clone();
        async move {
            let req: EnsureNetworkRequest = parse(payload)?;
            h.network.ensure_network(&req.network).await.map_err(to_rpc)?;
            Ok(Ack::ok())
        }
    });

    let h = handlers.clone();
    router.register(methods::NETWORK_ATTACH_TAP, move |payload| {
        let h = h.clone();
        async move {
            let req: AttachTapRequest = parse(payload)?;
            h.network.attach_tap(&req.network).await.map_err(to_rpc)?;
            Ok(Ack::ok())
        }
    });

    let h = handlers.clone();
    router.register(methods::NETWORK_DETACH_TAP, move |payload| {
        let h = h.clone();
        async move {
            let req: DetachTapRequest = parse(payload)?;
            h.network.detach_tap(&req.mac_address).await.map_err(to_rpc)?;
            Ok(Ack::ok())
        }
    });

    router
}

/// Find which on-disk format a volume currently has
async fn existing_format(
    driver: &dyn storage::StorageDriver,
    volume_id: &str,
) -> Result<String, RpcError> {
    for format in ["qcow2", "raw"] {
        if let Ok(Some(info)) = driver.describe_volume(volume_id, format).await {
            return Ok(info.format);
        }
    }
    Err(RpcError::new(
        RpcErrorCode::VolumeNotFound,
        format!("no backing store for volume {}", volume_id),
    ))
}

/// Derive the network plumbing for a NIC from its bridge name convention
fn network_spec_for(nic: &NicSpec) -> NetworkSpec {
    let vlan_id = nic
        .bridge
        .strip_prefix("br-vlan")
        .and_then(|v| v.parse().ok());
    NetworkSpec {
        network_id: nic.network_id.clone(),
        name: nic.network_id.clone(),
        bridge: nic.bridge.clone(),
        vlan_id,
        mtu: 1500,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ironhive_common::rpc::RpcMessage;
    use serde_json::json;

    fn test_handlers() -> Arc<AgentHandlers> {
        Arc::new(AgentHandlers {
            hypervisor: Arc::new(HypervisorManager::new("/tmp/ironhive-test-domains")),
            network: Arc::new(NetworkManager::new("eth0")),
            cache: TaskCache::new(),
        })
    }

    #[test]
    fn test_network_spec_from_bridge_convention() {
        let nic = NicSpec {
            network_id: "net-1".into(),
            mac_address: "52:54:00:00:00:01".into(),
            ip_address: None,
            model: "virtio".into(),
            bridge: "br-vlan100".into(),
        };
        assert_eq!(network_spec_for(&nic).vlan_id, Some(100));

        let flat = NicSpec {
            bridge: "br-default".into(),
            ..nic
        };
        assert_eq!(network_spec_for(&flat).vlan_id, None);
    }

    #[test]
    fn test_snapshot_tag_is_deterministic() {
        assert_eq!(
            AgentHandlers::snapshot_tag("s-1"),
            AgentHandlers::snapshot_tag("s-1")
        );
    }

    #[tokio::test]
    async fn test_router_covers_catalogue() {
        let router = build_router(test_handlers());
        let registered = router.methods();
        for expected in [
            methods::VM_DEFINE_AND_START,
            methods::VM_STOP,
            methods::VM_RESTART,
            methods::VM_ATTACH_DISK,
            methods::VM_DETACH_DISK,
            methods::VM_DESCRIBE,
            methods::VM_MIGRATE,
            methods::VOLUME_CREATE,
            methods::VOLUME_DELETE,
            methods::VOLUME_RESIZE,
            methods::VOLUME_CLONE,
            methods::VOLUME_DESCRIBE,
            methods::SNAPSHOT_CREATE,
            methods::SNAPSHOT_DELETE,
            methods::SNAPSHOT_RESTORE,
            methods::NETWORK_ENSURE,
            methods::NETWORK_ATTACH_TAP,
            methods::NETWORK_DETACH_TAP,
        ] {
            assert!(
                registered.contains(&expected.to_string()),
                "missing {}",
                expected
            );
        }
    }

    #[tokio::test]
    async fn test_bad_payload_is_invalid_request() {
        let router = build_router(test_handlers());
        let resp = router
            .handle_request(RpcMessage::request(methods::VM_STOP, json!({"nope": 1})))
            .await;
        assert!(resp.is_error());
        assert_eq!(resp.error.unwrap().code, "INVALID_REQUEST");
    }

    #[tokio::test]
    async fn test_idempotent_returns_cached_result() {
        let cache = TaskCache::new();
        let mut calls = 0;
        let first = idempotent(&cache, "t1", || {
            calls += 1;
            async { Ok(json!({"n": 1})) }
        })
        .await
        .unwrap();
        let second = idempotent(&cache, "t1", || {
            calls += 1;
            async { Ok(json!({"n": 2})) }
        })
        .await
        .unwrap();

        assert_eq!(calls, 1);
        assert_eq!(first, second);
    }
}
