//! Snapshot orchestration
//!
//! A snapshot is captured live (through the hypervisor) when its volume is
//! attached to a VM, or offline (through the image tool) when the volume
//! is detached. The mode is chosen from the volume's association at the
//! moment the operation starts.

use chrono::Utc;
use ironhive_common::rpc::conn::LONG_CALL_TIMEOUT;
use ironhive_common::rpc::types::{
    CreateSnapshotRequest as RpcCreateSnapshot, CreateSnapshotResponse, DeleteSnapshotRequest,
    PoolSpec, RestoreSnapshotRequest, SnapshotMode,
};
use ironhive_common::rpc::methods;
use ironhive_common::{Error, Result};
use serde::Deserialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::db::snapshots::{self, Snapshot, SnapshotStatus};
use crate::db::volumes::{self, VolumeStatus};
use crate::db::{db_err, pools};
use crate::state::AppState;

pub struct SnapshotManager {
    state: AppState,
}

#[derive(Debug, Deserialize)]
pub struct CreateSnapshotRequest {
    pub volume_id: String,
    pub name: String,
    pub description: Option<String>,
}

impl SnapshotManager {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    pub async fn get(&self, id: &str) -> Result<Snapshot> {
        snapshots::get(self.state.db.pool(), id).await
    }

    pub async fn list(
        &self,
        page: usize,
        page_size: usize,
        volume_id: Option<&str>,
    ) -> Result<(Vec<Snapshot>, usize)> {
        snapshots::list(self.state.db.pool(), page, page_size, volume_id).await
    }

    pub async fn update(
        &self,
        id: &str,
        name: &str,
        description: Option<&str>,
        actor: &str,
    ) -> Result<Snapshot> {
        snapshots::get(self.state.db.pool(), id).await?;
        snapshots::update_name_description(self.state.db.pool(), id, name, description).await?;
        self.state
            .audit
            .record(actor, "snapshot.update", "snapshot", id, None)
            .await;
        snapshots::get(self.state.db.pool(), id).await
    }

    /// Resolve the pool, node, and capture mode for a volume
    async fn capture_plan(&self, volume_id: &str) -> Result<(PoolSpec, String, SnapshotMode, Option<String>)> {
        let volume = volumes::get(self.state.db.pool(), volume_id).await?;
        let mode = match volume.status {
            VolumeStatus::InUse => SnapshotMode::Live,
            VolumeStatus::Available => SnapshotMode::Offline,
            other => {
                return Err(Error::Precondition(format!(
                    "volume is {}, snapshots need available or in_use",
                    other.as_str()
                )))
            }
        };
        let pool = pools::get(self.state.db.pool(), &volume.pool_id).await?;
        let node_id = pool.node_id.clone().ok_or_else(|| {
            Error::Validation(format!("pool '{}' has no host node assigned", pool.name))
        })?;
        let pool_spec = PoolSpec {
            pool_id: pool.id,
            name: pool.name,
            config: pool.config,
        };
        Ok((pool_spec, node_id, mode, volume.vm_id))
    }

    pub async fn create(&self, req: CreateSnapshotRequest, actor: &str) -> Result<(Snapshot, String)> {
        let _guard = self.state.volume_locks.lock(&req.volume_id).await;
        let (pool_spec, node_id, mode, vm_id) = self.capture_plan(&req.volume_id).await?;

        let now = Utc::now();
        let snapshot = Snapshot {
            id: Uuid::new_v4().to_string(),
            name: req.name.clone(),
            volume_id: req.volume_id.clone(),
            status: SnapshotStatus::Creating,
            size_gb: None,
            snapshot_tag: String::new(),
            description: req.description.clone(),
            metadata: None,
            created_at: now,
            updated_at: now,
        };

        let task = self.state.tasks.build(
            "snapshot.create",
            "snapshot",
            &snapshot.id,
            Some(&node_id),
            serde_json::json!({ "volume_id": req.volume_id, "mode": mode }),
            actor,
        );
        let rpc_req = RpcCreateSnapshot {
            task_id: task.id.clone(),
            snapshot_id: snapshot.id.clone(),
            volume_id: req.volume_id.clone(),
            vm_id,
            pool: pool_spec,
            name: req.name,
            mode,
        };

        let mut tx = self
            .state
            .db
            .pool()
            .begin()
            .await
            .map_err(|e| db_err("failed to begin transaction", e))?;
        // Row insert and task insert commit together.
        snapshots::insert_tx(&mut tx, &snapshot).await?;
        self.state.tasks.insert_tx(&mut tx, &task).await?;
        tx.commit()
            .await
            .map_err(|e| db_err("failed to commit snapshot creation", e))?;

        self.state
            .audit
            .record(actor, "snapshot.create", "snapshot", &snapshot.id, None)
            .await;

        let state = self.state.clone();
        let task_id = task.id.clone();
        let snapshot_id = snapshot.id.clone();
        tokio::spawn(async move {
            let _ = state.tasks.mark_running(&task_id).await;
            let payload = serde_json::to_value(&rpc_req).unwrap_or_default();
            let reply = state
                .registry
                .call(&node_id, methods::SNAPSHOT_CREATE, payload, LONG_CALL_TIMEOUT)
                .await;
            match reply {
                Ok(msg) => {
                    let parsed = msg
                        .payload
                        .and_then(|p| serde_json::from_value::<CreateSnapshotResponse>(p).ok());
                    match parsed {
                        Some(resp) => {
                            let _ = snapshots::finish_create(
                                state.db.pool(),
                                &snapshot_id,
                                &resp.tag,
                                resp.size_gb,
                            )
                            .await;
                            let _ = state
                                .tasks
                                .complete(&task_id, Some(serde_json::json!({ "tag": resp.tag })))
                                .await;
                            info!(snapshot = %snapshot_id, "snapshot ready");
                        }
                        None => {
                            let _ = state.tasks.fail(&task_id, "malformed agent response").await;
                            let _ = snapshots::set_status(
                                state.db.pool(),
                                &snapshot_id,
                                SnapshotStatus::Error,
                            )
                            .await;
                        }
                    }
                }
                Err(e) if e.is_retryable() => {
                    warn!(snapshot = %snapshot_id, "snapshot create in doubt: {}", e);
                    let _ = state.tasks.fail(&task_id, &e.to_string()).await;
                }
                Err(e) => {
                    error!(snapshot = %snapshot_id, "snapshot create failed: {}", e);
                    let _ = state.tasks.fail(&task_id, &e.to_string()).await;
                    let _ = snapshots::set_status(
                        state.db.pool(),
                        &snapshot_id,
                        SnapshotStatus::Error,
                    )
                    .await;
                }
            }
        });

        Ok((snapshot, task.id))
    }

    pub async fn delete(&self, id: &str, actor: &str) -> Result<String> {
        let snapshot = snapshots::get(self.state.db.pool(), id).await?;
        let _guard = self.state.volume_locks.lock(&snapshot.volume_id).await;
        if snapshot.status == SnapshotStatus::Creating || snapshot.status == SnapshotStatus::Deleting {
            return Err(Error::Precondition(format!(
                "snapshot is {}",
                snapshot.status.as_str()
            )));
        }

        let (pool_spec, node_id, mode, vm_id) = self.capture_plan(&snapshot.volume_id).await?;
        let task = self.state.tasks.build(
            "snapshot.delete",
            "snapshot",
            id,
            Some(&node_id),
            serde_json::json!({ "snapshot_id": id, "tag": snapshot.snapshot_tag }),
            actor,
        );
        let rpc_req = DeleteSnapshotRequest {
            task_id: task.id.clone(),
            volume_id: snapshot.volume_id.clone(),
            vm_id,
            pool: pool_spec,
            tag: snapshot.snapshot_tag.clone(),
            mode,
        };

        snapshots::set_status(self.state.db.pool(), id, SnapshotStatus::Deleting).await?;
        let mut conn = self
            .state
            .db
            .pool()
            .acquire()
            .await
            .map_err(|e| db_err("failed to acquire connection", e))?;
        self.state.tasks.insert_tx(&mut conn, &task).await?;
        drop(conn);

        self.state
            .audit
            .record(actor, "snapshot.delete", "snapshot", id, None)
            .await;

        let state = self.state.clone();
        let task_id = task.id.clone();
        let snapshot_id = id.to_string();
        tokio::spawn(async move {
            let _ = state.tasks.mark_running(&task_id).await;
            let payload = serde_json::to_value(&rpc_req).unwrap_or_default();
            let reply = state
                .registry
                .call(&node_id, methods::SNAPSHOT_DELETE, payload, LONG_CALL_TIMEOUT)
                .await;
            match reply {
                Ok(_) => {
                    let _ = snapshots::delete(state.db.pool(), &snapshot_id).await;
                    let _ = state.tasks.complete(&task_id, None).await;
                    info!(snapshot = %snapshot_id, "snapshot deleted");
                }
                Err(e) if e.is_retryable() => {
                    warn!(snapshot = %snapshot_id, "snapshot delete in doubt: {}", e);
                    let _ = state.tasks.fail(&task_id, &e.to_string()).await;
                }
                Err(e) => {
                    error!(snapshot = %snapshot_id, "snapshot delete failed: {}", e);
                    let _ = state.tasks.fail(&task_id, &e.to_string()).await;
                    let _ = snapshots::set_status(
                        state.db.pool(),
                        &snapshot_id,
                        SnapshotStatus::Error,
                    )
                    .await;
                }
            }
        });

        Ok(task.id)
    }

    /// Roll a volume back to a snapshot. The parent volume must be
    /// detached; a running VM must be stopped first.
    pub async fn restore(&self, id: &str, actor: &str) -> Result<String> {
        let snapshot = snapshots::get(self.state.db.pool(), id).await?;
        let _guard = self.state.volume_locks.lock(&snapshot.volume_id).await;
        if snapshot.status != SnapshotStatus::Available {
            return Err(Error::Precondition(format!(
                "snapshot is {}",
                snapshot.status.as_str()
            )));
        }

        let volume = volumes::get(self.state.db.pool(), &snapshot.volume_id).await?;
        if volume.status != VolumeStatus::Available {
            return Err(Error::Precondition(
                "restore requires the volume to be detached; stop the virtual machine first".into(),
            ));
        }

        let (pool_spec, node_id, _, _) = self.capture_plan(&snapshot.volume_id).await?;
        let task = self.state.tasks.build(
            "snapshot.restore",
            "snapshot",
            id,
            Some(&node_id),
            serde_json::json!({ "snapshot_id": id, "tag": snapshot.snapshot_tag }),
            actor,
        );
        let rpc_req = RestoreSnapshotRequest {
            task_id: task.id.clone(),
            volume_id: snapshot.volume_id.clone(),
            pool: pool_spec,
            tag: snapshot.snapshot_tag.clone(),
        };

        let mut conn = self
            .state
            .db
            .pool()
            .acquire()
            .await
            .map_err(|e| db_err("failed to acquire connection", e))?;
        self.state.tasks.insert_tx(&mut conn, &task).await?;
        drop(conn);

        self.state
            .audit
            .record(actor, "snapshot.restore", "snapshot", id, None)
            .await;

        let state = self.state.clone();
        let task_id = task.id.clone();
        let snapshot_id = id.to_string();
        tokio::spawn(async move {
            let _ = state.tasks.mark_running(&task_id).await;
            let payload = serde_json::to_value(&rpc_req).unwrap_or_default();
            let reply = state
                .registry
                .call(&node_id, methods::SNAPSHOT_RESTORE, payload, LONG_CALL_TIMEOUT)
                .await;
            match reply {
                Ok(_) => {
                    let _ = state.tasks.complete(&task_id, None).await;
                    info!(snapshot = %snapshot_id, "snapshot restored");
                }
                Err(e) => {
                    error!(snapshot = %snapshot_id, "snapshot restore failed: {}", e);
                    let _ = state.tasks.fail(&task_id, &e.to_string()).await;
                }
            }
        });

        Ok(task.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::pools::tests::sample_pool;
    use crate::db::volumes::tests::sample_volume;
    use crate::state::AppState;

    async fn setup(volume_status: VolumeStatus) -> (SnapshotManager, String) {
        let state = AppState::for_tests().await;
        pools::insert(state.db.pool(), &sample_pool("p1", "nfs0"))
            .await
            .unwrap();
        let mut volume = sample_volume("v1", "p1", 10);
        volume.status = volume_status;
        if volume_status == VolumeStatus::InUse {
            volume.vm_id = Some("vm-1".to_string());
        }
        let mut conn = state.db.pool().acquire().await.unwrap();
        volumes::insert_tx(&mut conn, &volume).await.unwrap();
        drop(conn);
        (SnapshotManager::new(state), "v1".to_string())
    }

    #[tokio::test]
    async fn test_mode_follows_volume_association() {
        let (manager, volume_id) = setup(VolumeStatus::InUse).await;
        let (_, _, mode, vm_id) = manager.capture_plan(&volume_id).await.unwrap();
        assert_eq!(mode, SnapshotMode::Live);
        assert_eq!(vm_id.as_deref(), Some("vm-1"));

        let (manager, volume_id) = setup(VolumeStatus::Available).await;
        let (_, _, mode, _) = manager.capture_plan(&volume_id).await.unwrap();
        assert_eq!(mode, SnapshotMode::Offline);
    }

    #[tokio::test]
    async fn test_snapshot_rejected_for_transitional_volume() {
        let (manager, volume_id) = setup(VolumeStatus::Creating).await;
        let err = manager
            .create(
                CreateSnapshotRequest {
                    volume_id,
                    name: "snap0".into(),
                    description: None,
                },
                "tester",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
    }

    #[tokio::test]
    async fn test_restore_rejected_while_volume_in_use() {
        let (manager, volume_id) = setup(VolumeStatus::InUse).await;
        let snapshot = Snapshot {
            id: "s1".into(),
            name: "snap0".into(),
            volume_id,
            status: SnapshotStatus::Available,
            size_gb: Some(10),
            snapshot_tag: "snap-s1".into(),
            description: None,
            metadata: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        snapshots::insert(manager.state.db.pool(), &snapshot)
            .await
            .unwrap();

        let err = manager.restore("s1", "tester").await.unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
        // No state change either.
        assert_eq!(
            snapshots::get(manager.state.db.pool(), "s1")
                .await
                .unwrap()
                .status,
            SnapshotStatus::Available
        );
    }
}
