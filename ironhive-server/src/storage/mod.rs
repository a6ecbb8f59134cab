//! Storage orchestration: pools and volumes
//!
//! Every mutating operation follows the same contract: validate against
//! current row state, commit the intent state together with a task row in
//! one transaction, dispatch to the pool's host agent, and fold the reply
//! into the terminal state. Agent timeouts leave the row in its intent
//! state for the reconciliation sweep.

pub mod snapshot;

use chrono::Utc;
use ironhive_common::rpc::conn::{DEFAULT_CALL_TIMEOUT, LONG_CALL_TIMEOUT};
use ironhive_common::rpc::types::{
    CloneVolumeRequest, CreateVolumeRequest as RpcCreateVolume, CreateVolumeResponse,
    DeleteVolumeRequest, PoolConfig, PoolSpec, ResizeVolumeRequest,
};
use ironhive_common::rpc::{methods, RpcError};
use ironhive_common::{Error, Result};
use serde::Deserialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::db::pools::{self, PoolStatus, StoragePool};
use crate::db::volumes::{self, Volume, VolumeStatus};
use crate::db::{db_err, snapshots};
use crate::state::AppState;

pub struct StorageManager {
    state: AppState,
}

#[derive(Debug, Deserialize)]
pub struct CreatePoolRequest {
    pub name: String,
    pub config: PoolConfig,
    pub capacity_gb: u64,
    pub node_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdatePoolRequest {
    pub name: Option<String>,
    pub capacity_gb: Option<u64>,
    pub status: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateVolumeRequest {
    pub name: String,
    #[serde(default = "default_volume_type")]
    pub volume_type: String,
    pub size_gb: u64,
    pub pool_id: String,
    pub metadata: Option<serde_json::Value>,
}

fn default_volume_type() -> String {
    "qcow2".to_string()
}

impl StorageManager {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    // -- pools --------------------------------------------------------------

    pub async fn create_pool(&self, req: CreatePoolRequest, actor: &str) -> Result<StoragePool> {
        if req.name.is_empty() {
            return Err(Error::Validation("pool name must not be empty".into()));
        }
        if pools::get_by_name(self.state.db.pool(), &req.name)
            .await?
            .is_some()
        {
            return Err(Error::Validation(format!(
                "pool '{}' already exists",
                req.name
            )));
        }
        if req.capacity_gb == 0 {
            return Err(Error::Validation("pool capacity must be non-zero".into()));
        }

        let now = Utc::now();
        let pool = StoragePool {
            id: Uuid::new_v4().to_string(),
            name: req.name,
            pool_type: req.config.pool_type().to_string(),
            status: PoolStatus::Active,
            config: req.config,
            capacity_gb: req.capacity_gb,
            allocated_gb: 0,
            node_id: req.node_id,
            created_at: now,
            updated_at: now,
        };
        pools::insert(self.state.db.pool(), &pool).await?;
        self.state
            .audit
            .record(actor, "pool.create", "storage_pool", &pool.id, None)
            .await;
        info!(pool = %pool.id, name = %pool.name, "storage pool created");
        Ok(pool)
    }

    pub async fn get_pool(&self, id: &str) -> Result<StoragePool> {
        pools::get(self.state.db.pool(), id).await
    }

    pub async fn list_pools(&self, page: usize, page_size: usize) -> Result<(Vec<StoragePool>, usize)> {
        pools::list(self.state.db.pool(), page, page_size).await
    }

    pub async fn update_pool(
        &self,
        id: &str,
        req: UpdatePoolRequest,
        actor: &str,
    ) -> Result<StoragePool> {
        let pool = pools::get(self.state.db.pool(), id).await?;
        let name = req.name.unwrap_or(pool.name);
        let capacity = req.capacity_gb.unwrap_or(pool.capacity_gb);
        let status = match req.status.as_deref() {
            Some(raw) => match raw {
                "active" => PoolStatus::Active,
                "inactive" => PoolStatus::Inactive,
                other => {
                    return Err(Error::Validation(format!("unknown pool status: {}", other)))
                }
            },
            None => pool.status,
        };
        pools::update(self.state.db.pool(), id, &name, capacity, status).await?;
        self.state
            .audit
            .record(actor, "pool.update", "storage_pool", id, None)
            .await;
        pools::get(self.state.db.pool(), id).await
    }

    pub async fn delete_pool(&self, id: &str, actor: &str) -> Result<()> {
        pools::get(self.state.db.pool(), id).await?;
        let volumes = volumes::count_in_pool(self.state.db.pool(), id).await?;
        if volumes > 0 {
            return Err(Error::Precondition(format!(
                "pool still holds {} volumes",
                volumes
            )));
        }
        pools::delete(self.state.db.pool(), id).await?;
        self.state
            .audit
            .record(actor, "pool.delete", "storage_pool", id, None)
            .await;
        Ok(())
    }

    fn pool_spec(pool: &StoragePool) -> PoolSpec {
        PoolSpec {
            pool_id: pool.id.clone(),
            name: pool.name.clone(),
            config: pool.config.clone(),
        }
    }

    fn pool_node(pool: &StoragePool) -> Result<String> {
        pool.node_id.clone().ok_or_else(|| {
            Error::Validation(format!("pool '{}' has no host node assigned", pool.name))
        })
    }

    // -- volumes ------------------------------------------------------------

    pub async fn get_volume(&self, id: &str) -> Result<Volume> {
        volumes::get(self.state.db.pool(), id).await
    }

    pub async fn list_volumes(
        &self,
        page: usize,
        page_size: usize,
        pool_id: Option<&str>,
        status: Option<&str>,
    ) -> Result<(Vec<Volume>, usize)> {
        volumes::list(self.state.db.pool(), page, page_size, pool_id, status).await
    }

    /// Create a volume row and dispatch the backing-store work. Returns
    /// the row (in `creating`) plus the task id driving it.
    pub async fn create_volume(
        &self,
        req: CreateVolumeRequest,
        actor: &str,
    ) -> Result<(Volume, String)> {
        let pool = pools::get(self.state.db.pool(), &req.pool_id).await?;
        if pool.status != PoolStatus::Active {
            return Err(Error::Precondition(format!(
                "pool '{}' is {}",
                pool.name,
                pool.status.as_str()
            )));
        }
        if req.size_gb == 0 {
            return Err(Error::Validation("volume size must be non-zero".into()));
        }
        if req.size_gb > pool.available_gb() {
            return Err(Error::Precondition(format!(
                "pool '{}' has only {} GiB available",
                pool.name,
                pool.available_gb()
            )));
        }
        if !matches!(req.volume_type.as_str(), "qcow2" | "raw" | "ceph" | "nfs" | "lvm") {
            return Err(Error::Validation(format!(
                "unknown volume type: {}",
                req.volume_type
            )));
        }
        let node_id = Self::pool_node(&pool)?;

        let now = Utc::now();
        let volume = Volume {
            id: Uuid::new_v4().to_string(),
            name: req.name,
            volume_type: req.volume_type,
            size_gb: req.size_gb,
            pool_id: pool.id.clone(),
            path: None,
            status: VolumeStatus::Creating,
            vm_id: None,
            metadata: req.metadata,
            created_at: now,
            updated_at: now,
        };

        let rpc_req = RpcCreateVolume {
            task_id: String::new(), // filled below once the task exists
            volume_id: volume.id.clone(),
            name: volume.name.clone(),
            size_gb: volume.size_gb,
            format: volume.format().to_string(),
            pool: Self::pool_spec(&pool),
            source: volume.source(),
        };
        let task = self.state.tasks.build(
            "volume.create",
            "volume",
            &volume.id,
            Some(&node_id),
            serde_json::to_value(&RpcCreateVolume {
                task_id: String::new(),
                ..rpc_req.clone()
            })?,
            actor,
        );
        let rpc_req = RpcCreateVolume {
            task_id: task.id.clone(),
            ..rpc_req
        };

        let mut tx = self
            .state
            .db
            .pool()
            .begin()
            .await
            .map_err(|e| db_err("failed to begin transaction", e))?;
        volumes::insert_tx(&mut tx, &volume).await?;
        pools::recompute_allocation_tx(&mut tx, &pool.id).await?;
        self.state.tasks.insert_tx(&mut tx, &task).await?;
        tx.commit()
            .await
            .map_err(|e| db_err("failed to commit volume creation", e))?;

        self.state
            .audit
            .record(actor, "volume.create", "volume", &volume.id, None)
            .await;

        let state = self.state.clone();
        let task_id = task.id.clone();
        let volume_id = volume.id.clone();
        let pool_id = pool.id.clone();
        let has_source = rpc_req.source.is_some();
        tokio::spawn(async move {
            let timeout = if has_source { LONG_CALL_TIMEOUT } else { DEFAULT_CALL_TIMEOUT };
            let _ = state.tasks.mark_running(&task_id).await;
            let payload = match serde_json::to_value(&rpc_req) {
                Ok(p) => p,
                Err(e) => {
                    error!(volume = %volume_id, "unserializable rpc payload: {}", e);
                    return;
                }
            };
            let reply = state
                .registry
                .call(&node_id, methods::VOLUME_CREATE, payload, timeout)
                .await;
            settle_volume_create(&state, &task_id, &volume_id, &pool_id, reply).await;
        });

        Ok((volume, task.id))
    }

    /// Delete a volume. `in_use` rows are rejected; the row survives (in
    /// `deleting` or `error`) until the agent confirms the backing store
    /// is gone.
    pub async fn delete_volume(&self, id: &str, actor: &str) -> Result<String> {
        let _guard = self.state.volume_locks.lock(id).await;
        let volume = volumes::get(self.state.db.pool(), id).await?;

        match volume.status {
            VolumeStatus::InUse => {
                return Err(Error::Precondition(
                    "volume is attached to a virtual machine".into(),
                ))
            }
            VolumeStatus::Creating | VolumeStatus::Deleting => {
                return Err(Error::Precondition(format!(
                    "volume is {}",
                    volume.status.as_str()
                )))
            }
            VolumeStatus::Available | VolumeStatus::Error => {}
        }
        let held_snapshots = snapshots::count_for_volume(self.state.db.pool(), id).await?;
        if held_snapshots > 0 {
            return Err(Error::Precondition(format!(
                "volume has {} snapshots",
                held_snapshots
            )));
        }

        let pool = pools::get(self.state.db.pool(), &volume.pool_id).await?;
        let node_id = Self::pool_node(&pool)?;

        let task = self.state.tasks.build(
            "volume.delete",
            "volume",
            id,
            Some(&node_id),
            serde_json::json!({ "volume_id": id }),
            actor,
        );
        let rpc_req = DeleteVolumeRequest {
            task_id: task.id.clone(),
            volume_id: id.to_string(),
            pool: Self::pool_spec(&pool),
        };

        let mut tx = self
            .state
            .db
            .pool()
            .begin()
            .await
            .map_err(|e| db_err("failed to begin transaction", e))?;
        volumes::set_status_tx(&mut tx, id, VolumeStatus::Deleting).await?;
        pools::recompute_allocation_tx(&mut tx, &volume.pool_id).await?;
        self.state.tasks.insert_tx(&mut tx, &task).await?;
        tx.commit()
            .await
            .map_err(|e| db_err("failed to commit volume delete", e))?;

        self.state
            .audit
            .record(actor, "volume.delete", "volume", id, None)
            .await;

        let state = self.state.clone();
        let task_id = task.id.clone();
        let volume_id = id.to_string();
        let pool_id = volume.pool_id.clone();
        tokio::spawn(async move {
            let _ = state.tasks.mark_running(&task_id).await;
            let payload = serde_json::to_value(&rpc_req).unwrap_or_default();
            let reply = state
                .registry
                .call(&node_id, methods::VOLUME_DELETE, payload, DEFAULT_CALL_TIMEOUT)
                .await;
            settle_volume_delete(&state, &task_id, &volume_id, &pool_id, reply).await;
        });

        Ok(task.id)
    }

    /// Grow a volume in place; requires `available`
    pub async fn resize_volume(&self, id: &str, new_size_gb: u64, actor: &str) -> Result<String> {
        let _guard = self.state.volume_locks.lock(id).await;
        let volume = volumes::get(self.state.db.pool(), id).await?;
        if volume.status != VolumeStatus::Available {
            return Err(Error::Precondition(format!(
                "resize requires an available volume, found {}",
                volume.status.as_str()
            )));
        }
        if new_size_gb <= volume.size_gb {
            return Err(Error::Validation(format!(
                "new size {} GiB must exceed current {} GiB",
                new_size_gb, volume.size_gb
            )));
        }
        let pool = pools::get(self.state.db.pool(), &volume.pool_id).await?;
        if new_size_gb - volume.size_gb > pool.available_gb() {
            return Err(Error::Precondition(format!(
                "pool '{}' has only {} GiB available",
                pool.name,
                pool.available_gb()
            )));
        }
        let node_id = Self::pool_node(&pool)?;

        let task = self.state.tasks.build(
            "volume.resize",
            "volume",
            id,
            Some(&node_id),
            serde_json::json!({ "volume_id": id, "new_size_gb": new_size_gb }),
            actor,
        );
        let rpc_req = ResizeVolumeRequest {
            task_id: task.id.clone(),
            volume_id: id.to_string(),
            pool: Self::pool_spec(&pool),
            new_size_gb,
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
            .record(actor, "volume.resize", "volume", id, None)
            .await;

        let state = self.state.clone();
        let task_id = task.id.clone();
        let volume_id = id.to_string();
        let pool_id = volume.pool_id.clone();
        tokio::spawn(async move {
            let _ = state.tasks.mark_running(&task_id).await;
            let payload = serde_json::to_value(&rpc_req).unwrap_or_default();
            let reply = state
                .registry
                .call(&node_id, methods::VOLUME_RESIZE, payload, DEFAULT_CALL_TIMEOUT)
                .await;
            match reply {
                Ok(_) => {
                    let _ = volumes::set_size(state.db.pool(), &volume_id, new_size_gb).await;
                    let mut conn = match state.db.pool().acquire().await {
                        Ok(c) => c,
                        Err(e) => {
                            error!("failed to acquire connection: {}", e);
                            return;
                        }
                    };
                    let _ = pools::recompute_allocation_tx(&mut conn, &pool_id).await;
                    let _ = state.tasks.complete(&task_id, None).await;
                }
                Err(e) => {
                    settle_driver_failure(&state, &task_id, &volume_id, e, "resize").await;
                }
            }
        });

        Ok(task.id)
    }

    /// Clone an available volume into a new volume in the same pool
    pub async fn clone_volume(
        &self,
        id: &str,
        clone_name: &str,
        actor: &str,
    ) -> Result<(Volume, String)> {
        let _guard = self.state.volume_locks.lock(id).await;
        let source = volumes::get(self.state.db.pool(), id).await?;
        if source.status != VolumeStatus::Available {
            return Err(Error::Precondition(format!(
                "clone requires an available source, found {}",
                source.status.as_str()
            )));
        }
        let pool = pools::get(self.state.db.pool(), &source.pool_id).await?;
        if source.size_gb > pool.available_gb() {
            return Err(Error::Precondition(format!(
                "pool '{}' has only {} GiB available",
                pool.name,
                pool.available_gb()
            )));
        }
        let node_id = Self::pool_node(&pool)?;

        let now = Utc::now();
        let clone = Volume {
            id: Uuid::new_v4().to_string(),
            name: clone_name.to_string(),
            volume_type: source.volume_type.clone(),
            size_gb: source.size_gb,
            pool_id: source.pool_id.clone(),
            path: None,
            status: VolumeStatus::Creating,
            vm_id: None,
            metadata: None,
            created_at: now,
            updated_at: now,
        };

        let task = self.state.tasks.build(
            "volume.clone",
            "volume",
            &clone.id,
            Some(&node_id),
            serde_json::json!({ "source_volume_id": id, "clone_volume_id": clone.id }),
            actor,
        );
        let rpc_req = CloneVolumeRequest {
            task_id: task.id.clone(),
            source_volume_id: id.to_string(),
            clone_volume_id: clone.id.clone(),
            pool: Self::pool_spec(&pool),
        };

        let mut tx = self
            .state
            .db
            .pool()
            .begin()
            .await
            .map_err(|e| db_err("failed to begin transaction", e))?;
        volumes::insert_tx(&mut tx, &clone).await?;
        pools::recompute_allocation_tx(&mut tx, &pool.id).await?;
        self.state.tasks.insert_tx(&mut tx, &task).await?;
        tx.commit()
            .await
            .map_err(|e| db_err("failed to commit clone", e))?;

        self.state
            .audit
            .record(actor, "volume.clone", "volume", &clone.id, None)
            .await;

        let state = self.state.clone();
        let task_id = task.id.clone();
        let clone_id = clone.id.clone();
        let pool_id = pool.id.clone();
        tokio::spawn(async move {
            let _ = state.tasks.mark_running(&task_id).await;
            let payload = serde_json::to_value(&rpc_req).unwrap_or_default();
            let reply = state
                .registry
                .call(&node_id, methods::VOLUME_CLONE, payload, LONG_CALL_TIMEOUT)
                .await;
            settle_volume_create(&state, &task_id, &clone_id, &pool_id, reply).await;
        });

        Ok((clone, task.id))
    }
}

/// Fold a volume.create / volume.clone reply into the row
async fn settle_volume_create(
    state: &AppState,
    task_id: &str,
    volume_id: &str,
    pool_id: &str,
    reply: std::result::Result<ironhive_common::rpc::RpcMessage, RpcError>,
) {
    match reply {
        Ok(msg) => {
            let parsed = msg
                .payload
                .and_then(|p| serde_json::from_value::<CreateVolumeResponse>(p).ok());
            let Some(resp) = parsed else {
                warn!(volume = volume_id, "volume create reply had no usable payload");
                let _ = state.tasks.fail(task_id, "malformed agent response").await;
                let _ = volumes::set_status(state.db.pool(), volume_id, VolumeStatus::Error).await;
                return;
            };
            // A pool that went inactive mid-flight blocks the transition;
            // the row stays in `creating` for the sweep to settle.
            if let Ok(pool) = pools::get(state.db.pool(), pool_id).await {
                if pool.status == PoolStatus::Inactive {
                    warn!(volume = volume_id, "pool inactive; volume held in creating");
                    let _ = state.tasks.fail(task_id, "pool is inactive").await;
                    return;
                }
            }
            let _ = volumes::finish_create(state.db.pool(), volume_id, &resp.path, resp.size_gb).await;
            let _ = state.tasks.complete(
                task_id,
                Some(serde_json::json!({ "path": resp.path, "size_gb": resp.size_gb })),
            )
            .await;
            info!(volume = volume_id, "volume ready");
        }
        Err(e) if e.is_retryable() => {
            // In doubt: the intent state stands until reconciliation.
            warn!(volume = volume_id, "volume create in doubt: {}", e);
            let _ = state.tasks.fail(task_id, &e.to_string()).await;
        }
        Err(e) => {
            error!(volume = volume_id, "volume create failed: {}", e);
            let _ = state.tasks.fail(task_id, &e.to_string()).await;
            let _ = volumes::set_status(state.db.pool(), volume_id, VolumeStatus::Error).await;
        }
    }
    recompute(state, pool_id).await;
}

/// Fold a volume.delete reply into the row
async fn settle_volume_delete(
    state: &AppState,
    task_id: &str,
    volume_id: &str,
    pool_id: &str,
    reply: std::result::Result<ironhive_common::rpc::RpcMessage, RpcError>,
) {
    use ironhive_common::rpc::RpcErrorCode;
    match reply {
        Ok(_) => {
            let mut removed = false;
            if let Ok(mut conn) = state.db.pool().acquire().await {
                removed = volumes::delete_tx(&mut conn, volume_id).await.is_ok();
            }
            if removed {
                let _ = state.tasks.complete(task_id, None).await;
                info!(volume = volume_id, "volume deleted");
            } else {
                let _ = state.tasks.fail(task_id, "failed to remove volume row").await;
            }
        }
        // Already gone on the node counts as deleted.
        Err(e) if e.code == RpcErrorCode::VolumeNotFound => {
            if let Ok(mut conn) = state.db.pool().acquire().await {
                let _ = volumes::delete_tx(&mut conn, volume_id).await;
            }
            let _ = state.tasks.complete(task_id, None).await;
        }
        Err(e) if e.is_retryable() => {
            warn!(volume = volume_id, "volume delete in doubt: {}", e);
            let _ = state.tasks.fail(task_id, &e.to_string()).await;
        }
        Err(e) => {
            error!(volume = volume_id, "volume delete failed: {}", e);
            let _ = state.tasks.fail(task_id, &e.to_string()).await;
            let _ = volumes::set_status(state.db.pool(), volume_id, VolumeStatus::Error).await;
        }
    }
    recompute(state, pool_id).await;
}

async fn settle_driver_failure(
    state: &AppState,
    task_id: &str,
    volume_id: &str,
    error: RpcError,
    what: &str,
) {
    if error.is_retryable() {
        warn!(volume = volume_id, "volume {} in doubt: {}", what, error);
        let _ = state.tasks.fail(task_id, &error.to_string()).await;
    } else {
        error!(volume = volume_id, "volume {} failed: {}", what, error);
        let _ = state.tasks.fail(task_id, &error.to_string()).await;
        let _ = volumes::set_status(state.db.pool(), volume_id, VolumeStatus::Error).await;
    }
}

async fn recompute(state: &AppState, pool_id: &str) {
    if let Ok(mut conn) = state.db.pool().acquire().await {
        if let Err(e) = pools::recompute_allocation_tx(&mut conn, pool_id).await {
            warn!(pool = pool_id, "failed to recompute pool allocation: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::AppState;

    async fn manager_with_pool(status: PoolStatus) -> (StorageManager, String) {
        let state = AppState::for_tests().await;
        let manager = StorageManager::new(state);
        let pool = manager
            .create_pool(
                CreatePoolRequest {
                    name: "nfs0".into(),
                    config: PoolConfig::Nfs {
                        server: "10.0.0.5".into(),
                        export: "/export/vms".into(),
                        mount_point: "/mnt/ironhive/nfs0".into(),
                    },
                    capacity_gb: 100,
                    node_id: Some("n1".into()),
                },
                "tester",
            )
            .await
            .unwrap();
        if status != PoolStatus::Active {
            pools::set_status(manager.state.db.pool(), &pool.id, status)
                .await
                .unwrap();
        }
        let id = pool.id.clone();
        (manager, id)
    }

    #[tokio::test]
    async fn test_create_volume_commits_intent_and_task() {
        let (manager, pool_id) = manager_with_pool(PoolStatus::Active).await;
        let (volume, task_id) = manager
            .create_volume(
                CreateVolumeRequest {
                    name: "disk0".into(),
                    volume_type: "qcow2".into(),
                    size_gb: 10,
                    pool_id: pool_id.clone(),
                    metadata: None,
                },
                "tester",
            )
            .await
            .unwrap();

        assert_eq!(volume.status, VolumeStatus::Creating);
        let task = manager.state.tasks.get(&task_id).await.unwrap();
        assert_eq!(task.task_type, "volume.create");
        assert_eq!(task.node_id.as_deref(), Some("n1"));

        // Pool accounting counts the creating volume immediately.
        let pool = manager.get_pool(&pool_id).await.unwrap();
        assert_eq!(pool.allocated_gb, 10);
    }

    #[tokio::test]
    async fn test_create_volume_rejected_on_inactive_pool() {
        let (manager, pool_id) = manager_with_pool(PoolStatus::Inactive).await;
        let err = manager
            .create_volume(
                CreateVolumeRequest {
                    name: "disk0".into(),
                    volume_type: "qcow2".into(),
                    size_gb: 10,
                    pool_id,
                    metadata: None,
                },
                "tester",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
    }

    #[tokio::test]
    async fn test_create_volume_rejected_over_capacity() {
        let (manager, pool_id) = manager_with_pool(PoolStatus::Active).await;
        let err = manager
            .create_volume(
                CreateVolumeRequest {
                    name: "disk0".into(),
                    volume_type: "qcow2".into(),
                    size_gb: 500,
                    pool_id,
                    metadata: None,
                },
                "tester",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
    }

    #[tokio::test]
    async fn test_delete_in_use_volume_rejected() {
        let (manager, pool_id) = manager_with_pool(PoolStatus::Active).await;
        let (volume, _) = manager
            .create_volume(
                CreateVolumeRequest {
                    name: "disk0".into(),
                    volume_type: "qcow2".into(),
                    size_gb: 10,
                    pool_id,
                    metadata: None,
                },
                "tester",
            )
            .await
            .unwrap();

        let mut conn = manager.state.db.pool().acquire().await.unwrap();
        volumes::set_attachment_tx(&mut conn, &volume.id, Some("vm-1"))
            .await
            .unwrap();
        drop(conn);

        let err = manager.delete_volume(&volume.id, "tester").await.unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
        assert_eq!(
            manager.get_volume(&volume.id).await.unwrap().status,
            VolumeStatus::InUse
        );
    }

    #[tokio::test]
    async fn test_resize_requires_available() {
        let (manager, pool_id) = manager_with_pool(PoolStatus::Active).await;
        let (volume, _) = manager
            .create_volume(
                CreateVolumeRequest {
                    name: "disk0".into(),
                    volume_type: "qcow2".into(),
                    size_gb: 10,
                    pool_id,
                    metadata: None,
                },
                "tester",
            )
            .await
            .unwrap();

        // Still `creating`: resize must be rejected.
        let err = manager
            .resize_volume(&volume.id, 20, "tester")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
    }

    #[tokio::test]
    async fn test_delete_pool_with_volumes_rejected() {
        let (manager, pool_id) = manager_with_pool(PoolStatus::Active).await;
        manager
            .create_volume(
                CreateVolumeRequest {
                    name: "disk0".into(),
                    volume_type: "qcow2".into(),
                    size_gb: 10,
                    pool_id: pool_id.clone(),
                    metadata: None,
                },
                "tester",
            )
            .await
            .unwrap();

        let err = manager.delete_pool(&pool_id, "tester").await.unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
    }
}
