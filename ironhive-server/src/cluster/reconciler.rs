//! Reconciliation sweep
//!
//! Agent timeouts leave entities in their intent states ("in doubt"). The
//! sweep runs once a minute, re-queries the agent for every stuck row, and
//! either completes the transition or marks the entity failed. Retries
//! reuse the original task id so the agent-side idempotency cache can
//! deduplicate; attempts back off exponentially and are capped by the
//! task's max_retries.

use chrono::{Duration as ChronoDuration, Utc};
use ironhive_common::rpc::conn::DEFAULT_CALL_TIMEOUT;
use ironhive_common::rpc::types::{DescribeVmRequest, DescribeVmResponse, DescribeVolumeRequest, PoolSpec, VolumeDescription};
use ironhive_common::rpc::methods;
use ironhive_common::Result;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::db::tasks::{self, TaskStatus};
use crate::db::vms::{self, VmStatus};
use crate::db::volumes::{self, VolumeStatus};
use crate::db::{nodes, pools, snapshots};
use crate::state::AppState;

/// How long a row may sit in an intent state before the sweep touches it
const STUCK_AFTER_SECS: i64 = 90;

/// Spawn the periodic background sweeps: heartbeat expiry and stuck-row
/// reconciliation.
pub fn spawn(state: Arc<AppState>) {
    let heartbeat_state = state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(30));
        loop {
            interval.tick().await;
            heartbeat_sweep(&heartbeat_state).await;
        }
    });

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(state.config.reconcile_interval);
        loop {
            interval.tick().await;
            if let Err(e) = reconcile_once(&state).await {
                warn!("reconciliation sweep failed: {}", e);
            }
            state.auth.prune_expired().await;
        }
    });
}

/// Flip nodes whose heartbeat aged out to offline and evict their sessions
async fn heartbeat_sweep(state: &AppState) {
    let timeout = state.config.heartbeat_timeout;

    let evicted = state.registry.evict_stale(timeout).await;
    for node_id in &evicted {
        debug!(node = %node_id, "evicted stale agent session");
    }

    let cutoff = Utc::now() - ChronoDuration::seconds(timeout.as_secs() as i64);
    match nodes::mark_stale_offline(state.db.pool(), cutoff).await {
        Ok(flipped) => {
            for node_id in flipped {
                warn!(node = %node_id, "node heartbeat timed out; marked offline");
                state.ws.node_status(&node_id, "offline");
            }
        }
        Err(e) => warn!("failed to expire heartbeats: {}", e),
    }
}

/// One pass over every entity stuck in an intent state
pub async fn reconcile_once(state: &AppState) -> Result<()> {
    reconcile_vms(state).await?;
    reconcile_volumes(state).await?;
    reconcile_snapshots(state).await?;
    Ok(())
}

fn is_stuck(updated_at: chrono::DateTime<Utc>) -> bool {
    Utc::now() - updated_at > ChronoDuration::seconds(STUCK_AFTER_SECS)
}

async fn reconcile_vms(state: &AppState) -> Result<()> {
    for status in [
        VmStatus::Starting,
        VmStatus::Stopping,
        VmStatus::Restarting,
        VmStatus::Migrating,
    ] {
        for vm in vms::list_by_status(state.db.pool(), status).await? {
            if !is_stuck(vm.updated_at) {
                continue;
            }
            let _guard = state.vm_locks.lock(&vm.id).await;
            // Re-read under the lock; the op may have settled meanwhile.
            let Ok(current) = vms::get(state.db.pool(), &vm.id).await else { continue };
            if current.status != status || !is_stuck(current.updated_at) {
                continue;
            }
            settle_stuck_vm(state, &current).await;
        }
    }
    Ok(())
}

async fn settle_stuck_vm(state: &AppState, vm: &vms::Vm) {
    let Some(node_id) = vm.node_id.clone() else {
        let _ = vms::set_status(state.db.pool(), &vm.id, VmStatus::Error).await;
        return;
    };

    let task = tasks::find_latest_for_target(state.db.pool(), "vm", &vm.id)
        .await
        .ok()
        .flatten();

    // Ask the hypervisor what actually happened.
    let describe = state
        .registry
        .call(
            &node_id,
            methods::VM_DESCRIBE,
            serde_json::to_value(&DescribeVmRequest { vm_id: vm.id.clone() })
                .unwrap_or_default(),
            DEFAULT_CALL_TIMEOUT,
        )
        .await;

    match describe {
        Ok(msg) => {
            let Some(desc) = msg
                .payload
                .and_then(|p| serde_json::from_value::<DescribeVmResponse>(p).ok())
            else {
                warn!(vm = %vm.id, "undecodable vm.describe reply");
                return;
            };

            let settled = match (vm.status, desc.state.as_str()) {
                // The start/restart made it after all.
                (VmStatus::Starting | VmStatus::Restarting | VmStatus::Migrating, "running") => {
                    if let Some(uuid) = &desc.uuid {
                        let _ = vms::set_uuid(state.db.pool(), &vm.id, uuid).await;
                    }
                    Some(VmStatus::Running)
                }
                // The stop finished; "absent" because stop undefines.
                (VmStatus::Stopping, "shut off" | "absent") => Some(VmStatus::Stopped),
                // Starting but the domain never appeared.
                (VmStatus::Starting | VmStatus::Restarting, "absent" | "shut off") => {
                    Some(VmStatus::Error)
                }
                (VmStatus::Stopping, "running") => Some(VmStatus::Error),
                _ => Some(VmStatus::Error),
            };

            if let Some(target) = settled {
                info!(vm = %vm.id, from = vm.status.as_str(), to = target.as_str(), "reconciled");
                let _ = vms::set_status(state.db.pool(), &vm.id, target).await;
                state.ws.vm_status(&vm.id, target.as_str(), Some("reconciled".into()));
                if let Some(task) = &task {
                    if !task.status.is_terminal() {
                        let _ = match target {
                            VmStatus::Error => state.tasks.fail(&task.id, "reconciled to error").await,
                            _ => state.tasks.complete(&task.id, None).await,
                        };
                    }
                }
            }
        }
        Err(e) => {
            // Node unreachable: burn a retry if the task has one left,
            // otherwise give up and mark the entity failed.
            debug!(vm = %vm.id, "describe failed during reconciliation: {}", e);
            if let Some(task) = task {
                if task.status == TaskStatus::Failed && task.retry_count < task.max_retries {
                    if retry_due(&task) {
                        let _ = state.tasks.rearm(&task.id).await;
                        let _ = state.tasks.fail(&task.id, &e.to_string()).await;
                    }
                    return;
                }
            }
            warn!(vm = %vm.id, "reconciliation retries exhausted; marking error");
            let _ = vms::set_status(state.db.pool(), &vm.id, VmStatus::Error).await;
            state.ws.vm_status(&vm.id, "error", Some("agent unreachable".into()));
            state.ws.notify(
                "error",
                "Reconciliation failed",
                &format!("virtual machine {} marked error: agent unreachable", vm.id),
            );
        }
    }
}

/// Exponential backoff: attempt n waits 2^n * base before the next try
fn retry_due(task: &tasks::Task) -> bool {
    let backoff = ChronoDuration::seconds(30 * (1i64 << task.retry_count.min(6)));
    Utc::now() - task.updated_at > backoff
}

async fn reconcile_volumes(state: &AppState) -> Result<()> {
    for status in [VolumeStatus::Creating, VolumeStatus::Deleting] {
        for volume in volumes::list_by_status(state.db.pool(), status).await? {
            if !is_stuck(volume.updated_at) {
                continue;
            }
            let _guard = state.volume_locks.lock(&volume.id).await;
            let Ok(current) = volumes::get(state.db.pool(), &volume.id).await else { continue };
            if current.status != status || !is_stuck(current.updated_at) {
                continue;
            }
            settle_stuck_volume(state, &current).await;
        }
    }
    Ok(())
}

async fn settle_stuck_volume(state: &AppState, volume: &volumes::Volume) {
    let Ok(pool) = pools::get(state.db.pool(), &volume.pool_id).await else {
        let _ = volumes::set_status(state.db.pool(), &volume.id, VolumeStatus::Error).await;
        return;
    };
    let Some(node_id) = pool.node_id.clone() else {
        let _ = volumes::set_status(state.db.pool(), &volume.id, VolumeStatus::Error).await;
        return;
    };
    let pool_spec = PoolSpec {
        pool_id: pool.id.clone(),
        name: pool.name.clone(),
        config: pool.config.clone(),
    };

    let describe = state
        .registry
        .call(
            &node_id,
            methods::VOLUME_DESCRIBE,
            serde_json::to_value(&DescribeVolumeRequest {
                volume_id: volume.id.clone(),
                pool: pool_spec,
            })
            .unwrap_or_default(),
            DEFAULT_CALL_TIMEOUT,
        )
        .await;

    let Ok(msg) = describe else {
        debug!(volume = %volume.id, "volume.describe failed; will retry next sweep");
        return;
    };
    let Some(desc) = msg
        .payload
        .and_then(|p| serde_json::from_value::<VolumeDescription>(p).ok())
    else {
        return;
    };

    match (volume.status, desc.exists) {
        (VolumeStatus::Creating, true) => {
            // Invariant: a volume in an inactive pool may not reach
            // `available` from `creating`.
            if pool.status != crate::db::pools::PoolStatus::Active {
                debug!(volume = %volume.id, "pool inactive; leaving volume in creating");
                return;
            }
            let path = desc.path.unwrap_or_default();
            let size = desc.size_gb.unwrap_or(volume.size_gb);
            let _ = volumes::finish_create(state.db.pool(), &volume.id, &path, size).await;
            info!(volume = %volume.id, "reconciled to available");
        }
        (VolumeStatus::Creating, false) => {
            let _ = volumes::set_status(state.db.pool(), &volume.id, VolumeStatus::Error).await;
            warn!(volume = %volume.id, "backing store never appeared; marked error");
        }
        (VolumeStatus::Deleting, false) => {
            if let Ok(mut conn) = state.db.pool().acquire().await {
                let _ = volumes::delete_tx(&mut conn, &volume.id).await;
                let _ = pools::recompute_allocation_tx(&mut conn, &volume.pool_id).await;
            }
            info!(volume = %volume.id, "reconciled delete");
        }
        (VolumeStatus::Deleting, true) => {
            let _ = volumes::set_status(state.db.pool(), &volume.id, VolumeStatus::Error).await;
            warn!(volume = %volume.id, "backing store still present; marked error");
        }
        _ => {}
    }
}

/// Snapshots have no describe RPC; stuck rows settle to error once their
/// task is terminally failed.
async fn reconcile_snapshots(state: &AppState) -> Result<()> {
    use crate::db::snapshots::SnapshotStatus;
    for status in [SnapshotStatus::Creating, SnapshotStatus::Deleting] {
        for snapshot in snapshots::list_by_status(state.db.pool(), status).await? {
            if !is_stuck(snapshot.updated_at) {
                continue;
            }
            let task = tasks::find_latest_for_target(state.db.pool(), "snapshot", &snapshot.id)
                .await?
                .filter(|t| t.status == TaskStatus::Failed && t.retry_count >= t.max_retries);
            if task.is_some() {
                warn!(snapshot = %snapshot.id, "snapshot stuck; marked error");
                snapshots::set_status(state.db.pool(), &snapshot.id, SnapshotStatus::Error).await?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tasks::tests::sample_task;

    #[test]
    fn test_retry_backoff_grows() {
        let mut task = sample_task("t1");
        task.status = TaskStatus::Failed;

        // Fresh failure: first retry not due yet.
        task.updated_at = Utc::now();
        assert!(!retry_due(&task));

        // After the base backoff it is.
        task.updated_at = Utc::now() - ChronoDuration::seconds(31);
        assert!(retry_due(&task));

        // Higher attempt counts need exponentially longer.
        task.retry_count = 2;
        assert!(!retry_due(&task));
        task.updated_at = Utc::now() - ChronoDuration::seconds(121);
        assert!(retry_due(&task));
    }

    #[test]
    fn test_stuck_cutoff() {
        assert!(!is_stuck(Utc::now()));
        assert!(is_stuck(Utc::now() - ChronoDuration::seconds(STUCK_AFTER_SECS + 1)));
    }
}
