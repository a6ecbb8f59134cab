//! Schema creation
//!
//! Plain `CREATE TABLE IF NOT EXISTS` statements run at startup; SQLite is
//! the only supported backend so there is no migration ladder yet.

use ironhive_common::Result;
use sqlx::SqlitePool;

use super::db_err;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS nodes (
        id TEXT PRIMARY KEY,
        hostname TEXT NOT NULL,
        ip_address TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'offline',
        hypervisor_type TEXT,
        hypervisor_version TEXT,
        cpu_cores INTEGER NOT NULL DEFAULT 0,
        cpu_threads INTEGER NOT NULL DEFAULT 0,
        memory_total_bytes INTEGER NOT NULL DEFAULT 0,
        disk_total_bytes INTEGER NOT NULL DEFAULT 0,
        metadata TEXT,
        last_heartbeat TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS vms (
        id TEXT PRIMARY KEY,
        uuid TEXT,
        name TEXT NOT NULL,
        node_id TEXT,
        status TEXT NOT NULL DEFAULT 'stopped',
        vcpu INTEGER NOT NULL,
        memory_mb INTEGER NOT NULL,
        os_type TEXT NOT NULL DEFAULT 'linux',
        disks TEXT,
        network_interfaces TEXT,
        metadata TEXT,
        started_at TEXT,
        stopped_at TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_vms_node ON vms(node_id)",
    "CREATE INDEX IF NOT EXISTS idx_vms_status ON vms(status)",
    "CREATE TABLE IF NOT EXISTS storage_pools (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL UNIQUE,
        pool_type TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'active',
        config TEXT NOT NULL,
        capacity_gb INTEGER NOT NULL DEFAULT 0,
        allocated_gb INTEGER NOT NULL DEFAULT 0,
        node_id TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS volumes (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        volume_type TEXT NOT NULL,
        size_gb INTEGER NOT NULL,
        pool_id TEXT NOT NULL,
        path TEXT,
        status TEXT NOT NULL DEFAULT 'creating',
        vm_id TEXT,
        metadata TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_volumes_pool ON volumes(pool_id)",
    "CREATE INDEX IF NOT EXISTS idx_volumes_vm ON volumes(vm_id)",
    "CREATE TABLE IF NOT EXISTS snapshots (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        volume_id TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'creating',
        size_gb INTEGER,
        snapshot_tag TEXT NOT NULL DEFAULT '',
        description TEXT,
        metadata TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_snapshots_volume ON snapshots(volume_id)",
    "CREATE TABLE IF NOT EXISTS networks (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        network_type TEXT NOT NULL DEFAULT 'bridge',
        cidr TEXT NOT NULL,
        gateway TEXT,
        mtu INTEGER NOT NULL DEFAULT 1500,
        vlan_id INTEGER,
        node_id TEXT,
        status TEXT NOT NULL DEFAULT 'active',
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS ip_allocations (
        id TEXT PRIMARY KEY,
        network_id TEXT NOT NULL,
        ip_address TEXT NOT NULL,
        ip_numeric INTEGER NOT NULL,
        mac_address TEXT,
        vm_id TEXT,
        status TEXT NOT NULL DEFAULT 'available',
        allocated_at TEXT,
        created_at TEXT NOT NULL,
        UNIQUE(network_id, ip_address)
    )",
    "CREATE INDEX IF NOT EXISTS idx_ips_network_status ON ip_allocations(network_id, status)",
    "CREATE INDEX IF NOT EXISTS idx_ips_vm ON ip_allocations(vm_id)",
    "CREATE TABLE IF NOT EXISTS tasks (
        id TEXT PRIMARY KEY,
        task_type TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        progress INTEGER NOT NULL DEFAULT 0,
        payload TEXT,
        result TEXT,
        error TEXT,
        target_type TEXT NOT NULL,
        target_id TEXT NOT NULL,
        node_id TEXT,
        retry_count INTEGER NOT NULL DEFAULT 0,
        max_retries INTEGER NOT NULL DEFAULT 3,
        created_by TEXT NOT NULL DEFAULT '',
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        completed_at TEXT
    )",
    "CREATE INDEX IF NOT EXISTS idx_tasks_target ON tasks(target_type, target_id)",
    "CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status)",
    "CREATE TABLE IF NOT EXISTS users (
        id TEXT PRIMARY KEY,
        username TEXT NOT NULL UNIQUE,
        password_hash TEXT NOT NULL,
        salt TEXT NOT NULL,
        role TEXT NOT NULL DEFAULT 'viewer',
        enabled INTEGER NOT NULL DEFAULT 1,
        created_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS audit_log (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        username TEXT NOT NULL,
        action TEXT NOT NULL,
        target_type TEXT NOT NULL,
        target_id TEXT NOT NULL,
        details TEXT,
        created_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_audit_created ON audit_log(created_at)",
];

/// Apply the schema
pub async fn run(pool: &SqlitePool) -> Result<()> {
    for statement in SCHEMA {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|e| db_err("migration failed", e))?;
    }
    Ok(())
}
