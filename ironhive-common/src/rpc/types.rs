//! Typed payloads for the RPC method catalogue

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Registration and heartbeat
// ---------------------------------------------------------------------------

/// First frame after connect, agent -> controller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub node_id: String,
    pub hostname: String,
    pub ip_address: String,
    /// Shared-secret agent token, checked before the session is accepted
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub accepted: bool,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatNotice {
    pub node_id: String,
    pub timestamp: i64,
    pub status: String,
}

/// Pushed once after registration, then whenever inventory changes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInventory {
    pub node_id: String,
    pub cpu_cores: u32,
    pub cpu_threads: u32,
    pub memory_total_bytes: u64,
    pub disk_total_bytes: u64,
    pub hypervisor_type: Option<String>,
    pub hypervisor_version: Option<String>,
}

// ---------------------------------------------------------------------------
// Virtual machines
// ---------------------------------------------------------------------------

/// Disk attachment as the hypervisor sees it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskAttachment {
    pub volume_id: String,
    /// Resolved path on the node (file path, /dev/vg/lv, or rbd:pool/image)
    pub path: String,
    /// Guest device name, e.g. "vda"
    pub device: String,
    /// Image format: "qcow2" or "raw"
    pub format: String,
    pub bootable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NicSpec {
    pub network_id: String,
    pub mac_address: String,
    pub ip_address: Option<String>,
    /// NIC model, e.g. "virtio"
    pub model: String,
    /// Bridge the tap plugs into, e.g. "br-vlan100"
    pub bridge: String,
}

/// Everything the agent needs to define and boot a domain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmSpec {
    pub vm_id: String,
    pub name: String,
    pub vcpu: u32,
    pub memory_mb: u64,
    pub os_type: String,
    pub disks: Vec<DiskAttachment>,
    pub nics: Vec<NicSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefineAndStartRequest {
    pub task_id: String,
    pub spec: VmSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefineAndStartResponse {
    pub uuid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopVmRequest {
    pub task_id: String,
    pub vm_id: String,
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestartVmRequest {
    pub task_id: String,
    pub vm_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachDiskRequest {
    pub task_id: String,
    pub vm_id: String,
    pub disk: DiskAttachment,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetachDiskRequest {
    pub task_id: String,
    pub vm_id: String,
    pub volume_id: String,
    pub device: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DescribeVmRequest {
    pub vm_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DescribeVmResponse {
    pub vm_id: String,
    /// Hypervisor-reported state: "running", "shut off", "paused", "absent"
    pub state: String,
    pub uuid: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrateVmRequest {
    pub task_id: String,
    pub vm_id: String,
    pub target_node_id: String,
    /// Address the source hypervisor dials, e.g. "10.0.0.12"
    pub target_address: String,
}

/// Stream payload emitted while a migration runs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrateProgress {
    pub task_id: String,
    pub stage: String,
    pub progress_percent: u8,
    #[serde(default)]
    pub completed: bool,
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

/// Backend-specific pool configuration, tagged by pool type
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PoolConfig {
    Nfs {
        server: String,
        export: String,
        mount_point: String,
    },
    Lvm {
        volume_group: String,
    },
    Ceph {
        pool: String,
        monitors: Vec<String>,
        user: String,
    },
    Iscsi {
        portal: String,
        target: String,
        mount_point: String,
    },
}

impl PoolConfig {
    pub fn pool_type(&self) -> &'static str {
        match self {
            PoolConfig::Nfs { .. } => "nfs",
            PoolConfig::Lvm { .. } => "lvm",
            PoolConfig::Ceph { .. } => "ceph",
            PoolConfig::Iscsi { .. } => "iscsi",
        }
    }
}

/// Pool identity shipped with every storage RPC so the agent needs no
/// controller round trip
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSpec {
    pub pool_id: String,
    pub name: String,
    pub config: PoolConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateVolumeRequest {
    pub task_id: String,
    pub volume_id: String,
    pub name: String,
    pub size_gb: u64,
    /// Image format: "qcow2" or "raw"
    pub format: String,
    pub pool: PoolSpec,
    /// Optional URL to fetch initial contents from before the volume is
    /// reported ready
    pub source: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateVolumeResponse {
    pub path: String,
    pub size_gb: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteVolumeRequest {
    pub task_id: String,
    pub volume_id: String,
    pub pool: PoolSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResizeVolumeRequest {
    pub task_id: String,
    pub volume_id: String,
    pub pool: PoolSpec,
    pub new_size_gb: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloneVolumeRequest {
    pub task_id: String,
    pub source_volume_id: String,
    pub clone_volume_id: String,
    pub pool: PoolSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DescribeVolumeRequest {
    pub volume_id: String,
    pub pool: PoolSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeDescription {
    pub volume_id: String,
    pub exists: bool,
    pub path: Option<String>,
    pub size_gb: Option<u64>,
    pub format: Option<String>,
}

// ---------------------------------------------------------------------------
// Snapshots
// ---------------------------------------------------------------------------

/// How a snapshot is captured
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotMode {
    /// Through the hypervisor domain API while the VM runs
    Live,
    /// Through the image tool while the volume is detached
    Offline,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSnapshotRequest {
    pub task_id: String,
    pub snapshot_id: String,
    pub volume_id: String,
    /// Set when mode is live: the domain holding the volume
    pub vm_id: Option<String>,
    pub pool: PoolSpec,
    pub name: String,
    pub mode: SnapshotMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSnapshotResponse {
    /// On-disk snapshot tag
    pub tag: String,
    pub size_gb: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteSnapshotRequest {
    pub task_id: String,
    pub volume_id: String,
    pub vm_id: Option<String>,
    pub pool: PoolSpec,
    pub tag: String,
    pub mode: SnapshotMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreSnapshotRequest {
    pub task_id: String,
    pub volume_id: String,
    pub pool: PoolSpec,
    pub tag: String,
}

// ---------------------------------------------------------------------------
// Networks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSpec {
    pub network_id: String,
    pub name: String,
    /// Bridge name by convention: `br-vlan<id>` or `br-default`
    pub bridge: String,
    pub vlan_id: Option<u16>,
    pub mtu: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnsureNetworkRequest {
    pub network: NetworkSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachTapRequest {
    pub vm_id: String,
    pub network: NetworkSpec,
    pub nic: NicSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetachTapRequest {
    pub vm_id: String,
    pub mac_address: String,
}

// ---------------------------------------------------------------------------
// Generic
// ---------------------------------------------------------------------------

/// Response for methods with nothing more to say than "done"
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ack {
    pub ok: bool,
}

impl Ack {
    pub fn ok() -> serde_json::Value {
        serde_json::json!({ "ok": true })
    }
}

/// Payload of an `rpc.cancel` notification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelNotice {
    pub id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_config_tagging() {
        let cfg = PoolConfig::Nfs {
            server: "10.0.0.5".into(),
            export: "/export/vms".into(),
            mount_point: "/mnt/ironhive/nfs0".into(),
        };
        let json = serde_json::to_value(&cfg).unwrap();
        assert_eq!(json["type"], "nfs");
        assert_eq!(json["server"], "10.0.0.5");

        let parsed: PoolConfig = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, cfg);
        assert_eq!(parsed.pool_type(), "nfs");
    }

    #[test]
    fn test_snapshot_mode_wire_names() {
        assert_eq!(
            serde_json::to_string(&SnapshotMode::Live).unwrap(),
            "\"live\""
        );
        assert_eq!(
            serde_json::to_string(&SnapshotMode::Offline).unwrap(),
            "\"offline\""
        );
    }

    #[test]
    fn test_vm_spec_round_trip() {
        let spec = VmSpec {
            vm_id: "vm-1".into(),
            name: "web01".into(),
            vcpu: 2,
            memory_mb: 2048,
            os_type: "linux".into(),
            disks: vec![DiskAttachment {
                volume_id: "vol-1".into(),
                path: "/mnt/pool/vol-1.qcow2".into(),
                device: "vda".into(),
                format: "qcow2".into(),
                bootable: true,
            }],
            nics: vec![NicSpec {
                network_id: "net-1".into(),
                mac_address: "52:54:00:aa:bb:cc".into(),
                ip_address: Some("10.0.1.10".into()),
                model: "virtio".into(),
                bridge: "br-vlan100".into(),
            }],
        };
        let json = serde_json::to_string(&spec).unwrap();
        let parsed: VmSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.vm_id, spec.vm_id);
        assert_eq!(parsed.disks.len(), 1);
        assert_eq!(parsed.nics[0].bridge, "br-vlan100");
    }
}
