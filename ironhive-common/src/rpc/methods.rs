//! Method names of the controller/agent RPC surface
//!
//! Names are stable across implementations; the agent registers handlers
//! under these exact strings.

// Agent -> controller
pub const NODE_REGISTER: &str = "node.register";
pub const HEARTBEAT: &str = "heartbeat";
pub const NODE_INVENTORY: &str = "node.inventory";

// Controller -> agent: virtual machines
pub const VM_DEFINE_AND_START: &str = "vm.define_and_start";
pub const VM_STOP: &str = "vm.stop";
pub const VM_RESTART: &str = "vm.restart";
pub const VM_ATTACH_DISK: &str = "vm.attach_disk";
pub const VM_DETACH_DISK: &str = "vm.detach_disk";
pub const VM_DESCRIBE: &str = "vm.describe";
pub const VM_MIGRATE: &str = "vm.migrate";

// Controller -> agent: volumes
pub const VOLUME_CREATE: &str = "volume.create";
pub const VOLUME_DELETE: &str = "volume.delete";
pub const VOLUME_RESIZE: &str = "volume.resize";
pub const VOLUME_CLONE: &str = "volume.clone";
pub const VOLUME_DESCRIBE: &str = "volume.describe";

// Controller -> agent: snapshots
pub const SNAPSHOT_CREATE: &str = "snapshot.create";
pub const SNAPSHOT_DELETE: &str = "snapshot.delete";
pub const SNAPSHOT_RESTORE: &str = "snapshot.restore";

// Controller -> agent: networks
pub const NETWORK_ENSURE: &str = "network.ensure";
pub const NETWORK_ATTACH_TAP: &str = "network.attach_tap";
pub const NETWORK_DETACH_TAP: &str = "network.detach_tap";

// Either direction
pub const RPC_CANCEL: &str = "rpc.cancel";
