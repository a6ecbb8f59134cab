//! Node inventory

use ironhive_common::rpc::types::NodeInventory;
use sysinfo::{Disks, System};

/// Collect the host's resource totals and hypervisor identity
pub fn collect_inventory(node_id: &str) -> NodeInventory {
    let mut sys = System::new_all();
    sys.refresh_all();

    let disks = Disks::new_with_refreshed_list();
    let disk_total: u64 = disks.list().iter().map(|d| d.total_space()).sum();

    NodeInventory {
        node_id: node_id.to_string(),
        cpu_cores: sys.physical_core_count().unwrap_or(sys.cpus().len()) as u32,
        cpu_threads: sys.cpus().len() as u32,
        memory_total_bytes: sys.total_memory(),
        disk_total_bytes: disk_total,
        hypervisor_type: Some(detect_hypervisor_type()),
        hypervisor_version: detect_hypervisor_version(),
    }
}

fn detect_hypervisor_type() -> String {
    if std::path::Path::new("/dev/kvm").exists() {
        "kvm".to_string()
    } else {
        "qemu".to_string()
    }
}

fn detect_hypervisor_version() -> Option<String> {
    std::process::Command::new("virsh")
        .arg("--version")
        .output()
        .ok()
        .filter(|o| o.status.success())
        .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inventory_has_host_totals() {
        let inv = collect_inventory("n1");
        assert_eq!(inv.node_id, "n1");
        assert!(inv.cpu_threads > 0);
        assert!(inv.memory_total_bytes > 0);
        assert!(inv.hypervisor_type.is_some());
    }
}
