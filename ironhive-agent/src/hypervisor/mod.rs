//! Hypervisor driver
//!
//! Drives QEMU/KVM through virsh. Domains are named by VM id and always
//! defined from controller-supplied state: stop undefines the domain so
//! the next start picks up configuration changes made while it was down.

use ironhive_common::rpc::types::{DescribeVmResponse, VmSpec};
use ironhive_common::{Error, Result};
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// How long a graceful shutdown may take before we destroy
const GRACEFUL_SHUTDOWN_SECS: u64 = 30;

pub struct HypervisorManager {
    domains_dir: PathBuf,
}

impl HypervisorManager {
    pub fn new(domains_dir: impl Into<PathBuf>) -> Self {
        Self {
            domains_dir: domains_dir.into(),
        }
    }

    async fn virsh(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("virsh")
            .args(args)
            .output()
            .await
            .map_err(|e| Error::Hypervisor(format!("failed to run virsh: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Hypervisor(format!(
                "virsh {} failed: {}",
                args.first().unwrap_or(&""),
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Define the domain from the supplied spec and boot it. Redefines an
    /// existing domain so controller-side changes always win.
    pub async fn define_and_start(&self, spec: &VmSpec) -> Result<String> {
        tokio::fs::create_dir_all(&self.domains_dir)
            .await
            .map_err(|e| Error::Hypervisor(format!("failed to create domains dir: {}", e)))?;

        let xml = build_domain_xml(spec);
        let xml_path = self.domains_dir.join(format!("{}.xml", spec.vm_id));
        tokio::fs::write(&xml_path, &xml)
            .await
            .map_err(|e| Error::Hypervisor(format!("failed to write domain xml: {}", e)))?;

        self.virsh(&["define", &xml_path.to_string_lossy()]).await?;
        self.virsh(&["start", &spec.vm_id]).await?;

        let uuid = self.virsh(&["domuuid", &spec.vm_id]).await?;
        info!(vm = %spec.vm_id, uuid = %uuid, "domain defined and started");
        Ok(uuid)
    }

    /// Stop a domain: graceful shutdown with destroy fallback, then
    /// undefine so the next start redefines from controller state.
    pub async fn stop(&self, vm_id: &str, force: bool) -> Result<()> {
        let state = self.domain_state(vm_id).await?;
        if state == "absent" {
            debug!(vm = vm_id, "domain already absent");
            return Ok(());
        }

        if state == "running" || state == "paused" {
            if force {
                self.virsh(&["destroy", vm_id]).await?;
            } else {
                self.virsh(&["shutdown", vm_id]).await?;
                if !self.wait_for_shutoff(vm_id, GRACEFUL_SHUTDOWN_SECS).await? {
                    warn!(vm = vm_id, "graceful shutdown timed out, destroying");
                    self.virsh(&["destroy", vm_id]).await?;
                }
            }
        }

        self.undefine(vm_id).await?;
        info!(vm = vm_id, "domain stopped and undefined");
        Ok(())
    }

    /// Graceful-then-forced reboot that keeps the domain defined
    pub async fn restart(&self, vm_id: &str) -> Result<()> {
        self.virsh(&["shutdown", vm_id]).await?;
        if !self.wait_for_shutoff(vm_id, GRACEFUL_SHUTDOWN_SECS).await? {
            warn!(vm = vm_id, "graceful shutdown timed out, destroying");
            self.virsh(&["destroy", vm_id]).await?;
        }
        self.virsh(&["start", vm_id]).await?;
        info!(vm = vm_id, "domain restarted");
        Ok(())
    }

    pub async fn attach_disk(
        &self,
        vm_id: &str,
        path: &str,
        device: &str,
        format: &str,
    ) -> Result<()> {
        self.virsh(&[
            "attach-disk",
            vm_id,
            path,
            device,
            "--driver",
            "qemu",
            "--subdriver",
            format,
            "--persistent",
            "--live",
        ])
        .await?;
        info!(vm = vm_id, device, "disk attached");
        Ok(())
    }

    pub async fn detach_disk(&self, vm_id: &str, device: &str) -> Result<()> {
        self.virsh(&["detach-disk", vm_id, device, "--persistent", "--live"])
            .await?;
        info!(vm = vm_id, device, "disk detached");
        Ok(())
    }

    /// Current domain state as the controller's reconciliation sees it
    pub async fn describe(&self, vm_id: &str) -> Result<DescribeVmResponse> {
        let state = self.domain_state(vm_id).await?;
        let uuid = if state == "absent" {
            None
        } else {
            self.virsh(&["domuuid", vm_id]).await.ok()
        };
        Ok(DescribeVmResponse {
            vm_id: vm_id.to_string(),
            state,
            uuid,
        })
    }

    /// Live-migrate a domain to a peer hypervisor
    pub async fn migrate(&self, vm_id: &str, target_address: &str) -> Result<()> {
        let uri = format!("qemu+tcp://{}/system", target_address);
        self.virsh(&[
            "migrate",
            "--live",
            "--persistent",
            "--undefinesource",
            vm_id,
            &uri,
        ])
        .await?;
        info!(vm = vm_id, target = target_address, "domain migrated");
        Ok(())
    }

    /// Live snapshot through the domain API
    pub async fn snapshot_create(&self, vm_id: &str, tag: &str) -> Result<()> {
        self.virsh(&["snapshot-create-as", vm_id, tag, "--atomic"]).await?;
        Ok(())
    }

    pub async fn snapshot_delete(&self, vm_id: &str, tag: &str) -> Result<()> {
        self.virsh(&["snapshot-delete", vm_id, tag]).await?;
        Ok(())
    }

    async fn undefine(&self, vm_id: &str) -> Result<()> {
        match self.virsh(&["undefine", vm_id]).await {
            Ok(_) => Ok(()),
            // Already undefined is success for our purposes.
            Err(Error::Hypervisor(msg)) if msg.contains("failed to get domain") => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// "running", "paused", "shut off", or "absent"
    pub async fn domain_state(&self, vm_id: &str) -> Result<String> {
        match self.virsh(&["domstate", vm_id]).await {
            Ok(state) => Ok(state),
            Err(Error::Hypervisor(msg)) if msg.contains("failed to get domain") => {
                Ok("absent".to_string())
            }
            Err(e) => Err(e),
        }
    }

    async fn wait_for_shutoff(&self, vm_id: &str, timeout_secs: u64) -> Result<bool> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout_secs);
        while tokio::time::Instant::now() < deadline {
            let state = self.domain_state(vm_id).await?;
            if state == "shut off" || state == "absent" {
                return Ok(true);
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        Ok(false)
    }
}

/// Render the libvirt domain XML for a spec
pub fn build_domain_xml(spec: &VmSpec) -> String {
    let mut disks = String::new();
    for disk in &spec.disks {
        let (disk_type, source) = if disk.path.starts_with("rbd:") {
            // rbd:pool/image -> network disk
            let image = disk.path.trim_start_matches("rbd:");
            (
                "network",
                format!("<source protocol='rbd' name='{}'/>", image),
            )
        } else if disk.path.starts_with("/dev/") {
            ("block", format!("<source dev='{}'/>", disk.path))
        } else {
            ("file", format!("<source file='{}'/>", disk.path))
        };
        disks.push_str(&format!(
            r#"    <disk type='{disk_type}' device='disk'>
      <driver name='qemu' type='{format}'/>
      {source}
      <target dev='{device}' bus='virtio'/>
{boot}    </disk>
"#,
            disk_type = disk_type,
            format = disk.format,
            source = source,
            device = disk.device,
            boot = if disk.bootable {
                "      <boot order='1'/>\n"
            } else {
                ""
            },
        ));
    }

    let mut interfaces = String::new();
    for nic in &spec.nics {
        interfaces.push_str(&format!(
            r#"    <interface type='bridge'>
      <mac address='{mac}'/>
      <source bridge='{bridge}'/>
      <model type='{model}'/>
    </interface>
"#,
            mac = nic.mac_address,
            bridge = nic.bridge,
            model = nic.model,
        ));
    }

    format!(
        r#"<domain type='kvm'>
  <name>{name}</name>
  <memory unit='MiB'>{memory}</memory>
  <vcpu>{vcpu}</vcpu>
  <os>
    <type arch='x86_64' machine='q35'>hvm</type>
  </os>
  <features>
    <acpi/>
    <apic/>
  </features>
  <cpu mode='host-passthrough'/>
  <devices>
    <emulator>/usr/bin/qemu-system-x86_64</emulator>
{disks}{interfaces}    <serial type='pty'/>
    <console type='pty'/>
    <graphics type='vnc' port='-1' autoport='yes' listen='0.0.0.0'/>
  </devices>
</domain>
"#,
        name = spec.vm_id,
        memory = spec.memory_mb,
        vcpu = spec.vcpu,
        disks = disks,
        interfaces = interfaces,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use ironhive_common::rpc::types::{DiskAttachment, NicSpec};

    fn sample_spec() -> VmSpec {
        VmSpec {
            vm_id: "vm-1".into(),
            name: "web01".into(),
            vcpu: 2,
            memory_mb: 2048,
            os_type: "linux".into(),
            disks: vec![
                DiskAttachment {
                    volume_id: "vol-1".into(),
                    path: "/mnt/ironhive/nfs0/vol-1.qcow2".into(),
                    device: "vda".into(),
                    format: "qcow2".into(),
                    bootable: true,
                },
                DiskAttachment {
                    volume_id: "vol-2".into(),
                    path: "/dev/vg0/vol-2".into(),
                    device: "vdb".into(),
                    format: "raw".into(),
                    bootable: false,
                },
            ],
            nics: vec![NicSpec {
                network_id: "net-1".into(),
                mac_address: "52:54:00:aa:bb:cc".into(),
                ip_address: None,
                model: "virtio".into(),
                bridge: "br-vlan100".into(),
            }],
        }
    }

    #[test]
    fn test_domain_xml_structure() {
        let xml = build_domain_xml(&sample_spec());
        assert!(xml.contains("<name>vm-1</name>"));
        assert!(xml.contains("<memory unit='MiB'>2048</memory>"));
        assert!(xml.contains("<vcpu>2</vcpu>"));
        assert!(xml.contains("<source file='/mnt/ironhive/nfs0/vol-1.qcow2'/>"));
        assert!(xml.contains("<source dev='/dev/vg0/vol-2'/>"));
        assert!(xml.contains("<boot order='1'/>"));
        assert!(xml.contains("<source bridge='br-vlan100'/>"));
        assert!(xml.contains("<mac address='52:54:00:aa:bb:cc'/>"));
    }

    #[test]
    fn test_domain_xml_rbd_disk() {
        let mut spec = sample_spec();
        spec.disks[0].path = "rbd:vms/vol-1".into();
        let xml = build_domain_xml(&spec);
        assert!(xml.contains("<source protocol='rbd' name='vms/vol-1'/>"));
    }

    #[test]
    fn test_boot_order_only_on_bootable() {
        let xml = build_domain_xml(&sample_spec());
        assert_eq!(xml.matches("<boot order='1'/>").count(), 1);
    }
}
