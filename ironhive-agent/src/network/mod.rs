//! Bridge and VLAN management
//!
//! Bridges are materialized lazily, the first time a VM on this node
//! needs them, and every operation is an "ensure": re-invocation
//! converges instead of failing on existing interfaces.
//!
//! Two modes, keyed by the network's VLAN id:
//!   - tagged: a `<provider>.<vlan>` sub-interface enslaved to `br-vlan<vlan>`
//!   - untagged: the provider NIC enslaved to `br-default`

use ironhive_common::rpc::types::NetworkSpec;
use ironhive_common::{Error, Result};
use tokio::process::Command;
use tracing::{debug, info};

pub struct NetworkManager {
    provider_iface: String,
}

impl NetworkManager {
    pub fn new(provider_iface: &str) -> Self {
        Self {
            provider_iface: provider_iface.to_string(),
        }
    }

    async fn ip(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("ip")
            .args(args)
            .output()
            .await
            .map_err(|e| Error::Network(format!("failed to run ip: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Network(format!(
                "ip {} failed: {}",
                args.join(" "),
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// `ip` invocation where "already exists" means convergence
    async fn ip_tolerant(&self, args: &[&str]) -> Result<()> {
        match self.ip(args).await {
            Ok(_) => Ok(()),
            Err(Error::Network(msg)) if msg.contains("File exists") => {
                debug!("already converged: ip {}", args.join(" "));
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn link_exists(&self, name: &str) -> bool {
        self.ip(&["link", "show", name]).await.is_ok()
    }

    /// Materialize the layer-2 plumbing for a network; idempotent
    pub async fn ensure_network(&self, network: &NetworkSpec) -> Result<()> {
        match network.vlan_id {
            Some(vlan) => self.ensure_vlan_bridge(&network.bridge, vlan, network.mtu).await,
            None => self.ensure_flat_bridge(&network.bridge, network.mtu).await,
        }
    }

    async fn ensure_bridge(&self, bridge: &str, mtu: u32) -> Result<()> {
        self.ip_tolerant(&["link", "add", "name", bridge, "type", "bridge"])
            .await?;
        self.ip(&["link", "set", "dev", bridge, "mtu", &mtu.to_string()])
            .await?;
        self.ip(&["link", "set", "dev", bridge, "up"]).await?;
        Ok(())
    }

    async fn ensure_vlan_bridge(&self, bridge: &str, vlan: u16, mtu: u32) -> Result<()> {
        let vlan_iface = format!("{}.{}", self.provider_iface, vlan);

        if !self.link_exists(&vlan_iface).await {
            self.ip_tolerant(&[
                "link", "add", "link", &self.provider_iface, "name", &vlan_iface, "type",
                "vlan", "id", &vlan.to_string(),
            ])
            .await?;
        }

        self.ensure_bridge(bridge, mtu).await?;
        self.ip_tolerant(&["link", "set", "dev", &vlan_iface, "master", bridge])
            .await?;
        self.ip(&["link", "set", "dev", &vlan_iface, "up"]).await?;

        info!(bridge, vlan, "vlan network ensured");
        Ok(())
    }

    async fn ensure_flat_bridge(&self, bridge: &str, mtu: u32) -> Result<()> {
        self.ensure_bridge(bridge, mtu).await?;
        self.ip_tolerant(&[
            "link", "set", "dev", &self.provider_iface, "master", bridge,
        ])
        .await?;
        self.ip(&["link", "set", "dev", &self.provider_iface, "up"])
            .await?;
        info!(bridge, "flat network ensured");
        Ok(())
    }

    /// Ensure the bridge exists before a VM's tap plugs into it. The tap
    /// itself is created by the hypervisor at domain start.
    pub async fn attach_tap(&self, network: &NetworkSpec) -> Result<()> {
        self.ensure_network(network).await
    }

    /// Best-effort cleanup after a VM's NIC goes away. The bridge stays;
    /// tearing it down while other VMs use it would cut them off.
    pub async fn detach_tap(&self, mac_address: &str) -> Result<()> {
        debug!(mac = mac_address, "tap detach requested; nothing to tear down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vlan_iface_naming() {
        let manager = NetworkManager::new("eth0");
        // The sub-interface name is derived the same way ensure does it.
        assert_eq!(format!("{}.{}", manager.provider_iface, 100), "eth0.100");
    }
}
