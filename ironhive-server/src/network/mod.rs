//! Network lifecycle and IP address management
//!
//! A network's address pool is fully materialized at create time: one row
//! per usable host address, excluding the network, broadcast, and gateway
//! addresses. Allocation takes a per-network lock around its transaction
//! so two concurrent requests can never claim the same row.

use chrono::Utc;
use ironhive_common::{Error, Result};
use std::net::Ipv4Addr;
use tracing::info;
use uuid::Uuid;

use crate::db::ips::{self, IpAllocation};
use crate::db::networks::{self, Network};
use crate::db::db_err;
use crate::state::AppState;

/// Largest network accepted: a /16 materializes 65 534 rows, which is the
/// most the pre-allocation strategy should ever write in one transaction.
const MIN_PREFIX_LEN: u8 = 16;
/// Smallest usable network: a /30 leaves two host addresses.
const MAX_PREFIX_LEN: u8 = 30;

pub struct NetworkManager {
    state: AppState,
}

#[derive(Debug, serde::Deserialize)]
pub struct CreateNetworkRequest {
    pub name: String,
    #[serde(default = "default_network_type")]
    pub network_type: String,
    pub cidr: String,
    pub gateway: Option<String>,
    pub mtu: Option<u32>,
    pub vlan_id: Option<u16>,
    pub node_id: Option<String>,
}

fn default_network_type() -> String {
    "bridge".to_string()
}

impl NetworkManager {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// Create a network and pre-materialize its address pool in one
    /// transaction. No agent call: bridges are materialized lazily when a
    /// VM on that node first attaches.
    pub async fn create(&self, req: CreateNetworkRequest, actor: &str) -> Result<Network> {
        let (base, prefix_len) = parse_cidr(&req.cidr)?;

        if req.network_type != "bridge" && req.network_type != "ovs" {
            return Err(Error::Validation(format!(
                "unsupported network type: {}",
                req.network_type
            )));
        }
        if let Some(vlan) = req.vlan_id {
            if vlan == 0 || vlan > 4094 {
                return Err(Error::Validation(format!(
                    "vlan id {} outside 1-4094",
                    vlan
                )));
            }
        }

        let gateway = match req.gateway.as_deref() {
            Some(raw) => {
                let addr: Ipv4Addr = raw
                    .parse()
                    .map_err(|_| Error::Validation(format!("invalid gateway: {}", raw)))?;
                if !cidr_contains(base, prefix_len, addr) {
                    return Err(Error::Validation(format!(
                        "gateway {} is outside {}",
                        raw, req.cidr
                    )));
                }
                Some(addr)
            }
            None => None,
        };

        let addresses = enumerate_hosts(base, prefix_len, gateway);
        let now = Utc::now();
        let network = Network {
            id: Uuid::new_v4().to_string(),
            name: req.name,
            network_type: req.network_type,
            cidr: req.cidr,
            gateway: gateway.map(|g| g.to_string()),
            mtu: req.mtu.unwrap_or(1500),
            vlan_id: req.vlan_id,
            node_id: req.node_id,
            status: "active".to_string(),
            created_at: now,
            updated_at: now,
        };

        let mut tx = self
            .state
            .db
            .pool()
            .begin()
            .await
            .map_err(|e| db_err("failed to begin transaction", e))?;
        networks::insert_tx(&mut tx, &network).await?;
        ips::materialize_tx(&mut tx, &network.id, &addresses).await?;
        tx.commit()
            .await
            .map_err(|e| db_err("failed to commit network", e))?;

        info!(
            network = %network.id,
            addresses = addresses.len(),
            "network created with pre-materialized address pool"
        );
        self.state
            .audit
            .record(actor, "network.create", "network", &network.id, None)
            .await;
        Ok(network)
    }

    pub async fn get(&self, id: &str) -> Result<Network> {
        networks::get(self.state.db.pool(), id).await
    }

    pub async fn list(&self, page: usize, page_size: usize) -> Result<(Vec<Network>, usize)> {
        networks::list(self.state.db.pool(), page, page_size).await
    }

    /// Update is limited to `name` once the network exists; CIDR, VLAN,
    /// and gateway are immutable because address rows derive from them.
    pub async fn rename(&self, id: &str, name: &str, actor: &str) -> Result<Network> {
        networks::rename(self.state.db.pool(), id, name).await?;
        self.state
            .audit
            .record(actor, "network.rename", "network", id, None)
            .await;
        networks::get(self.state.db.pool(), id).await
    }

    /// Delete is rejected while any address is held
    pub async fn delete(&self, id: &str, actor: &str) -> Result<()> {
        networks::get(self.state.db.pool(), id).await?;

        let _guard = self.state.network_locks.lock(id).await;
        let held = ips::count_held(self.state.db.pool(), id).await?;
        if held > 0 {
            return Err(Error::Precondition(format!(
                "network has {} allocated or reserved addresses",
                held
            )));
        }

        let mut tx = self
            .state
            .db
            .pool()
            .begin()
            .await
            .map_err(|e| db_err("failed to begin transaction", e))?;
        networks::delete_tx(&mut tx, id).await?;
        tx.commit()
            .await
            .map_err(|e| db_err("failed to commit network delete", e))?;

        self.state.network_locks.forget(id).await;
        self.state
            .audit
            .record(actor, "network.delete", "network", id, None)
            .await;
        info!(network = id, "network deleted");
        Ok(())
    }

    /// Atomically claim one available address
    pub async fn allocate_ip(&self, network_id: &str) -> Result<IpAllocation> {
        networks::get(self.state.db.pool(), network_id).await?;

        let _guard = self.state.network_locks.lock(network_id).await;
        let mut tx = self
            .state
            .db
            .pool()
            .begin()
            .await
            .map_err(|e| db_err("failed to begin transaction", e))?;
        let allocation = ips::claim_next_tx(&mut tx, network_id).await?;
        tx.commit()
            .await
            .map_err(|e| db_err("failed to commit allocation", e))?;
        Ok(allocation)
    }

    /// Link an allocation to a VM; idempotent
    pub async fn associate_ip(
        &self,
        allocation_id: &str,
        vm_id: &str,
        mac_address: Option<&str>,
    ) -> Result<()> {
        let mut conn = self
            .state
            .db
            .pool()
            .acquire()
            .await
            .map_err(|e| db_err("failed to acquire connection", e))?;
        ips::associate_tx(&mut conn, allocation_id, vm_id, mac_address).await
    }

    /// Return every address a VM holds in a network
    pub async fn release_vm_ips(&self, network_id: &str, vm_id: &str) -> Result<usize> {
        let _guard = self.state.network_locks.lock(network_id).await;
        let mut conn = self
            .state
            .db
            .pool()
            .acquire()
            .await
            .map_err(|e| db_err("failed to acquire connection", e))?;
        ips::release_for_vm_tx(&mut conn, network_id, vm_id).await
    }

    /// Reserve a specific address so allocation skips it
    pub async fn reserve_ip(&self, network_id: &str, ip_address: &str) -> Result<IpAllocation> {
        networks::get(self.state.db.pool(), network_id).await?;

        let _guard = self.state.network_locks.lock(network_id).await;
        let mut tx = self
            .state
            .db
            .pool()
            .begin()
            .await
            .map_err(|e| db_err("failed to begin transaction", e))?;
        let allocation = ips::reserve_tx(&mut tx, network_id, ip_address).await?;
        tx.commit()
            .await
            .map_err(|e| db_err("failed to commit reservation", e))?;
        Ok(allocation)
    }

    /// Explicitly release one address (the only way out of `reserved`)
    pub async fn release_ip(&self, network_id: &str, ip_address: &str) -> Result<()> {
        let _guard = self.state.network_locks.lock(network_id).await;
        let mut conn = self
            .state
            .db
            .pool()
            .acquire()
            .await
            .map_err(|e| db_err("failed to acquire connection", e))?;
        ips::release_address_tx(&mut conn, network_id, ip_address).await
    }

    pub async fn list_ips(
        &self,
        network_id: &str,
        page: usize,
        page_size: usize,
        status: Option<&str>,
    ) -> Result<(Vec<IpAllocation>, usize)> {
        networks::get(self.state.db.pool(), network_id).await?;
        ips::list(self.state.db.pool(), network_id, page, page_size, status).await
    }

}

/// Parse "a.b.c.d/len" into its base address and prefix length
pub fn parse_cidr(cidr: &str) -> Result<(Ipv4Addr, u8)> {
    let mut parts = cidr.split('/');
    let (Some(addr), Some(len), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(Error::Validation(format!("invalid cidr: {}", cidr)));
    };
    let addr: Ipv4Addr = addr
        .parse()
        .map_err(|_| Error::Validation(format!("invalid cidr address: {}", cidr)))?;
    let len: u8 = len
        .parse()
        .map_err(|_| Error::Validation(format!("invalid cidr prefix: {}", cidr)))?;

    if !(MIN_PREFIX_LEN..=MAX_PREFIX_LEN).contains(&len) {
        return Err(Error::Validation(format!(
            "prefix /{} outside supported range /{}-/{}",
            len, MIN_PREFIX_LEN, MAX_PREFIX_LEN
        )));
    }

    let mask = !0u32 << (32 - len);
    let base = Ipv4Addr::from(u32::from(addr) & mask);
    Ok((base, len))
}

fn cidr_contains(base: Ipv4Addr, prefix_len: u8, addr: Ipv4Addr) -> bool {
    let mask = !0u32 << (32 - prefix_len);
    (u32::from(addr) & mask) == u32::from(base)
}

/// Every usable host address: network and broadcast excluded, gateway
/// excluded when present
pub fn enumerate_hosts(base: Ipv4Addr, prefix_len: u8, gateway: Option<Ipv4Addr>) -> Vec<Ipv4Addr> {
    let network = u32::from(base);
    let host_count = (1u32 << (32 - prefix_len)) - 2;
    (1..=host_count)
        .map(|offset| Ipv4Addr::from(network + offset))
        .filter(|addr| Some(*addr) != gateway)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cidr_normalizes_base() {
        let (base, len) = parse_cidr("10.0.1.7/24").unwrap();
        assert_eq!(base, Ipv4Addr::new(10, 0, 1, 0));
        assert_eq!(len, 24);
    }

    #[test]
    fn test_parse_cidr_rejects_out_of_range() {
        assert!(parse_cidr("10.0.0.0/8").is_err());
        assert!(parse_cidr("10.0.0.0/31").is_err());
        assert!(parse_cidr("10.0.0.0/33").is_err());
        assert!(parse_cidr("10.0.0.0").is_err());
        assert!(parse_cidr("banana/24").is_err());
    }

    #[test]
    fn test_enumerate_excludes_network_broadcast_gateway() {
        let base = Ipv4Addr::new(10, 0, 1, 0);
        let gateway = Some(Ipv4Addr::new(10, 0, 1, 1));
        let hosts = enumerate_hosts(base, 24, gateway);

        assert_eq!(hosts.len(), 253);
        assert!(!hosts.contains(&Ipv4Addr::new(10, 0, 1, 0)));
        assert!(!hosts.contains(&Ipv4Addr::new(10, 0, 1, 1)));
        assert!(!hosts.contains(&Ipv4Addr::new(10, 0, 1, 255)));
        assert!(hosts.contains(&Ipv4Addr::new(10, 0, 1, 2)));
        assert!(hosts.contains(&Ipv4Addr::new(10, 0, 1, 254)));
    }

    #[test]
    fn test_enumerate_slash_30() {
        let hosts = enumerate_hosts(Ipv4Addr::new(192, 168, 0, 0), 30, None);
        assert_eq!(
            hosts,
            vec![Ipv4Addr::new(192, 168, 0, 1), Ipv4Addr::new(192, 168, 0, 2)]
        );
    }

    #[test]
    fn test_cidr_contains() {
        let base = Ipv4Addr::new(10, 0, 1, 0);
        assert!(cidr_contains(base, 24, Ipv4Addr::new(10, 0, 1, 200)));
        assert!(!cidr_contains(base, 24, Ipv4Addr::new(10, 0, 2, 1)));
    }

    use crate::state::AppState;

    async fn manager_with_network(cidr: &str, gateway: Option<&str>) -> (NetworkManager, String) {
        let state = AppState::for_tests().await;
        let manager = NetworkManager::new(state);
        let network = manager
            .create(
                CreateNetworkRequest {
                    name: "lab".into(),
                    network_type: "bridge".into(),
                    cidr: cidr.into(),
                    gateway: gateway.map(|g| g.to_string()),
                    mtu: None,
                    vlan_id: Some(100),
                    node_id: None,
                },
                "tester",
            )
            .await
            .unwrap();
        let id = network.id.clone();
        (manager, id)
    }

    #[tokio::test]
    async fn test_create_materializes_pool() {
        let (manager, id) = manager_with_network("10.0.1.0/29", Some("10.0.1.1")).await;
        // /29 has 6 hosts, minus the gateway.
        let (allocations, total) = manager.list_ips(&id, 1, 100, None).await.unwrap();
        assert_eq!(total, 5);
        // Ordered by numeric address, gateway skipped.
        assert_eq!(allocations[0].ip_address, "10.0.1.2");
        assert_eq!(allocations.last().unwrap().ip_address, "10.0.1.6");
    }

    #[tokio::test]
    async fn test_concurrent_allocation_single_free_address() {
        let (manager, id) = manager_with_network("10.0.1.0/30", None).await;
        // Two hosts; reserve one so exactly one stays free.
        manager.reserve_ip(&id, "10.0.1.2").await.unwrap();

        let manager = std::sync::Arc::new(manager);
        let (m1, m2) = (manager.clone(), manager.clone());
        let (id1, id2) = (id.clone(), id.clone());
        let (a, b) = tokio::join!(
            tokio::spawn(async move { m1.allocate_ip(&id1).await }),
            tokio::spawn(async move { m2.allocate_ip(&id2).await }),
        );
        let results = [a.unwrap(), b.unwrap()];

        let wins: Vec<_> = results.iter().filter(|r| r.is_ok()).collect();
        assert_eq!(wins.len(), 1, "exactly one allocation may succeed");
        let losses: Vec<_> = results.iter().filter(|r| r.is_err()).collect();
        assert!(matches!(losses[0], Err(Error::IpExhausted(_))));
    }

    #[tokio::test]
    async fn test_allocate_release_round_trip() {
        let (manager, id) = manager_with_network("10.0.1.0/29", None).await;
        let (before, before_total) = manager.list_ips(&id, 1, 100, Some("available")).await.unwrap();

        let allocation = manager.allocate_ip(&id).await.unwrap();
        manager
            .associate_ip(&allocation.id, "vm-1", Some("52:54:00:00:00:01"))
            .await
            .unwrap();
        manager.release_vm_ips(&id, "vm-1").await.unwrap();

        let (after, after_total) = manager.list_ips(&id, 1, 100, Some("available")).await.unwrap();
        assert_eq!(before_total, after_total);
        let before_ips: Vec<_> = before.iter().map(|a| &a.ip_address).collect();
        let after_ips: Vec<_> = after.iter().map(|a| &a.ip_address).collect();
        assert_eq!(before_ips, after_ips);
    }

    #[tokio::test]
    async fn test_delete_guard_and_rename_only_update() {
        let (manager, id) = manager_with_network("10.0.1.0/29", None).await;
        manager.reserve_ip(&id, "10.0.1.1").await.unwrap();

        // Held address blocks delete, reserved included.
        let err = manager.delete(&id, "tester").await.unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));

        manager.release_ip(&id, "10.0.1.1").await.unwrap();
        manager.rename(&id, "renamed", "tester").await.unwrap();
        assert_eq!(manager.get(&id).await.unwrap().name, "renamed");
        manager.delete(&id, "tester").await.unwrap();
        assert!(manager.get(&id).await.is_err());
    }
}
