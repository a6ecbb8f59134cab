//! Ironhive node agent
//!
//! Connects out to the controller, registers this host, and executes the
//! hypervisor, storage, and bridge work the controller dispatches.

mod client;
mod config;
mod hypervisor;
mod network;
mod node;
mod rpc;
mod storage;
mod task_cache;

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::client::WsClient;
use crate::config::AgentConfig;
use crate::hypervisor::HypervisorManager;
use crate::network::NetworkManager;
use crate::rpc::AgentHandlers;
use crate::task_cache::TaskCache;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = AgentConfig::load().map_err(|e| anyhow::anyhow!(e))?;
    info!(node = %config.node_id, "ironhive agent starting");

    let cache = TaskCache::new();
    let handlers = Arc::new(AgentHandlers {
        hypervisor: Arc::new(HypervisorManager::new(&config.domains_dir)),
        network: Arc::new(NetworkManager::new(&config.provider_iface)),
        cache: cache.clone(),
    });
    let router = Arc::new(rpc::build_router(handlers));
    info!(methods = router.methods().len(), "rpc surface registered");

    let client = WsClient::new(config, router, cache);
    client.run().await;
    Ok(())
}
