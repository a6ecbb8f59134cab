//! Agent configuration

use std::time::Duration;

/// Node agent runtime configuration
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Controller websocket URL, e.g. "ws://controller:8710/ws/agent"
    pub server_url: String,
    /// Stable node identity; generated hostnames make poor ids, so this
    /// must be set explicitly
    pub node_id: String,
    pub hostname: String,
    pub ip_address: String,
    /// Shared secret presented at registration
    pub agent_token: String,
    /// NIC that uplinks bridges, e.g. "eth0"
    pub provider_iface: String,
    /// Where domain XML files are written
    pub domains_dir: String,
    pub heartbeat_interval: Duration,
    pub reconnect_backoff: Duration,
}

impl AgentConfig {
    pub fn load() -> Result<Self, String> {
        let node_id = std::env::var("IRONHIVE_NODE_ID")
            .map_err(|_| "IRONHIVE_NODE_ID must be set".to_string())?;
        let agent_token = std::env::var("IRONHIVE_AGENT_TOKEN")
            .map_err(|_| "IRONHIVE_AGENT_TOKEN must be set".to_string())?;

        let hostname = std::env::var("IRONHIVE_HOSTNAME").unwrap_or_else(|_| {
            hostname_fallback()
        });

        Ok(Self {
            server_url: env_or("IRONHIVE_SERVER_URL", "ws://127.0.0.1:8710/ws/agent"),
            node_id,
            hostname,
            ip_address: env_or("IRONHIVE_IP_ADDRESS", "127.0.0.1"),
            agent_token,
            provider_iface: env_or("IRONHIVE_PROVIDER_IFACE", "eth0"),
            domains_dir: env_or("IRONHIVE_DOMAINS_DIR", "/var/lib/ironhive/domains"),
            heartbeat_interval: Duration::from_secs(env_parsed("IRONHIVE_HEARTBEAT_SECS", 30)),
            reconnect_backoff: Duration::from_secs(env_parsed("IRONHIVE_RECONNECT_SECS", 5)),
        })
    }
}

fn hostname_fallback() -> String {
    std::fs::read_to_string("/etc/hostname")
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parsed(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
