//! Controller configuration
//!
//! Settings come from environment variables with sane defaults; nothing
//! here requires a config file for a single-box install.

use std::time::Duration;

/// Controller runtime configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// SQLite connection string, e.g. "sqlite:///var/lib/ironhive/ironhive.db"
    pub database_url: String,
    /// Address the REST/websocket listener binds to
    pub bind_addr: String,
    /// Lifetime of a login token
    pub token_ttl: Duration,
    /// Shared secret agents present at registration
    pub agent_token: String,
    /// Password for the bootstrap admin user (first boot only)
    pub admin_password: String,
    /// Heartbeat age after which a node is marked offline
    pub heartbeat_timeout: Duration,
    /// Cadence of the reconciliation sweep
    pub reconcile_interval: Duration,
}

impl ServerConfig {
    /// Load configuration from the environment, falling back to defaults
    pub fn load() -> Self {
        Self {
            database_url: env_or("IRONHIVE_DATABASE_URL", "sqlite://ironhive.db?mode=rwc"),
            bind_addr: env_or("IRONHIVE_BIND_ADDR", "0.0.0.0:8710"),
            token_ttl: Duration::from_secs(env_parsed("IRONHIVE_TOKEN_TTL_SECS", 86_400)),
            agent_token: env_or("IRONHIVE_AGENT_TOKEN", ""),
            admin_password: env_or("IRONHIVE_ADMIN_PASSWORD", "admin"),
            heartbeat_timeout: Duration::from_secs(env_parsed("IRONHIVE_HEARTBEAT_TIMEOUT_SECS", 90)),
            reconcile_interval: Duration::from_secs(env_parsed("IRONHIVE_RECONCILE_INTERVAL_SECS", 60)),
        }
    }

    /// Reject configurations that cannot work
    pub fn validate(&self) -> Result<(), String> {
        if self.bind_addr.parse::<std::net::SocketAddr>().is_err() {
            return Err(format!("invalid bind address: {}", self.bind_addr));
        }
        if self.agent_token.is_empty() {
            return Err("IRONHIVE_AGENT_TOKEN must be set so agents can authenticate".to_string());
        }
        if self.token_ttl.as_secs() == 0 {
            return Err("token TTL must be non-zero".to_string());
        }
        Ok(())
    }
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

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> ServerConfig {
        ServerConfig {
            database_url: "sqlite::memory:".into(),
            bind_addr: "127.0.0.1:8710".into(),
            token_ttl: Duration::from_secs(86_400),
            agent_token: "secret".into(),
            admin_password: "admin".into(),
            heartbeat_timeout: Duration::from_secs(90),
            reconcile_interval: Duration::from_secs(60),
        }
    }

    #[test]
    fn test_valid_config() {
        assert!(base().validate().is_ok());
    }

    #[test]
    fn test_missing_agent_token_rejected() {
        let mut config = base();
        config.agent_token = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_bind_addr_rejected() {
        let mut config = base();
        config.bind_addr = "not-an-addr".into();
        assert!(config.validate().is_err());
    }
}
