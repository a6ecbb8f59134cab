//! Shared application state

use std::sync::Arc;

use crate::audit::AuditLogger;
use crate::auth::AuthManager;
use crate::cluster::AgentRegistry;
use crate::config::ServerConfig;
use crate::db::Database;
use crate::locks::EntityLocks;
use crate::tasks::TaskManager;
use crate::websocket::WsState;

/// Everything a handler or manager needs, cheap to clone
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub db: Arc<Database>,
    pub auth: Arc<AuthManager>,
    pub audit: Arc<AuditLogger>,
    pub registry: Arc<AgentRegistry>,
    pub ws: Arc<WsState>,
    pub tasks: Arc<TaskManager>,
    /// Serializes state-transitioning operations per VM id
    pub vm_locks: EntityLocks,
    /// Serializes state-transitioning operations per volume id
    pub volume_locks: EntityLocks,
    /// Guards IP allocation per network id
    pub network_locks: EntityLocks,
}

impl AppState {
    #[cfg(test)]
    pub(crate) async fn for_tests() -> Self {
        let config = ServerConfig {
            database_url: String::new(),
            bind_addr: "127.0.0.1:0".to_string(),
            token_ttl: std::time::Duration::from_secs(3600),
            agent_token: "test-token".to_string(),
            admin_password: "admin".to_string(),
            heartbeat_timeout: std::time::Duration::from_secs(90),
            reconcile_interval: std::time::Duration::from_secs(60),
        };
        Self::new(config, crate::db::test_db().await)
    }

    pub fn new(config: ServerConfig, db: Database) -> Self {
        let config = Arc::new(config);
        let db = Arc::new(db);
        let ws = Arc::new(WsState::new());
        Self {
            auth: Arc::new(AuthManager::new(db.clone(), config.token_ttl)),
            audit: Arc::new(AuditLogger::new(db.clone())),
            registry: Arc::new(AgentRegistry::new()),
            tasks: Arc::new(TaskManager::new(db.clone(), ws.clone())),
            ws,
            vm_locks: EntityLocks::new(),
            volume_locks: EntityLocks::new(),
            network_locks: EntityLocks::new(),
            config,
            db,
        }
    }
}
