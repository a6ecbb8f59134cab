//! Authentication: login, opaque bearer tokens, session table

pub mod password;
pub mod rbac;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use ironhive_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::users::{self, User};
use crate::db::Database;
use rbac::{role_permissions, Permission};

/// A logged-in session bound to a bearer token
#[derive(Debug, Clone)]
pub struct Session {
    pub token: String,
    pub user_id: String,
    pub username: String,
    pub role: String,
    pub expires_at: DateTime<Utc>,
}

/// The resolved identity attached to every authenticated request
#[derive(Debug, Clone, Serialize)]
pub struct AuthUser {
    pub user_id: String,
    pub username: String,
    pub role: String,
    pub permissions: Vec<Permission>,
}

impl AuthUser {
    /// Guard: reject the request unless the permission is held
    pub fn require(&self, permission: Permission) -> Result<()> {
        if self.permissions.contains(&permission) {
            Ok(())
        } else {
            Err(Error::PermissionDenied(format!(
                "role '{}' lacks {:?}",
                self.role, permission
            )))
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub auth: AuthPayload,
}

#[derive(Debug, Serialize)]
pub struct AuthPayload {
    pub token: String,
    pub username: String,
    pub role: String,
    pub expires_at: String,
}

/// Token-issuing login and bearer-token validation
pub struct AuthManager {
    db: Arc<Database>,
    sessions: Arc<RwLock<HashMap<String, Session>>>,
    token_ttl: ChronoDuration,
}

impl AuthManager {
    pub fn new(db: Arc<Database>, token_ttl: Duration) -> Self {
        Self {
            db,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            token_ttl: ChronoDuration::seconds(token_ttl.as_secs() as i64),
        }
    }

    /// Create the bootstrap admin account when the users table is empty
    pub async fn ensure_admin(&self, admin_password: &str) -> Result<()> {
        if users::count(self.db.pool()).await? > 0 {
            return Ok(());
        }
        if admin_password == "admin" {
            warn!("using default admin password; set IRONHIVE_ADMIN_PASSWORD in production");
        }
        let salt = password::generate_salt();
        let user = User {
            id: Uuid::new_v4().to_string(),
            username: "admin".to_string(),
            password_hash: password::hash_password(admin_password, &salt),
            salt,
            role: "admin".to_string(),
            enabled: true,
            created_at: Utc::now(),
        };
        users::insert(self.db.pool(), &user).await?;
        info!("created bootstrap admin user");
        Ok(())
    }

    /// Verify credentials and mint an opaque bearer token
    pub async fn login(&self, request: LoginRequest) -> Result<LoginResponse> {
        let user = users::get_by_username(self.db.pool(), &request.username)
            .await?
            .ok_or(Error::AuthenticationFailed)?;

        if !user.enabled {
            return Err(Error::AuthenticationFailed);
        }
        if !password::verify_password(&request.password, &user.salt, &user.password_hash) {
            return Err(Error::AuthenticationFailed);
        }

        let session = Session {
            token: format!("ih-{}", Uuid::new_v4()),
            user_id: user.id.clone(),
            username: user.username.clone(),
            role: user.role.clone(),
            expires_at: Utc::now() + self.token_ttl,
        };

        let mut sessions = self.sessions.write().await;
        sessions.insert(session.token.clone(), session.clone());

        info!(user = %user.username, "login succeeded");
        Ok(LoginResponse {
            auth: AuthPayload {
                token: session.token,
                username: user.username,
                role: user.role,
                expires_at: session.expires_at.to_rfc3339(),
            },
        })
    }

    /// Resolve a bearer token into an identity with role-derived permissions
    pub async fn validate_token(&self, token: &str) -> Result<AuthUser> {
        let session = {
            let sessions = self.sessions.read().await;
            sessions.get(token).cloned()
        }
        .ok_or(Error::InvalidSession)?;

        if session.expires_at < Utc::now() {
            let mut sessions = self.sessions.write().await;
            sessions.remove(token);
            return Err(Error::InvalidSession);
        }

        Ok(AuthUser {
            user_id: session.user_id,
            username: session.username,
            permissions: role_permissions(&session.role),
            role: session.role,
        })
    }

    /// Drop a session
    pub async fn logout(&self, token: &str) {
        let mut sessions = self.sessions.write().await;
        sessions.remove(token);
    }

    /// Evict expired sessions; called from a periodic sweep
    pub async fn prune_expired(&self) -> usize {
        let now = Utc::now();
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, s| s.expires_at > now);
        before - sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_db;

    async fn manager() -> AuthManager {
        let db = Arc::new(test_db().await);
        let mgr = AuthManager::new(db, Duration::from_secs(3600));
        mgr.ensure_admin("hunter2").await.unwrap();
        mgr
    }

    #[tokio::test]
    async fn test_login_and_validate() {
        let mgr = manager().await;
        let resp = mgr
            .login(LoginRequest {
                username: "admin".into(),
                password: "hunter2".into(),
            })
            .await
            .unwrap();

        let user = mgr.validate_token(&resp.auth.token).await.unwrap();
        assert_eq!(user.username, "admin");
        assert!(user.require(Permission::UserManage).is_ok());
    }

    #[tokio::test]
    async fn test_bad_password_rejected() {
        let mgr = manager().await;
        let err = mgr
            .login(LoginRequest {
                username: "admin".into(),
                password: "wrong".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AuthenticationFailed));
    }

    #[tokio::test]
    async fn test_expired_token_rejected() {
        let db = Arc::new(test_db().await);
        let mgr = AuthManager::new(db, Duration::from_secs(0));
        mgr.ensure_admin("hunter2").await.unwrap();

        // Zero TTL means the token is already expired when minted.
        let resp = mgr
            .login(LoginRequest {
                username: "admin".into(),
                password: "hunter2".into(),
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(mgr.validate_token(&resp.auth.token).await.is_err());
    }

    #[tokio::test]
    async fn test_logout_invalidates() {
        let mgr = manager().await;
        let resp = mgr
            .login(LoginRequest {
                username: "admin".into(),
                password: "hunter2".into(),
            })
            .await
            .unwrap();
        mgr.logout(&resp.auth.token).await;
        assert!(mgr.validate_token(&resp.auth.token).await.is_err());
    }

    #[tokio::test]
    async fn test_ensure_admin_is_idempotent() {
        let mgr = manager().await;
        mgr.ensure_admin("other").await.unwrap();
        // Original password still works; no second user was created.
        assert!(mgr
            .login(LoginRequest {
                username: "admin".into(),
                password: "hunter2".into(),
            })
            .await
            .is_ok());
    }
}
