//! Audit logging
//!
//! Every mutating action gets an append-only entry before the API call
//! returns. Rendering and export live elsewhere; this is the write path
//! plus a paged read for the inspection endpoint.

use ironhive_common::Result;
use std::sync::Arc;
use tracing::warn;

use crate::db::audit::{self, AuditEntry};
use crate::db::Database;

pub struct AuditLogger {
    db: Arc<Database>,
}

impl AuditLogger {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Record a mutating action. Audit failures are logged, never bubbled:
    /// a full audit table must not take the control plane down.
    pub async fn record(
        &self,
        username: &str,
        action: &str,
        target_type: &str,
        target_id: &str,
        details: Option<serde_json::Value>,
    ) {
        let details_str = details.map(|d| d.to_string());
        if let Err(e) = audit::append(
            self.db.pool(),
            username,
            action,
            target_type,
            target_id,
            details_str.as_deref(),
        )
        .await
        {
            warn!(action, target_id, "failed to write audit entry: {}", e);
        }
    }

    pub async fn list(&self, page: usize, page_size: usize) -> Result<(Vec<AuditEntry>, usize)> {
        audit::list(self.db.pool(), page, page_size).await
    }
}
