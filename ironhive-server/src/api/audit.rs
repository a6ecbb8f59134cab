//! Audit log inspection

use axum::{
    extract::{Query, State},
    Extension, Json,
};
use std::sync::Arc;

use super::PageQuery;
use crate::auth::rbac::Permission;
use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::state::AppState;

pub async fn list(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Query(query): Query<PageQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    user.require(Permission::AuditRead)?;
    let (page, page_size) = query.normalized();
    let (entries, total) = state.audit.list(page, page_size).await?;

    let entries: Vec<serde_json::Value> = entries
        .iter()
        .map(|e| {
            serde_json::json!({
                "id": e.id,
                "username": e.username,
                "action": e.action,
                "target_type": e.target_type,
                "target_id": e.target_id,
                "details": e.details,
                "created_at": e.created_at.to_rfc3339(),
            })
        })
        .collect();

    Ok(Json(serde_json::json!({
        "entries": entries,
        "total": total,
        "page": page,
        "page_size": page_size,
    })))
}
