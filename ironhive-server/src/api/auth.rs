//! Login and logout

use axum::{extract::State, http::HeaderMap, Json};
use std::sync::Arc;

use crate::auth::{LoginRequest, LoginResponse};
use crate::error::ApiError;
use crate::state::AppState;

pub async fn login(
    State(state): State<Arc<AppState>>,
    Json(request): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, ApiError> {
    let username = request.username.clone();
    let response = state.auth.login(request).await?;
    state
        .audit
        .record(&username, "auth.login", "user", &username, None)
        .await;
    Ok(Json(response))
}

pub async fn logout(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    if let Some(token) = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
    {
        state.auth.logout(token).await;
    }
    Ok(Json(serde_json::json!({ "ok": true })))
}
