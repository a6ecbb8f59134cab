//! Bearer-token authentication middleware
//!
//! Resolves `Authorization: Bearer <token>` into an `AuthUser` extension
//! before any protected handler runs. Login and the agent websocket are
//! mounted outside this layer.

use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::Response,
};
use std::sync::Arc;

use crate::error::ApiError;
use crate::state::AppState;

pub async fn require_auth(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(ApiError::unauthorized)?;

    let user = state
        .auth
        .validate_token(token)
        .await
        .map_err(ApiError::from)?;

    request.extensions_mut().insert(user);
    Ok(next.run(request).await)
}
