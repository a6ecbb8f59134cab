//! REST surface
//!
//! One handler module per resource, assembled into a single `/api` router.
//! Everything except login sits behind the bearer-token middleware; the
//! two websocket endpoints are mounted outside `/api`.

pub mod audit;
pub mod auth;
pub mod networks;
pub mod nodes;
pub mod snapshots;
pub mod storage;
pub mod tasks;
pub mod vms;

use axum::middleware as axum_middleware;
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use std::sync::Arc;

use crate::middleware::auth::require_auth;
use crate::state::AppState;

/// Shared pagination query. `per_page` is accepted as a legacy alias for
/// `page_size`; responses always use the flat canonical shape.
#[derive(Debug, Deserialize)]
pub struct PageQuery {
    #[serde(default = "default_page")]
    pub page: usize,
    #[serde(default = "default_page_size", alias = "per_page")]
    pub page_size: usize,
    pub status: Option<String>,
    pub node_id: Option<String>,
    pub pool_id: Option<String>,
    pub volume_id: Option<String>,
}

fn default_page() -> usize {
    1
}

fn default_page_size() -> usize {
    20
}

impl PageQuery {
    /// Clamp to sane bounds; page is 1-based
    pub fn normalized(&self) -> (usize, usize) {
        (self.page.max(1), self.page_size.clamp(1, 500))
    }
}

/// Liveness probe: process up, database reachable
async fn health(
    axum::extract::State(state): axum::extract::State<Arc<AppState>>,
) -> Result<axum::Json<serde_json::Value>, crate::error::ApiError> {
    state.db.health_check().await?;
    Ok(axum::Json(serde_json::json!({ "status": "ok" })))
}

/// Build the full application router
pub fn router(state: Arc<AppState>) -> Router {
    let public = Router::new()
        .route("/auth/login", post(auth::login))
        .route("/health", get(health));

    let protected = Router::new()
        .route("/auth/logout", post(auth::logout))
        // Nodes
        .route("/nodes", get(nodes::list).post(nodes::create))
        .route("/nodes/stats", get(nodes::stats))
        .route(
            "/nodes/:id",
            get(nodes::get).put(nodes::update).delete(nodes::remove),
        )
        .route("/nodes/:id/heartbeat", post(nodes::heartbeat))
        // Virtual machines
        .route("/vms", get(vms::list).post(vms::create))
        .route("/vms/:id", get(vms::get).put(vms::update).delete(vms::remove))
        .route("/vms/:id/start", post(vms::start))
        .route("/vms/:id/stop", post(vms::stop))
        .route("/vms/:id/restart", post(vms::restart))
        .route("/vms/:id/migrate", post(vms::migrate))
        .route("/vms/:id/volumes", get(vms::list_volumes))
        .route("/vms/:id/volumes/attach", post(vms::attach_volume))
        .route("/vms/:id/volumes/detach", post(vms::detach_volume))
        .route("/vms/:id/networks", get(vms::list_networks))
        // Storage pools
        .route("/storage/pools", get(storage::list_pools).post(storage::create_pool))
        .route(
            "/storage/pools/:id",
            get(storage::get_pool)
                .put(storage::update_pool)
                .delete(storage::delete_pool),
        )
        // Volumes
        .route(
            "/storage/volumes",
            get(storage::list_volumes).post(storage::create_volume),
        )
        .route(
            "/storage/volumes/:id",
            get(storage::get_volume).delete(storage::delete_volume),
        )
        .route("/storage/volumes/:id/resize", post(storage::resize_volume))
        .route("/storage/volumes/:id/clone", post(storage::clone_volume))
        .route("/storage/volumes/:id/snapshot", post(snapshots::create_for_volume))
        // Snapshots
        .route(
            "/storage/snapshots",
            get(snapshots::list).post(snapshots::create),
        )
        .route(
            "/storage/snapshots/:id",
            get(snapshots::get)
                .put(snapshots::update)
                .delete(snapshots::remove),
        )
        .route("/storage/snapshots/:id/restore", post(snapshots::restore))
        // Networks
        .route("/networks", get(networks::list).post(networks::create))
        .route(
            "/networks/:id",
            get(networks::get)
                .put(networks::update)
                .delete(networks::remove),
        )
        .route("/networks/:id/ips", get(networks::list_ips))
        .route("/networks/:id/allocate-ip", post(networks::allocate_ip))
        .route("/networks/:id/release-ip", post(networks::release_ip))
        .route("/networks/:id/reserve-ip", post(networks::reserve_ip))
        // Tasks & audit
        .route("/tasks", get(tasks::list))
        .route("/tasks/:id", get(tasks::get))
        .route("/audit", get(audit::list))
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            require_auth,
        ));

    Router::new()
        .nest("/api", public.merge(protected))
        .route("/ws/agent", get(crate::cluster::ws::agent_ws_handler))
        .route("/ws/frontend", get(crate::websocket::frontend_ws_handler))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_query_defaults_and_alias() {
        let q: PageQuery = serde_urlencoded_from("page=2&per_page=50");
        assert_eq!(q.normalized(), (2, 50));

        let q: PageQuery = serde_urlencoded_from("page_size=25");
        assert_eq!(q.normalized(), (1, 25));

        let q: PageQuery = serde_urlencoded_from("");
        assert_eq!(q.normalized(), (1, 20));
    }

    #[test]
    fn test_page_query_clamps() {
        let q: PageQuery = serde_urlencoded_from("page=0&page_size=100000");
        assert_eq!(q.normalized(), (1, 500));
    }

    fn serde_urlencoded_from(query: &str) -> PageQuery {
        serde_urlencoded::from_str(query).unwrap()
    }
}
