//! Ironhive controller
//!
//! Owns the metadata store, the REST surface, the agent websocket, and
//! the front-end notification channel. Agents connect inbound; all
//! side-effecting work is dispatched to them over the duplex RPC link.

mod api;
mod audit;
mod auth;
mod cluster;
mod config;
mod db;
mod error;
mod locks;
mod logging;
mod middleware;
mod network;
mod node;
mod state;
mod storage;
mod tasks;
mod vm;
mod websocket;

use std::sync::Arc;

use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tracing::info;

use crate::config::ServerConfig;
use crate::db::Database;
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();

    let config = ServerConfig::load();
    if let Err(e) = config.validate() {
        anyhow::bail!("invalid configuration: {}", e);
    }
    info!(bind = %config.bind_addr, "configuration loaded");

    let database = Database::new(&config.database_url).await?;
    database.migrate().await?;

    let state = Arc::new(AppState::new(config, database));
    state.auth.ensure_admin(&state.config.admin_password).await?;

    cluster::reconciler::spawn(state.clone());

    // Long operations return a task id well before this; the deadline
    // only catches handlers that wedge.
    let app = api::router(state.clone())
        .layer(TimeoutLayer::new(std::time::Duration::from_secs(60)))
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(&state.config.bind_addr).await?;
    info!(addr = %state.config.bind_addr, "ironhive controller listening");
    axum::serve(listener, app).await?;

    Ok(())
}
