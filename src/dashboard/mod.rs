//! Status endpoint: read-only Axum server over the controller snapshot.
//!
//! CORS enabled for local tooling.

pub mod routes;

use anyhow::{Context, Result};
use axum::{
    http::{header, HeaderValue, Method},
    routing::get,
    Router,
};
use std::net::SocketAddr;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

pub use routes::{AppState, DashboardState};

/// Bind `addr` and serve the status API in a background task.
pub async fn spawn_dashboard(state: AppState, addr: SocketAddr) -> Result<JoinHandle<()>> {
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context(format!("Failed to bind status endpoint on {addr}"))?;
    let local = listener.local_addr().unwrap_or(addr);
    info!(addr = %local, "Status endpoint listening on http://{local}");

    Ok(tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "Status endpoint stopped");
        }
    }))
}

/// Build the Axum router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(HeaderValue::from_static("*"))
        .allow_methods([Method::GET])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/api/status", get(routes::get_status))
        .route("/api/ledger", get(routes::get_ledger))
        .route("/api/round", get(routes::get_round))
        .route("/api/notes", get(routes::get_notes))
        .route("/health", get(routes::health))
        .layer(cors)
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
