//! Admin API.
//!
//! Served on its own listener so it can stay bound to loopback while the
//! proxy listener faces the mesh. Every route requires
//! `Authorization: Bearer <admin.api_key>`.

pub mod auth;
pub mod handlers;

use std::net::SocketAddr;

use axum::{middleware, routing::get, Router};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;

use crate::http::AppState;
use crate::lifecycle::shutdown;

use self::auth::admin_auth_middleware;
use self::handlers::{get_filter, get_status, get_upstream};

pub fn setup_admin_router(state: AppState) -> Router {
    Router::new()
        .route("/admin/status", get(get_status))
        .route("/admin/filter", get(get_filter))
        .route("/admin/upstream", get(get_upstream))
        .layer(middleware::from_fn_with_state(state.clone(), admin_auth_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the admin API until `shutdown` fires.
pub async fn serve(
    state: AppState,
    listener: TcpListener,
    shutdown: broadcast::Receiver<()>,
) -> Result<(), std::io::Error> {
    let addr: SocketAddr = listener.local_addr()?;
    tracing::info!(address = %addr, "Admin API listening");

    axum::serve(listener, setup_admin_router(state))
        .with_graceful_shutdown(shutdown::wait(shutdown))
        .await
}
