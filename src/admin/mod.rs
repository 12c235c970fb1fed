//! Admin HTTP surface.
//!
//! Read-only JSON views of the running gateway, served by axum on a
//! separate address from the proxied traffic.

pub mod handlers;

use std::sync::Arc;

use axum::{routing::get, Router};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::gateway::Gateway;
use self::handlers::*;

pub fn setup_admin_router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/pool", get(get_pool))
        .route("/bindings", get(get_bindings))
        .with_state(gateway)
        .layer(TraceLayer::new_for_http())
}

/// Serve the admin router on `listener` until the gateway shuts down.
pub async fn serve(gateway: Arc<Gateway>, listener: TcpListener) -> Result<(), std::io::Error> {
    let shutdown = gateway.shutdown_handle();
    tracing::info!(address = %listener.local_addr()?, "Admin server starting");
    axum::serve(listener, setup_admin_router(gateway))
        .with_graceful_shutdown(async move { shutdown.wait().await })
        .await?;
    tracing::info!("Admin server stopped");
    Ok(())
}
