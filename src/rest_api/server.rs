//! Axum HTTP server for health probes, metrics and the REST API

use std::sync::Arc;

use axum::{routing::get, Router};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::controller::ControllerState;
use crate::{Error, Result};

use super::handlers;

/// Metrics endpoint handler
#[cfg(feature = "metrics")]
async fn metrics_handler() -> std::result::Result<String, axum::http::StatusCode> {
    use prometheus_client::encoding::text::encode;
    let mut buffer = String::new();
    encode(&mut buffer, &crate::controller::metrics::REGISTRY)
        .map_err(|_| axum::http::StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(buffer)
}

/// Stateless probe and metrics routes
fn probes() -> Router {
    let app = Router::new().route("/healthz", get(handlers::healthz));

    #[cfg(feature = "metrics")]
    let app = app.route("/metrics", get(metrics_handler));

    app
}

fn router(state: Arc<ControllerState>) -> Router {
    Router::new()
        .route("/readyz", get(handlers::readyz))
        .route("/api/v1/modules", get(handlers::list_modules))
        .route("/api/v1/modules/{namespace}/{name}", get(handlers::get_module))
        .with_state(state)
        .merge(probes())
        .layer(TraceLayer::new_for_http())
}

/// Run the REST API server
pub async fn run_server(state: Arc<ControllerState>) -> Result<()> {
    let addr = state.config.http_addr;
    let app = router(state);

    info!("REST API server listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::ConfigError(format!("Failed to bind to {}: {}", addr, e)))?;

    axum::serve(listener, app)
        .await
        .map_err(|e| Error::ConfigError(format!("Server error: {}", e)))?;

    Ok(())
}
