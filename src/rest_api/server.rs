//! Axum HTTP server for the provider API

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    routing::{any, get, post},
    Router,
};
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::error::{Error, Result};

use super::handlers;
use super::proxy;
use super::ApiState;

/// Metrics endpoint handler
#[cfg(feature = "metrics")]
async fn metrics_handler() -> String {
    use prometheus_client::encoding::text::encode;
    let mut buffer = String::new();
    encode(&mut buffer, &crate::controller::metrics::REGISTRY).unwrap();
    buffer
}

/// Build the full provider route table
pub fn build_router(state: Arc<ApiState>) -> Router {
    let router = Router::new()
        .route(
            "/system/functions",
            get(handlers::list_functions)
                .post(handlers::deploy_function)
                .put(handlers::update_function)
                .delete(handlers::delete_function),
        )
        .route("/system/function/{name}", get(handlers::get_function))
        .route(
            "/system/scale-function/{name}",
            post(handlers::scale_function),
        )
        .route("/function/{name}", any(proxy::invoke_root))
        .route("/function/{name}/{*path}", any(proxy::invoke_path));

    #[cfg(feature = "metrics")]
    let router = router.route("/metrics", get(metrics_handler));

    router.layer(TraceLayer::new_for_http()).with_state(state)
}

/// Run the REST API server until the shutdown signal flips
pub async fn run_server(state: Arc<ApiState>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], state.config.port));
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::ConfigError(format!("failed to bind to {addr}: {e}")))?;

    info!("provider API listening on {addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow_and_update() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .map_err(|e| Error::ConfigError(format!("server error: {e}")))?;

    info!("provider API stopped");
    Ok(())
}
