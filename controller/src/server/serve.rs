//! HTTP server setup

use std::future::Future;
use std::sync::Arc;

use axum::{routing::get, Router};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::app::options::ServerOptions;
use crate::errors::DockyardError;
use crate::server::handlers::{health_handler, hosts_handler, version_handler};
use crate::server::state::ServerState;

/// Build the status router
pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        // Health and version
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        // Host sessions
        .route("/hosts", get(hosts_handler))
        // State and middleware
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Start the HTTP server
pub async fn serve(
    options: &ServerOptions,
    state: Arc<ServerState>,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<JoinHandle<Result<(), DockyardError>>, DockyardError> {
    let app = router(state);

    let addr = format!("{}:{}", options.host, options.port);
    info!("Starting status server on {}", addr);

    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| DockyardError::Internal(format!("cannot bind {}: {}", addr, e)))?;

    let handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| DockyardError::Internal(e.to_string()))
    });

    Ok(handle)
}
