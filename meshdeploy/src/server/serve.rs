//! HTTP server setup

use std::future::Future;
use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::app::options::ServerOptions;
use crate::errors::DeployError;
use crate::server::handlers::{
    deploy_handler, destroy_handler, health_handler, logs_handler, require_auth, service_health_handler,
    services_handler, version_handler,
};
use crate::server::state::ServerState;

/// Build the admin API router
pub fn router(state: Arc<ServerState>) -> Router {
    let protected = Router::new()
        .route("/deploy", post(deploy_handler))
        .route("/services", get(services_handler))
        .route("/services/{name}/logs", get(logs_handler))
        .route("/services/{name}/health", get(service_health_handler))
        .route("/destroy", post(destroy_handler))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        // Health and version
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        .merge(protected)
        // State and middleware
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
}

/// Bind the listener the server will accept on
pub async fn bind(options: &ServerOptions) -> Result<TcpListener, DeployError> {
    let addr = format!("{}:{}", options.host, options.port);
    TcpListener::bind(&addr)
        .await
        .map_err(|e| DeployError::Server(format!("Failed to bind {}: {}", addr, e)))
}

/// Start the HTTP server
pub async fn serve(
    listener: TcpListener,
    state: Arc<ServerState>,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<JoinHandle<Result<(), DeployError>>, DeployError> {
    let app = router(state);

    let addr = listener.local_addr()?;
    info!("Starting HTTP server on {}", addr);

    let handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| DeployError::Server(e.to_string()))
    });

    Ok(handle)
}
