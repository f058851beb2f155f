//! Beach Pier: a signaling relay that brokers WebSocket clients by id and
//! forwards their WebRTC negotiation frames to each other.

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod handlers;
pub mod registry;
pub mod router;
pub mod state;
pub mod telemetry;
pub mod websocket;

use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::{
    routing::{get, post},
    Router,
};
use beach_pier_core::SOCKET_PATH;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::{net::TcpListener, signal};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

pub use client::Client;
pub use config::ServerConfig;
pub use error::RelayError;
pub use events::EventBus;
pub use registry::ClientRegistry;
pub use router::MessageRouter;
pub use state::RelayState;

/// Builds every route, mounted under the configured path.
pub fn relay_router(state: RelayState) -> Router {
    let path = state.config.path.clone();

    let routes = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics_handler))
        .route(&format!("/{SOCKET_PATH}"), get(websocket::websocket_handler))
        .route("/:key/id", get(handlers::generate_id))
        .route("/:key/peers", get(handlers::list_peers))
        .route("/:key/:id/:token/:kind", post(handlers::relay_message))
        .with_state(state);

    let app = if path == "/" {
        routes
    } else {
        Router::new().nest(&path, routes)
    };

    app.layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Serves the relay on an already bound listener until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: RelayState, shutdown: F) -> Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let app = relay_router(state);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .context("server shutdown with error")
}

pub async fn run(config: ServerConfig, metrics: Option<PrometheusHandle>) -> Result<()> {
    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    let grace = config.shutdown_grace;

    let mut state = RelayState::new(config);
    if let Some(handle) = metrics {
        state = state.with_metrics(handle);
    }

    info!(
        listen_addr = %state.config.listen_addr,
        path = %state.config.path,
        concurrent_limit = state.config.concurrent_limit,
        allow_discovery = state.config.allow_discovery,
        "beach-pier listening"
    );

    serve(listener, state, shutdown_signal()).await?;

    info!(
        grace_seconds = grace.as_secs(),
        "shutdown signal received; sleeping for graceful period"
    );
    tokio::time::sleep(grace).await;
    info!("graceful shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
