//! jobdeck gateway server.
//!
//! Loads configuration, sets up logging and metrics, builds the gateway and
//! serves the HTTP and WebSocket API until SIGINT or SIGTERM.

use std::future::IntoFuture;
use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use jobdeck::{
    config::{timeouts, Config},
    gateway::Gateway,
    reliability::{init_tracing, GatewayMetrics, GracefulShutdown, TracingConfig},
    server::{create_router, AppState},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load().context("failed to load configuration")?;

    init_tracing(TracingConfig::from(&config))
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;
    let metrics = GatewayMetrics::install()
        .map_err(|e| anyhow::anyhow!("failed to install metrics recorder: {e}"))?;

    info!(
        nodes = %config.nodes_path().display(),
        initial_node = %config.initial_node,
        "Starting jobdeck gateway"
    );

    let gateway = Arc::new(Gateway::from_config(&config));
    let state = Arc::new(
        AppState::new(gateway.clone(), config.max_concurrent_streams)
            .with_prometheus(metrics.handle()),
    );
    let app = create_router(state);

    let addr = format!("{}:{}", config.server_host, config.server_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("Listening on {}", addr);

    let shutdown = GracefulShutdown::new();
    shutdown.listen_for_signals();

    let server = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.signal("http"))
        .into_future();
    match shutdown.drain(server, timeouts::SHUTDOWN_DRAIN).await {
        Some(result) => result.context("server error")?,
        None => warn!("Forced shutdown with connections still open"),
    }

    gateway.shutdown();
    info!("Server shut down");
    Ok(())
}
