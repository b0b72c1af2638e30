// Event Service - the HTTP/SSE gateway over the message bus
//
// Terminates HTTP for agents, owns all live SSE connections, and translates
// between HTTP/SSE and the configured bus adapter. The adapter is chosen at
// startup; the rest of the service is backend-agnostic.

mod routes;
mod state;

pub use state::{GatewayState, StreamQueue};

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;

use crate::bus::{BusAdapter, MemoryAdapter, NatsAdapter};
use crate::config::{AdapterKind, EventServiceConfig};

/// Build the adapter selected by configuration.
fn build_adapter(config: &EventServiceConfig) -> Arc<dyn BusAdapter> {
    match config.adapter {
        AdapterKind::Memory => Arc::new(MemoryAdapter::new()),
        AdapterKind::Nats => Arc::new(NatsAdapter::new(config.nats_url.clone())),
    }
}

/// Run the Event Service until the shutdown signal fires.
pub async fn run(
    config: EventServiceConfig,
    shutdown_rx: tokio::sync::oneshot::Receiver<()>,
) -> Result<()> {
    let adapter = build_adapter(&config);
    tracing::info!(adapter = adapter.name(), "starting Event Service");

    if let Err(e) = adapter.connect().await {
        // In development we keep serving so /health reports "degraded"
        // instead of the service flapping; production fails fast.
        if config.is_prod {
            return Err(anyhow::anyhow!(e).context("failed to connect event adapter"));
        }
        tracing::error!("failed to connect adapter: {} (continuing degraded)", e);
    }

    let port = config.port;
    let state = GatewayState::new(adapter.clone(), config);

    let app = Router::new()
        .route("/v1/events/publish", post(routes::publish_event))
        .route("/v1/events/stream", get(routes::stream_events))
        .route("/health", get(routes::health))
        .route("/connections", get(routes::list_connections))
        .with_state(state.clone());

    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("failed to bind port {}", port))?;
    tracing::info!("Event Service listening on port {}", port);

    // The shutdown future also winds down every stream loop: open SSE
    // responses must finish before graceful shutdown considers the server
    // drained.
    let shutdown_state = state.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.await;
            tracing::info!("shutting down Event Service");
            shutdown_state.begin_shutdown();
        })
        .await
        .context("event service server failed")?;
    if let Err(e) = adapter.disconnect().await {
        tracing::warn!("adapter disconnect failed: {}", e);
    }
    tracing::info!("Event Service shutdown complete");
    Ok(())
}
