// Registry Service - discovery layer for events and agents
//
// Durable definitions of event types and agents, heartbeat-driven TTL
// liveness, a background reaper, and short-TTL read caches. Agents that stop
// heartbeating disappear from discovery on their own; nothing else in the
// platform has to track worker death.

mod cache;
mod reaper;
mod routes;
mod store;

pub use store::{AgentDefinition, AgentQuery, Capability, EventDefinition, RegistryStore};

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::HeaderValue;
use axum::routing::{delete, get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};

use crate::config::RegistryConfig;
use cache::TtlCache;
use routes::RegistryState;

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.iter().any(|o| o == "*") {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let list: Vec<HeaderValue> = origins.iter().filter_map(|o| o.parse().ok()).collect();
        CorsLayer::new()
            .allow_origin(list)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}

/// Run the Registry Service until the shutdown signal fires.
pub async fn run(
    config: RegistryConfig,
    shutdown_rx: tokio::sync::oneshot::Receiver<()>,
) -> Result<()> {
    tracing::info!(db = %config.database_url, "starting Registry Service");
    let store = RegistryStore::open(&config.database_url)
        .context("failed to open registry database")?;

    let state = RegistryState {
        store: store.clone(),
        event_cache: Arc::new(TtlCache::with_defaults()),
        agent_cache: Arc::new(TtlCache::with_defaults()),
        config: Arc::new(config.clone()),
    };

    // Reaper runs for the life of the service and is cancelled at shutdown.
    let (reaper_shutdown, reaper_signal) = watch::channel(false);
    let reaper_handle = tokio::spawn(reaper::run_reaper(
        store,
        state.agent_cache.clone(),
        config.clone(),
        reaper_signal,
    ));

    let app = Router::new()
        .route("/v1/events", post(routes::register_event).get(routes::query_events))
        .route("/v1/agents", post(routes::register_agent).get(routes::query_agents))
        .route(
            "/v1/agents/:agent_id/heartbeat",
            post(routes::heartbeat).put(routes::heartbeat),
        )
        .route("/v1/agents/:agent_id", delete(routes::delete_agent))
        .route("/health", get(routes::health))
        .layer(cors_layer(&config.cors_origins))
        .with_state(state);

    let listener = TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("failed to bind port {}", config.port))?;
    tracing::info!("Registry Service listening on port {}", config.port);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.await;
            tracing::info!("shutting down Registry Service");
        })
        .await
        .context("registry server failed")?;

    reaper_shutdown.send_replace(true);
    let _ = reaper_handle.await;
    tracing::info!("Registry Service shutdown complete");
    Ok(())
}
