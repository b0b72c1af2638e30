// Memory Service - tenant-scoped durable state for agents and plans
//
// Working (plan-scoped K/V), episodic (append-only log), semantic (deduped
// knowledge) and procedural memory, plus the plan/task execution records the
// orchestration contracts depend on. The embedding function is an injected
// dependency; the default is the deterministic hashing provider, with an
// ONNX-backed provider behind the `local-embeddings` feature.

pub mod dto;
mod routes;
pub mod store;

pub use store::{MemoryStore, Scope};

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::routing::{get, post, put};
use axum::Router;
use tokio::net::TcpListener;

use crate::config::MemoryConfig;
use crate::embeddings::{EmbeddingProvider, HashingProvider};
use routes::MemoryState;

/// Pick the embedding provider for this process.
#[cfg(not(feature = "local-embeddings"))]
fn build_provider(config: &MemoryConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    Ok(Arc::new(HashingProvider::new(config.embedding_model_dim)))
}

#[cfg(feature = "local-embeddings")]
fn build_provider(config: &MemoryConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    match crate::embeddings::LocalProvider::new("all-MiniLM-L6-v2") {
        Ok(provider) => Ok(Arc::new(provider)),
        Err(e) => {
            tracing::warn!("local embedding model unavailable ({}), using hashing provider", e);
            Ok(Arc::new(HashingProvider::new(config.embedding_model_dim)))
        }
    }
}

/// Run the Memory Service until the shutdown signal fires.
pub async fn run(
    config: MemoryConfig,
    shutdown_rx: tokio::sync::oneshot::Receiver<()>,
) -> Result<()> {
    let provider = build_provider(&config)?;
    tracing::info!(
        db = %config.database_url,
        provider = provider.name(),
        dimensions = provider.dimensions(),
        "starting Memory Service"
    );

    let store = MemoryStore::open(&config.database_url, provider)
        .context("failed to open memory database")?;
    let state = MemoryState { store };

    let app = Router::new()
        // Working memory
        .route(
            "/v1/memory/working/:plan_id/:key",
            put(routes::set_working)
                .get(routes::get_working)
                .delete(routes::delete_working_key),
        )
        .route(
            "/v1/memory/working/:plan_id",
            get(routes::list_working).delete(routes::delete_working_plan),
        )
        // Episodic memory
        .route("/v1/memory/episodic", post(routes::append_episode))
        .route("/v1/memory/episodic/recent", get(routes::recent_episodes))
        .route("/v1/memory/episodic/search", get(routes::search_episodes))
        // Semantic memory
        .route("/v1/memory/semantic", post(routes::store_semantic))
        .route("/v1/memory/semantic/search", post(routes::search_semantic))
        // Procedural memory
        .route("/v1/memory/procedural", post(routes::store_procedure))
        .route(
            "/v1/memory/procedural/search",
            get(routes::search_procedures),
        )
        // Plan contexts
        .route("/v1/plans", post(routes::create_plan).get(routes::list_plans))
        .route(
            "/v1/plans/by-correlation/:correlation_id",
            get(routes::get_plan_by_correlation),
        )
        .route(
            "/v1/plans/:plan_id",
            get(routes::get_plan)
                .patch(routes::update_plan)
                .delete(routes::delete_plan),
        )
        // Task contexts
        .route("/v1/tasks", post(routes::upsert_task))
        .route(
            "/v1/tasks/by-subtask/:sub_task_id",
            get(routes::get_task_by_subtask),
        )
        .route(
            "/v1/tasks/:task_id",
            get(routes::get_task)
                .patch(routes::update_task)
                .delete(routes::delete_task),
        )
        .route("/health", get(health))
        .with_state(state);

    let listener = TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("failed to bind port {}", config.port))?;
    tracing::info!("Memory Service listening on port {}", config.port);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.await;
            tracing::info!("shutting down Memory Service");
        })
        .await
        .context("memory server failed")?;

    tracing::info!("Memory Service shutdown complete");
    Ok(())
}

async fn health() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({ "status": "healthy" }))
}
