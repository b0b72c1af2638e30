// Episodic memory endpoints - append, recency window, vector search

use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use super::{blocking, request_scope, MemoryError, MemoryState};
use crate::memory::dto::{EpisodicAppendRequest, EpisodicDto};

#[derive(Debug, Deserialize, Default)]
pub struct EpisodicQuery {
    pub user_id: Option<String>,
    pub agent_id: Option<String>,
    pub limit: Option<usize>,
    /// Search text (search endpoint only)
    pub q: Option<String>,
}

/// POST /v1/memory/episodic?user_id=... - append one interaction.
/// The content is embedded at append time.
pub async fn append_episode(
    State(state): State<MemoryState>,
    Query(query): Query<EpisodicQuery>,
    headers: HeaderMap,
    Json(request): Json<EpisodicAppendRequest>,
) -> Result<Json<EpisodicDto>, MemoryError> {
    let scope = request_scope(&headers, query.user_id)?;
    let store = state.store.clone();
    let record = blocking(move || {
        store.episodic_append(
            &scope,
            &request.agent_id,
            request.role,
            &request.content,
            request.metadata.unwrap_or_else(|| json!({})),
        )
    })
    .await?;
    Ok(Json(record.into()))
}

/// GET /v1/memory/episodic/recent?agent_id&user_id&limit - newest first.
pub async fn recent_episodes(
    State(state): State<MemoryState>,
    Query(query): Query<EpisodicQuery>,
    headers: HeaderMap,
) -> Result<Json<Vec<EpisodicDto>>, MemoryError> {
    let scope = request_scope(&headers, query.user_id)?;
    let store = state.store.clone();
    let records = blocking(move || {
        store.episodic_recent(&scope, query.agent_id.as_deref(), query.limit)
    })
    .await?;
    Ok(Json(records.into_iter().map(Into::into).collect()))
}

/// GET /v1/memory/episodic/search?agent_id&user_id&q&limit - similarity
/// order, scores attached.
pub async fn search_episodes(
    State(state): State<MemoryState>,
    Query(query): Query<EpisodicQuery>,
    headers: HeaderMap,
) -> Result<Json<Vec<EpisodicDto>>, MemoryError> {
    let scope = request_scope(&headers, query.user_id)?;
    let q = query
        .q
        .filter(|q| !q.is_empty())
        .ok_or_else(|| MemoryError::Validation("query parameter 'q' is required".to_string()))?;

    let store = state.store.clone();
    let records = blocking(move || {
        store.episodic_search(&scope, query.agent_id.as_deref(), &q, query.limit)
    })
    .await?;
    Ok(Json(records.into_iter().map(Into::into).collect()))
}
