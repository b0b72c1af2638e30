// Procedural memory endpoints - store procedures, search by trigger

use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::Deserialize;

use super::{blocking, request_scope, MemoryError, MemoryState, UserParam};
use crate::memory::dto::{ProceduralDto, ProceduralStoreRequest};

/// POST /v1/memory/procedural?user_id=...
pub async fn store_procedure(
    State(state): State<MemoryState>,
    Query(user): Query<UserParam>,
    headers: HeaderMap,
    Json(request): Json<ProceduralStoreRequest>,
) -> Result<Json<ProceduralDto>, MemoryError> {
    let scope = request_scope(&headers, user.user_id)?;
    let store = state.store.clone();
    let record = blocking(move || {
        store.procedural_store(
            &scope,
            &request.agent_id,
            &request.procedure_type,
            &request.trigger_condition,
            &request.content,
        )
    })
    .await?;
    Ok(Json(record.into()))
}

#[derive(Debug, Deserialize, Default)]
pub struct ProceduralQuery {
    pub user_id: Option<String>,
    pub agent_id: Option<String>,
    pub q: Option<String>,
    pub limit: Option<usize>,
}

/// GET /v1/memory/procedural/search?agent_id&user_id&q&limit
pub async fn search_procedures(
    State(state): State<MemoryState>,
    Query(query): Query<ProceduralQuery>,
    headers: HeaderMap,
) -> Result<Json<Vec<ProceduralDto>>, MemoryError> {
    let scope = request_scope(&headers, query.user_id)?;
    let q = query
        .q
        .filter(|q| !q.is_empty())
        .ok_or_else(|| MemoryError::Validation("query parameter 'q' is required".to_string()))?;
    let limit = query.limit.unwrap_or(10).min(100);

    let store = state.store.clone();
    let records = blocking(move || {
        store.procedural_search(&scope, query.agent_id.as_deref(), &q, limit)
    })
    .await?;
    Ok(Json(records.into_iter().map(Into::into).collect()))
}
