// Semantic memory endpoints - upsert and privacy-aware vector search

use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::Json;
use serde_json::json;

use super::{blocking, request_scope, MemoryError, MemoryState, UserParam};
use crate::memory::dto::{SemanticDto, SemanticSearchRequest, SemanticStoreRequest};
use crate::memory::store::SemanticUpsert;

/// POST /v1/memory/semantic?user_id=... - upsert one knowledge item.
///
/// Matching follows the upsert key rules: external_id when given, content
/// hash otherwise; scope depends on is_public. The embedding is regenerated
/// on every write.
pub async fn store_semantic(
    State(state): State<MemoryState>,
    Query(user): Query<UserParam>,
    headers: HeaderMap,
    Json(request): Json<SemanticStoreRequest>,
) -> Result<Json<SemanticDto>, MemoryError> {
    let scope = request_scope(&headers, user.user_id)?;
    if request.content.trim().is_empty() {
        return Err(MemoryError::Validation(
            "content must not be empty".to_string(),
        ));
    }

    let upsert = SemanticUpsert {
        content: request.content,
        external_id: request.external_id.filter(|e| !e.is_empty()),
        is_public: request.is_public,
        tags: request.tags.unwrap_or_default(),
        source: request.source,
        metadata: request.metadata.unwrap_or_else(|| json!({})),
    };

    let store = state.store.clone();
    let record = blocking(move || store.semantic_upsert(&scope, &upsert)).await?;
    Ok(Json(record.into()))
}

/// POST /v1/memory/semantic/search?user_id=... - similarity search under
/// the privacy rule (own rows plus public ones unless opted out).
pub async fn search_semantic(
    State(state): State<MemoryState>,
    Query(user): Query<UserParam>,
    headers: HeaderMap,
    Json(request): Json<SemanticSearchRequest>,
) -> Result<Json<Vec<SemanticDto>>, MemoryError> {
    let scope = request_scope(&headers, user.user_id)?;
    if request.query.trim().is_empty() {
        return Err(MemoryError::Validation(
            "query must not be empty".to_string(),
        ));
    }

    let store = state.store.clone();
    let records = blocking(move || {
        store.semantic_search(&scope, &request.query, request.limit, request.include_public)
    })
    .await?;
    Ok(Json(records.into_iter().map(Into::into).collect()))
}
