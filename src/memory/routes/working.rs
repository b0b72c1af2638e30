// Working memory endpoints - plan-scoped key/value CRUD

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::Json;

use super::{blocking, request_scope, MemoryError, MemoryState, UserParam};
use crate::memory::dto::{
    DeleteKeyResponse, DeletePlanResponse, WorkingMemoryDto, WorkingSetRequest,
};

/// PUT /v1/memory/working/{plan_id}/{key} - upsert one key.
pub async fn set_working(
    State(state): State<MemoryState>,
    Path((plan_id, key)): Path<(String, String)>,
    Query(user): Query<UserParam>,
    headers: HeaderMap,
    Json(request): Json<WorkingSetRequest>,
) -> Result<Json<WorkingMemoryDto>, MemoryError> {
    let scope = request_scope(&headers, user.user_id)?;
    let store = state.store.clone();
    let record =
        blocking(move || store.working_set(&scope, &plan_id, &key, &request.value)).await?;
    Ok(Json(record.into()))
}

/// GET /v1/memory/working/{plan_id}/{key}
pub async fn get_working(
    State(state): State<MemoryState>,
    Path((plan_id, key)): Path<(String, String)>,
    Query(user): Query<UserParam>,
    headers: HeaderMap,
) -> Result<Json<WorkingMemoryDto>, MemoryError> {
    let scope = request_scope(&headers, user.user_id)?;
    let store = state.store.clone();
    let lookup_key = key.clone();
    let record = blocking(move || store.working_get(&scope, &plan_id, &lookup_key)).await?;

    record
        .map(|r| Json(r.into()))
        .ok_or_else(|| MemoryError::NotFound(format!("key '{}' not found", key)))
}

/// GET /v1/memory/working/{plan_id} - all keys of a plan.
pub async fn list_working(
    State(state): State<MemoryState>,
    Path(plan_id): Path<String>,
    Query(user): Query<UserParam>,
    headers: HeaderMap,
) -> Result<Json<Vec<WorkingMemoryDto>>, MemoryError> {
    let scope = request_scope(&headers, user.user_id)?;
    let store = state.store.clone();
    let records = blocking(move || store.working_list(&scope, &plan_id)).await?;
    Ok(Json(records.into_iter().map(Into::into).collect()))
}

/// DELETE /v1/memory/working/{plan_id}/{key} - idempotent single delete.
/// A missing key reports deleted=false, never an error.
pub async fn delete_working_key(
    State(state): State<MemoryState>,
    Path((plan_id, key)): Path<(String, String)>,
    Query(user): Query<UserParam>,
    headers: HeaderMap,
) -> Result<Json<DeleteKeyResponse>, MemoryError> {
    let scope = request_scope(&headers, user.user_id)?;
    let store = state.store.clone();
    let deleted = blocking(move || store.working_delete_key(&scope, &plan_id, &key)).await?;
    Ok(Json(DeleteKeyResponse {
        success: true,
        deleted,
    }))
}

/// DELETE /v1/memory/working/{plan_id} - drop every key of the plan.
pub async fn delete_working_plan(
    State(state): State<MemoryState>,
    Path(plan_id): Path<String>,
    Query(user): Query<UserParam>,
    headers: HeaderMap,
) -> Result<Json<DeletePlanResponse>, MemoryError> {
    let scope = request_scope(&headers, user.user_id)?;
    let store = state.store.clone();
    let count_deleted = blocking(move || store.working_delete_plan(&scope, &plan_id)).await?;
    Ok(Json(DeletePlanResponse {
        success: true,
        count_deleted,
    }))
}
