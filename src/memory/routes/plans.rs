// Plan context endpoints
//
// Plans are keyed (tenant_id, plan_id); the user scope is recorded on the
// row for listing. Deleting a plan also clears its working memory.

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use super::{blocking, request_scope, request_tenant, MemoryError, MemoryState, UserParam};
use crate::memory::dto::{PlanCreateRequest, PlanDto, PlanUpdateRequest};
use crate::memory::store::{PlanFilter, PlanRecord, PlanStatus, PlanUpdate};

/// POST /v1/plans - persist a new plan.
///
/// The correlation_ids array always contains the plan id itself, so a
/// response carrying it as correlation id routes back to the plan.
pub async fn create_plan(
    State(state): State<MemoryState>,
    Query(user): Query<UserParam>,
    headers: HeaderMap,
    Json(request): Json<PlanCreateRequest>,
) -> Result<Json<PlanDto>, MemoryError> {
    let scope = request_scope(&headers, user.user_id)?;
    let plan_id = request
        .plan_id
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let mut correlation_ids = request.correlation_ids.unwrap_or_default();
    if !correlation_ids.iter().any(|c| c == &plan_id) {
        correlation_ids.push(plan_id.clone());
    }

    let record = PlanRecord {
        tenant_id: scope.tenant_id.clone(),
        user_id: scope.user_id.clone(),
        plan_id,
        session_id: request.session_id,
        goal_event: request.goal_event,
        goal_data: request.goal_data.unwrap_or_else(|| json!({})),
        response_event: request.response_event,
        status: request.status.unwrap_or(PlanStatus::Pending),
        state: request.state.unwrap_or_else(|| json!({})),
        current_state: request.current_state,
        correlation_ids,
        parent_plan_id: request.parent_plan_id,
        created_at: None,
        updated_at: None,
    };

    let store = state.store.clone();
    let stored = blocking(move || store.plan_create(&record)).await?;
    Ok(Json(stored.into()))
}

#[derive(Debug, Deserialize, Default)]
pub struct PlanListQuery {
    pub user_id: Option<String>,
    pub status: Option<PlanStatus>,
    pub session_id: Option<String>,
}

/// GET /v1/plans - list the caller's plans, optionally filtered.
pub async fn list_plans(
    State(state): State<MemoryState>,
    Query(query): Query<PlanListQuery>,
    headers: HeaderMap,
) -> Result<Json<Vec<PlanDto>>, MemoryError> {
    let scope = request_scope(&headers, query.user_id)?;
    let filter = PlanFilter {
        status: query.status,
        session_id: query.session_id,
    };
    let store = state.store.clone();
    let records = blocking(move || store.plan_list(&scope, &filter)).await?;
    Ok(Json(records.into_iter().map(Into::into).collect()))
}

/// GET /v1/plans/{plan_id}
pub async fn get_plan(
    State(state): State<MemoryState>,
    Path(plan_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<PlanDto>, MemoryError> {
    let tenant_id = request_tenant(&headers)?;
    let store = state.store.clone();
    let lookup = plan_id.clone();
    let record = blocking(move || store.plan_get(&tenant_id, &lookup)).await?;
    record
        .map(|r| Json(r.into()))
        .ok_or_else(|| MemoryError::NotFound(format!("plan '{}' not found", plan_id)))
}

/// GET /v1/plans/by-correlation/{correlation_id} - the plan whose
/// correlation_ids array contains the argument.
pub async fn get_plan_by_correlation(
    State(state): State<MemoryState>,
    Path(correlation_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<PlanDto>, MemoryError> {
    let tenant_id = request_tenant(&headers)?;
    let store = state.store.clone();
    let lookup = correlation_id.clone();
    let record = blocking(move || store.plan_get_by_correlation(&tenant_id, &lookup)).await?;
    record.map(|r| Json(r.into())).ok_or_else(|| {
        MemoryError::NotFound(format!("no plan for correlation '{}'", correlation_id))
    })
}

/// PATCH /v1/plans/{plan_id} - partial update of the state machine record.
pub async fn update_plan(
    State(state): State<MemoryState>,
    Path(plan_id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<PlanUpdateRequest>,
) -> Result<Json<PlanDto>, MemoryError> {
    let tenant_id = request_tenant(&headers)?;
    let update = PlanUpdate {
        status: request.status,
        state: request.state,
        current_state: request.current_state,
        correlation_ids: request.correlation_ids,
    };
    let store = state.store.clone();
    let lookup = plan_id.clone();
    let record = blocking(move || store.plan_update(&tenant_id, &lookup, &update)).await?;
    record
        .map(|r| Json(r.into()))
        .ok_or_else(|| MemoryError::NotFound(format!("plan '{}' not found", plan_id)))
}

/// DELETE /v1/plans/{plan_id} - removes the plan and its working memory.
pub async fn delete_plan(
    State(state): State<MemoryState>,
    Path(plan_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, MemoryError> {
    let tenant_id = request_tenant(&headers)?;
    let store = state.store.clone();
    let lookup = plan_id.clone();
    let deleted = blocking(move || store.plan_delete(&tenant_id, &lookup)).await?;
    if !deleted {
        return Err(MemoryError::NotFound(format!(
            "plan '{}' not found",
            plan_id
        )));
    }
    Ok(Json(json!({ "success": true })))
}
