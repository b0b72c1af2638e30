// Task context endpoints
//
// Tasks are keyed (tenant_id, task_id); the by-subtask lookup is what lets
// a worker find the parent of an arriving result, whose correlation id is
// the sub-task id.

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use serde_json::json;

use super::{blocking, request_scope, request_tenant, MemoryError, MemoryState, UserParam};
use crate::memory::dto::{TaskDto, TaskUpdateRequest, TaskUpsertRequest};
use crate::memory::store::TaskRecord;
use crate::events::DEFAULT_RESPONSE_TOPIC;

/// POST /v1/tasks - insert or update a task context.
pub async fn upsert_task(
    State(state): State<MemoryState>,
    Query(user): Query<UserParam>,
    headers: HeaderMap,
    Json(request): Json<TaskUpsertRequest>,
) -> Result<Json<TaskDto>, MemoryError> {
    let scope = request_scope(&headers, user.user_id)?;
    if request.task_id.trim().is_empty() {
        return Err(MemoryError::Validation(
            "task_id must not be empty".to_string(),
        ));
    }

    let record = TaskRecord {
        tenant_id: scope.tenant_id.clone(),
        user_id: scope.user_id.clone(),
        task_id: request.task_id,
        plan_id: request.plan_id,
        event_type: request.event_type,
        response_event: request.response_event,
        response_topic: request
            .response_topic
            .unwrap_or_else(|| DEFAULT_RESPONSE_TOPIC.to_string()),
        data: request.data.unwrap_or_else(|| json!({})),
        sub_tasks: request.sub_tasks.unwrap_or_default(),
        state: request.state.unwrap_or_else(|| json!({})),
        created_at: None,
        updated_at: None,
    };

    let store = state.store.clone();
    let stored = blocking(move || store.task_upsert(&record)).await?;
    Ok(Json(stored.into()))
}

/// GET /v1/tasks/{task_id}
pub async fn get_task(
    State(state): State<MemoryState>,
    Path(task_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<TaskDto>, MemoryError> {
    let tenant_id = request_tenant(&headers)?;
    let store = state.store.clone();
    let lookup = task_id.clone();
    let record = blocking(move || store.task_get(&tenant_id, &lookup)).await?;
    record
        .map(|r| Json(r.into()))
        .ok_or_else(|| MemoryError::NotFound(format!("task '{}' not found", task_id)))
}

/// GET /v1/tasks/by-subtask/{sub_task_id} - the parent task of a sub-task.
pub async fn get_task_by_subtask(
    State(state): State<MemoryState>,
    Path(sub_task_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<TaskDto>, MemoryError> {
    let tenant_id = request_tenant(&headers)?;
    let store = state.store.clone();
    let lookup = sub_task_id.clone();
    let record = blocking(move || store.task_get_by_subtask(&tenant_id, &lookup)).await?;
    record.map(|r| Json(r.into())).ok_or_else(|| {
        MemoryError::NotFound(format!("no task owns sub-task '{}'", sub_task_id))
    })
}

/// PATCH /v1/tasks/{task_id} - update delegation bookkeeping.
pub async fn update_task(
    State(state): State<MemoryState>,
    Path(task_id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<TaskUpdateRequest>,
) -> Result<Json<TaskDto>, MemoryError> {
    let tenant_id = request_tenant(&headers)?;
    let store = state.store.clone();
    let lookup = task_id.clone();
    let record = blocking(move || {
        store.task_update(
            &tenant_id,
            &lookup,
            request.sub_tasks.as_deref(),
            request.state.as_ref(),
        )
    })
    .await?;
    record
        .map(|r| Json(r.into()))
        .ok_or_else(|| MemoryError::NotFound(format!("task '{}' not found", task_id)))
}

/// DELETE /v1/tasks/{task_id}
pub async fn delete_task(
    State(state): State<MemoryState>,
    Path(task_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, MemoryError> {
    let tenant_id = request_tenant(&headers)?;
    let store = state.store.clone();
    let lookup = task_id.clone();
    let deleted = blocking(move || store.task_delete(&tenant_id, &lookup)).await?;
    if !deleted {
        return Err(MemoryError::NotFound(format!(
            "task '{}' not found",
            task_id
        )));
    }
    Ok(Json(json!({ "success": true })))
}
