// HTTP surface of the Memory Service
//
// Tenant scope comes from the X-Tenant-ID header; the acting user from the
// user_id query parameter (SDK convention) with X-User-ID as fallback.
// Handlers delegate to the store on the blocking pool - rusqlite calls must
// not run on the async runtime.

mod episodic;
mod plans;
mod procedural;
mod semantic;
mod tasks;
mod working;

pub use episodic::{append_episode, recent_episodes, search_episodes};
pub use plans::{create_plan, delete_plan, get_plan, get_plan_by_correlation, list_plans, update_plan};
pub use procedural::{search_procedures, store_procedure};
pub use semantic::{search_semantic, store_semantic};
pub use tasks::{delete_task, get_task, get_task_by_subtask, update_task, upsert_task};
pub use working::{delete_working_key, delete_working_plan, get_working, list_working, set_working};

use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use super::store::{MemoryStore, Scope};

#[derive(Clone)]
pub struct MemoryState {
    pub store: MemoryStore,
}

/// Memory error responses, converted to HTTP status codes via IntoResponse.
#[derive(Debug)]
pub enum MemoryError {
    /// Missing scope, bad enum value, malformed body -> 422
    Validation(String),
    NotFound(String),
    Internal(String),
}

impl IntoResponse for MemoryError {
    fn into_response(self) -> axum::response::Response {
        let (status, detail) = match self {
            MemoryError::Validation(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg),
            MemoryError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            MemoryError::Internal(msg) => {
                tracing::error!("memory internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal error".to_string(),
                )
            }
        };
        (status, Json(json!({ "detail": detail }))).into_response()
    }
}

/// Query parameter carrying the acting user (SDK convention).
#[derive(Debug, Deserialize, Default)]
pub struct UserParam {
    pub user_id: Option<String>,
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .filter(|s| !s.is_empty())
}

/// Resolve the (tenant, user) scope for a request.
pub fn request_scope(headers: &HeaderMap, user_param: Option<String>) -> Result<Scope, MemoryError> {
    let tenant_id = header_value(headers, "x-tenant-id").ok_or_else(|| {
        MemoryError::Validation("X-Tenant-ID header is required".to_string())
    })?;
    let user_id = user_param
        .filter(|u| !u.is_empty())
        .or_else(|| header_value(headers, "x-user-id"))
        .ok_or_else(|| {
            MemoryError::Validation(
                "user_id query parameter or X-User-ID header is required".to_string(),
            )
        })?;
    Ok(Scope::new(tenant_id, user_id))
}

/// Tenant-only scope for plan/task routes (rows are keyed by tenant).
pub fn request_tenant(headers: &HeaderMap) -> Result<String, MemoryError> {
    header_value(headers, "x-tenant-id")
        .ok_or_else(|| MemoryError::Validation("X-Tenant-ID header is required".to_string()))
}

/// Run a blocking store call off the async runtime.
pub async fn blocking<T: Send + 'static>(
    f: impl FnOnce() -> anyhow::Result<T> + Send + 'static,
) -> Result<T, MemoryError> {
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| MemoryError::Internal(format!("store task panicked: {}", e)))?
        .map_err(|e| MemoryError::Internal(format!("{:#}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_requires_tenant_header() {
        let headers = HeaderMap::new();
        assert!(matches!(
            request_scope(&headers, Some("u1".into())),
            Err(MemoryError::Validation(_))
        ));
    }

    #[test]
    fn user_param_takes_precedence_over_header() {
        let mut headers = HeaderMap::new();
        headers.insert("x-tenant-id", "t1".parse().unwrap());
        headers.insert("x-user-id", "header-user".parse().unwrap());

        let scope = request_scope(&headers, Some("param-user".into())).unwrap();
        assert_eq!(scope.user_id, "param-user");

        let scope = request_scope(&headers, None).unwrap();
        assert_eq!(scope.user_id, "header-user");
    }

    #[test]
    fn missing_user_is_a_validation_error() {
        let mut headers = HeaderMap::new();
        headers.insert("x-tenant-id", "t1".parse().unwrap());
        assert!(matches!(
            request_scope(&headers, None),
            Err(MemoryError::Validation(_))
        ));
    }
}
