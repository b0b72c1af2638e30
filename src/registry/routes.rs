// HTTP handlers for the Registry Service
//
// Event registry (POST/GET /v1/events) and agent registry (POST/GET
// /v1/agents, heartbeat, delete). Registration is always an upsert; the SDK
// sends a flat registration shape in which capabilities may be bare strings.
// Query results pass through the TTL read caches keyed by their parameters.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::cache::TtlCache;
use super::store::{AgentDefinition, AgentQuery, Capability, EventDefinition, RegistryStore};
use crate::config::RegistryConfig;

// ─────────────────────────────────────────────────────────────────────────────
// State and errors
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct RegistryState {
    pub store: RegistryStore,
    pub event_cache: Arc<TtlCache<Value>>,
    pub agent_cache: Arc<TtlCache<Value>>,
    pub config: Arc<RegistryConfig>,
}

/// Registry error responses, converted to HTTP status codes via IntoResponse.
#[derive(Debug)]
pub enum RegistryError {
    BadRequest(String),
    NotFound(String),
    Internal(String),
}

impl IntoResponse for RegistryError {
    fn into_response(self) -> axum::response::Response {
        let (status, detail) = match self {
            RegistryError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            RegistryError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            RegistryError::Internal(msg) => {
                tracing::error!("registry internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal error".to_string(),
                )
            }
        };
        (status, Json(json!({ "detail": detail }))).into_response()
    }
}

/// Run a blocking store call off the async runtime.
async fn blocking<T: Send + 'static>(
    f: impl FnOnce() -> anyhow::Result<T> + Send + 'static,
) -> Result<T, RegistryError> {
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| RegistryError::Internal(format!("store task panicked: {}", e)))?
        .map_err(|e| RegistryError::Internal(format!("{:#}", e)))
}

// ─────────────────────────────────────────────────────────────────────────────
// Event registry
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct EventRegistrationRequest {
    pub event: EventDefinition,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRegistrationResponse {
    pub success: bool,
    pub event_name: String,
    pub message: String,
}

/// POST /v1/events - upsert an event definition by name.
pub async fn register_event(
    State(state): State<RegistryState>,
    Json(request): Json<EventRegistrationRequest>,
) -> Result<Json<EventRegistrationResponse>, RegistryError> {
    let def = request.event;
    if def.event_name.trim().is_empty() {
        return Err(RegistryError::BadRequest(
            "event_name must not be empty".to_string(),
        ));
    }

    let store = state.store.clone();
    let stored = blocking(move || store.upsert_event(&def)).await?;
    state.event_cache.clear();

    tracing::info!(event_name = %stored.event_name, "event definition registered");
    Ok(Json(EventRegistrationResponse {
        success: true,
        event_name: stored.event_name,
        message: "registered".to_string(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct EventFilter {
    pub event_name: Option<String>,
    pub topic: Option<String>,
}

/// GET /v1/events - query definitions; no filters lists everything.
pub async fn query_events(
    State(state): State<RegistryState>,
    Query(filter): Query<EventFilter>,
) -> Result<Json<Value>, RegistryError> {
    let cache_key = format!("events:{:?}:{:?}", filter.event_name, filter.topic);
    if let Some(cached) = state.event_cache.get(&cache_key) {
        return Ok(Json(cached));
    }

    let store = state.store.clone();
    let events = blocking(move || {
        store.query_events(filter.event_name.as_deref(), filter.topic.as_deref())
    })
    .await?;

    let response = json!({ "count": events.len(), "events": events });
    state.event_cache.insert(cache_key, response.clone());
    Ok(Json(response))
}

// ─────────────────────────────────────────────────────────────────────────────
// Agent registry
// ─────────────────────────────────────────────────────────────────────────────

/// A capability in the SDK registration body: either a bare task name or a
/// full capability object.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum CapabilitySpec {
    Name(String),
    Full(Capability),
}

impl CapabilitySpec {
    fn into_capability(self) -> Capability {
        match self {
            // Bare names carry no event wiring yet; "unknown" marks the
            // consumed event until the agent registers a full capability.
            CapabilitySpec::Name(task_name) => Capability {
                description: format!("Capability: {}", task_name),
                task_name,
                consumed_event: "unknown".to_string(),
                produced_events: Vec::new(),
            },
            CapabilitySpec::Full(capability) => capability,
        }
    }
}

/// Registration body in the SDK's flat shape.
#[derive(Debug, Deserialize)]
pub struct AgentRegistrationRequest {
    #[serde(alias = "agentId")]
    pub agent_id: String,
    pub name: String,
    #[serde(default, alias = "agentType")]
    pub agent_type: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<CapabilitySpec>,
    #[serde(default, alias = "eventsConsumed")]
    pub events_consumed: Vec<String>,
    #[serde(default, alias = "eventsProduced")]
    pub events_produced: Vec<String>,
    #[serde(default)]
    pub metadata: Option<HashMap<String, Value>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRegistrationResponse {
    pub success: bool,
    pub agent_id: String,
    pub message: String,
}

/// POST /v1/agents - upsert an agent by id.
///
/// Re-registration transactionally replaces the capability rows and resets
/// `last_heartbeat` to now.
pub async fn register_agent(
    State(state): State<RegistryState>,
    Json(request): Json<AgentRegistrationRequest>,
) -> Result<Json<AgentRegistrationResponse>, RegistryError> {
    if request.agent_id.trim().is_empty() {
        return Err(RegistryError::BadRequest(
            "agent_id must not be empty".to_string(),
        ));
    }

    let description = request
        .metadata
        .as_ref()
        .and_then(|m| m.get("description"))
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();

    let definition = AgentDefinition {
        agent_id: request.agent_id.clone(),
        name: request.name,
        description,
        capabilities: request
            .capabilities
            .into_iter()
            .map(CapabilitySpec::into_capability)
            .collect(),
        consumed_events: request.events_consumed,
        produced_events: request.events_produced,
        last_heartbeat: None,
    };

    let store = state.store.clone();
    let (stored, created) = blocking(move || store.upsert_agent(&definition)).await?;
    state.agent_cache.clear();

    tracing::info!(agent_id = %stored.agent_id, created, "agent registered");
    Ok(Json(AgentRegistrationResponse {
        success: true,
        agent_id: stored.agent_id,
        message: if created { "registered" } else { "updated" }.to_string(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct AgentFilter {
    pub agent_id: Option<String>,
    pub name: Option<String>,
    pub consumed_event: Option<String>,
    pub produced_event: Option<String>,
    #[serde(default)]
    pub include_expired: bool,
}

/// GET /v1/agents - discovery query; active agents only by default.
pub async fn query_agents(
    State(state): State<RegistryState>,
    Query(filter): Query<AgentFilter>,
) -> Result<Json<Value>, RegistryError> {
    let cache_key = format!(
        "agents:{:?}:{:?}:{:?}:{:?}:{}",
        filter.agent_id,
        filter.name,
        filter.consumed_event,
        filter.produced_event,
        filter.include_expired
    );
    if let Some(cached) = state.agent_cache.get(&cache_key) {
        return Ok(Json(cached));
    }

    let query = AgentQuery {
        agent_id: filter.agent_id,
        name: filter.name,
        consumed_event: filter.consumed_event,
        produced_event: filter.produced_event,
        include_expired: filter.include_expired,
    };
    let ttl = state.config.agent_ttl_seconds;
    let store = state.store.clone();
    let agents = blocking(move || store.query_agents(&query, ttl)).await?;

    let response = json!({ "count": agents.len(), "agents": agents });
    state.agent_cache.insert(cache_key, response.clone());
    Ok(Json(response))
}

/// PUT|POST /v1/agents/{agent_id}/heartbeat - refresh the agent's TTL.
pub async fn heartbeat(
    State(state): State<RegistryState>,
    Path(agent_id): Path<String>,
) -> Result<Json<AgentRegistrationResponse>, RegistryError> {
    let store = state.store.clone();
    let id = agent_id.clone();
    let found = blocking(move || store.touch_heartbeat(&id)).await?;

    if !found {
        return Err(RegistryError::NotFound(format!(
            "Agent '{}' not found",
            agent_id
        )));
    }
    state.agent_cache.clear();

    Ok(Json(AgentRegistrationResponse {
        success: true,
        agent_id,
        message: "heartbeat".to_string(),
    }))
}

/// DELETE /v1/agents/{agent_id} - 204 on success, 404 when unknown.
pub async fn delete_agent(
    State(state): State<RegistryState>,
    Path(agent_id): Path<String>,
) -> Result<StatusCode, RegistryError> {
    let store = state.store.clone();
    let id = agent_id.clone();
    let deleted = blocking(move || store.delete_agent(&id)).await?;

    if !deleted {
        return Err(RegistryError::NotFound(format!(
            "Agent '{}' not found",
            agent_id
        )));
    }
    state.agent_cache.clear();

    tracing::info!(agent_id, "agent deleted");
    Ok(StatusCode::NO_CONTENT)
}

/// GET /health
pub async fn health(State(state): State<RegistryState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "agentTtlSeconds": state.config.agent_ttl_seconds,
    }))
}
