// HTTP and SSE handlers for the Event Service
//
// Three surfaces: the publish endpoint (HTTP -> bus), the SSE stream
// endpoint (bus -> HTTP), and two small read-only endpoints for health and
// connection debugging.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use crate::events::EventEnvelope;

use super::state::{ConnectionInfo, GatewayState, StreamQueue};

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Gateway error responses, converted to HTTP status codes via IntoResponse.
#[derive(Debug)]
pub enum GatewayError {
    /// Malformed envelope or query -> 422
    Validation(String),
    /// Bus backend not connected -> 503
    AdapterUnavailable(String),
    /// Everything else -> 500 with a short message; detail stays in the log
    Internal(String),
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> axum::response::Response {
        let (status, detail) = match self {
            GatewayError::Validation(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg),
            GatewayError::AdapterUnavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            GatewayError::Internal(msg) => {
                tracing::error!("gateway internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal error".to_string(),
                )
            }
        };
        (status, Json(json!({ "detail": detail }))).into_response()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Publish
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct PublishRequest {
    pub event: EventEnvelope,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishResponse {
    pub success: bool,
    pub event_id: String,
    pub message: String,
}

/// POST /v1/events/publish - validate and forward one envelope to the bus.
pub async fn publish_event(
    State(state): State<GatewayState>,
    Json(request): Json<PublishRequest>,
) -> Result<Json<PublishResponse>, GatewayError> {
    let event = request.event;
    event.validate().map_err(GatewayError::Validation)?;

    if !state.adapter.is_connected() {
        return Err(GatewayError::AdapterUnavailable(
            "event adapter not connected".to_string(),
        ));
    }

    let topic = event.topic.as_str();
    state
        .adapter
        .publish(topic, &event)
        .await
        .map_err(|e| GatewayError::Internal(e.to_string()))?;

    tracing::info!(event_id = %event.id, topic, "published event");

    Ok(Json(PublishResponse {
        success: true,
        event_id: event.id,
        message: format!("Event published to {}", topic),
    }))
}

// ─────────────────────────────────────────────────────────────────────────────
// SSE stream
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    /// Comma-separated topic patterns (wildcards allowed)
    pub topics: String,
    pub agent_id: String,
    /// Queue group override: instances sharing a name split the load
    pub agent_name: Option<String>,
}

/// GET /v1/events/stream - subscribe to topics over Server-Sent Events.
///
/// Frames: `connected` (once), `message` (per envelope), `heartbeat` (on
/// idle), `disconnected` (best effort on teardown). Data is always JSON.
pub async fn stream_events(
    State(state): State<GatewayState>,
    Query(query): Query<StreamQuery>,
) -> Result<Sse<ReceiverStream<Result<Event, Infallible>>>, GatewayError> {
    let topics: Vec<String> = query
        .topics
        .split(',')
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();
    if topics.is_empty() {
        return Err(GatewayError::Validation(
            "at least one topic is required".to_string(),
        ));
    }

    if !state.adapter.is_connected() {
        return Err(GatewayError::AdapterUnavailable(
            "event adapter not connected".to_string(),
        ));
    }

    let connection_id = Uuid::new_v4().to_string();
    // agent_name groups instances of the same logical agent for load
    // balancing; distinct names (or the agent_id fallback) keep broadcast
    // semantics.
    let queue_group = query
        .agent_name
        .clone()
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| query.agent_id.clone());

    tracing::info!(
        connection_id,
        agent_id = %query.agent_id,
        queue_group,
        ?topics,
        "new SSE connection"
    );

    let queue = Arc::new(StreamQueue::new(state.config.stream_max_queue_size));

    // The adapter callback only enqueues; it must never block or fail.
    let handler_queue = queue.clone();
    let handler: crate::bus::MessageHandler = Arc::new(move |_topic, envelope| {
        handler_queue.push(envelope);
        Box::pin(async { Ok(()) })
    });

    state
        .adapter
        .subscribe(
            topics.clone(),
            handler,
            Some(connection_id.clone()),
            Some(queue_group),
        )
        .await
        .map_err(|e| GatewayError::Internal(e.to_string()))?;

    state.register_connection(
        &connection_id,
        ConnectionInfo {
            agent_id: query.agent_id.clone(),
            topics: topics.clone(),
            queue: queue.clone(),
        },
    );

    // The stream loop runs in its own task; the handler returns as soon as
    // the channel is wired up. A dropped receiver (client went away) is the
    // disconnect signal.
    let (tx, rx) = mpsc::channel::<Result<Event, Infallible>>(16);
    tokio::spawn(run_stream(state, connection_id, query.agent_id, topics, queue, tx));

    Ok(Sse::new(ReceiverStream::new(rx)))
}

async fn run_stream(
    state: GatewayState,
    connection_id: String,
    agent_id: String,
    topics: Vec<String>,
    queue: Arc<StreamQueue>,
    tx: mpsc::Sender<Result<Event, Infallible>>,
) {
    let heartbeat = Duration::from_secs(state.config.stream_heartbeat_interval_s);
    let mut shutdown = state.shutdown_signal();

    let connected = sse_event(
        "connected",
        &json!({
            "connection_id": connection_id,
            "topics": topics,
            "agent_id": agent_id,
        }),
    );

    if tx.send(Ok(connected)).await.is_ok() {
        loop {
            // The flag may have flipped while this loop was mid-send; the
            // watch channel keeps the value, so it is never missed.
            if *shutdown.borrow() {
                break;
            }

            let step = tokio::select! {
                outcome = tokio::time::timeout(heartbeat, queue.pop()) => Some(outcome),
                _ = shutdown.changed() => None,
            };

            let frame = match step {
                // Server is shutting down.
                None => break,
                Some(Ok(envelope)) => match serde_json::to_value(&envelope) {
                    Ok(value) => sse_event("message", &value),
                    Err(e) => {
                        tracing::error!(connection_id, "envelope serialization failed: {}", e);
                        continue;
                    }
                },
                // Idle for a full interval: keep the connection alive.
                Some(Err(_)) => sse_event("heartbeat", &json!({ "connection_id": connection_id })),
            };

            if tx.send(Ok(frame)).await.is_err() {
                tracing::info!(connection_id, "client disconnected");
                break;
            }
        }
    }

    // Teardown: unsubscribe, drop from the table, then a best-effort
    // disconnected frame (the client is usually gone by now).
    tracing::info!(connection_id, "cleaning up connection");
    if let Err(e) = state.adapter.unsubscribe(&connection_id).await {
        tracing::warn!(connection_id, "unsubscribe failed: {}", e);
    }
    state.remove_connection(&connection_id);

    let goodbye = sse_event("disconnected", &json!({ "connection_id": connection_id }));
    let _ = tx.try_send(Ok(goodbye));
}

fn sse_event(name: &str, data: &serde_json::Value) -> Event {
    Event::default().event(name).data(data.to_string())
}

// ─────────────────────────────────────────────────────────────────────────────
// Health and admin
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub adapter: String,
    pub connected: bool,
    pub active_streams: usize,
}

/// GET /health
pub async fn health(State(state): State<GatewayState>) -> Json<HealthResponse> {
    let connected = state.adapter.is_connected();
    Json(HealthResponse {
        status: if connected { "healthy" } else { "degraded" }.to_string(),
        adapter: state.adapter.name().to_string(),
        connected,
        active_streams: state.active_streams(),
    })
}

/// GET /connections - debug listing of live streams.
pub async fn list_connections(State(state): State<GatewayState>) -> Json<serde_json::Value> {
    let connections = state.connections.lock().expect("connections poisoned");
    let listing: Vec<serde_json::Value> = connections
        .iter()
        .map(|(id, info)| {
            json!({
                "connectionId": id,
                "agentId": info.agent_id,
                "topics": info.topics,
                "queuedEvents": info.queue.len(),
                "droppedEvents": info.queue.dropped(),
            })
        })
        .collect();

    Json(json!({ "count": listing.len(), "connections": listing }))
}
