// Typed HTTP clients for the three platform services
//
// Thin wrappers around reqwest with the SDK's timeout policy: 10s per call,
// 30s for publishes, and no read timeout on the SSE stream. The SSE parser
// is a plain incremental state machine over the byte stream so it can be
// tested without a connection.

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;

use crate::events::EventEnvelope;
use crate::memory::dto::{
    EpisodicDto, PlanDto, ProceduralDto, SemanticDto, TaskDto, WorkingMemoryDto,
};
use crate::memory::store::{PlanStatus, Role};

/// Default per-call timeout for registry/memory requests.
pub const CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Publishes get longer because they sit on the hot path of busy flows.
pub const PUBLISH_TIMEOUT: Duration = Duration::from_secs(30);

fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()
        .expect("failed to build HTTP client")
}

// ─────────────────────────────────────────────────────────────────────────────
// Event Service client
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct EventClient {
    http: reqwest::Client,
    base_url: String,
}

impl EventClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: http_client(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Publish one envelope; returns the event id the service confirmed.
    pub async fn publish(&self, envelope: &EventEnvelope) -> Result<String> {
        let response = self
            .http
            .post(format!("{}/v1/events/publish", self.base_url))
            .timeout(PUBLISH_TIMEOUT)
            .json(&json!({ "event": envelope }))
            .send()
            .await
            .context("publish request failed")?;

        if !response.status().is_success() {
            return Err(anyhow!("publish rejected: HTTP {}", response.status()));
        }
        let body: Value = response.json().await.context("invalid publish response")?;
        Ok(body
            .get("eventId")
            .and_then(|v| v.as_str())
            .unwrap_or(&envelope.id)
            .to_string())
    }

    /// Open the SSE stream. Read is unbounded - the connection is long-lived
    /// and silence is broken by server heartbeats.
    pub async fn open_stream(
        &self,
        topics: &[String],
        agent_id: &str,
        agent_name: Option<&str>,
    ) -> Result<reqwest::Response> {
        let mut query: Vec<(&str, String)> = vec![
            ("topics", topics.join(",")),
            ("agent_id", agent_id.to_string()),
        ];
        if let Some(name) = agent_name {
            query.push(("agent_name", name.to_string()));
        }

        let response = self
            .http
            .get(format!("{}/v1/events/stream", self.base_url))
            .query(&query)
            .send()
            .await
            .context("stream request failed")?;

        if !response.status().is_success() {
            return Err(anyhow!("stream rejected: HTTP {}", response.status()));
        }
        Ok(response)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// SSE frame parsing
// ─────────────────────────────────────────────────────────────────────────────

/// One complete server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: String,
    pub data: String,
}

/// Incremental SSE parser. Feed raw chunks as they arrive; complete frames
/// come out. Unterminated trailing lines stay buffered until the next chunk.
#[derive(Default)]
pub struct SseParser {
    buffer: String,
    event: Option<String>,
    data: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &str) -> Vec<SseFrame> {
        self.buffer.push_str(chunk);
        let mut frames = Vec::new();

        while let Some(newline) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline).collect();
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                // Blank line terminates the frame.
                if !self.data.is_empty() || self.event.is_some() {
                    frames.push(SseFrame {
                        event: self.event.take().unwrap_or_else(|| "message".to_string()),
                        data: self.data.join("\n"),
                    });
                    self.data.clear();
                }
            } else if let Some(value) = line.strip_prefix("event:") {
                self.event = Some(value.trim().to_string());
            } else if let Some(value) = line.strip_prefix("data:") {
                self.data.push(value.trim_start().to_string());
            }
            // Comments (":...") and unknown fields are ignored.
        }

        frames
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Registry client
// ─────────────────────────────────────────────────────────────────────────────

/// SDK-flat registration body.
#[derive(Debug, Clone, Serialize)]
pub struct AgentRegistration {
    pub agent_id: String,
    pub name: String,
    pub agent_type: String,
    pub capabilities: Vec<String>,
    pub events_consumed: Vec<String>,
    pub events_produced: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, Value>>,
}

#[derive(Clone)]
pub struct RegistryClient {
    http: reqwest::Client,
    base_url: String,
}

impl RegistryClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: http_client(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub async fn register(&self, registration: &AgentRegistration) -> Result<bool> {
        let response = self
            .http
            .post(format!("{}/v1/agents", self.base_url))
            .timeout(CALL_TIMEOUT)
            .json(registration)
            .send()
            .await
            .context("registration request failed")?;
        Ok(response.status().is_success())
    }

    pub async fn heartbeat(&self, agent_id: &str) -> Result<bool> {
        let response = self
            .http
            .put(format!("{}/v1/agents/{}/heartbeat", self.base_url, agent_id))
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .context("heartbeat request failed")?;
        Ok(response.status().is_success())
    }

    pub async fn deregister(&self, agent_id: &str) -> Result<bool> {
        let response = self
            .http
            .delete(format!("{}/v1/agents/{}", self.base_url, agent_id))
            .timeout(CALL_TIMEOUT)
            .send()
            .await
            .context("deregistration request failed")?;
        Ok(response.status().is_success())
    }

    /// Discovery: agents currently consuming `event_name`.
    pub async fn find_consumers(&self, event_name: &str) -> Result<Vec<Value>> {
        let response = self
            .http
            .get(format!("{}/v1/agents", self.base_url))
            .query(&[("consumed_event", event_name)])
            .timeout(CALL_TIMEOUT)
            .send()
            .await
            .context("discovery request failed")?;

        let body: Value = response.json().await.context("invalid discovery response")?;
        Ok(body
            .get("agents")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default())
    }

    /// Register an event definition (name, topic, schema).
    pub async fn register_event(&self, definition: &Value) -> Result<bool> {
        let response = self
            .http
            .post(format!("{}/v1/events", self.base_url))
            .timeout(CALL_TIMEOUT)
            .json(&json!({ "event": definition }))
            .send()
            .await
            .context("event registration failed")?;
        Ok(response.status().is_success())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Memory client
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct MemoryClient {
    http: reqwest::Client,
    base_url: String,
    tenant_id: String,
    user_id: String,
}

impl MemoryClient {
    pub fn new(
        base_url: impl Into<String>,
        tenant_id: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            http: http_client(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            tenant_id: tenant_id.into(),
            user_id: user_id.into(),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, format!("{}{}", self.base_url, path))
            .timeout(CALL_TIMEOUT)
            .header("X-Tenant-ID", &self.tenant_id)
            .header("X-User-ID", &self.user_id)
            .query(&[("user_id", &self.user_id)])
    }

    async fn expect_json<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
        what: &str,
    ) -> Result<T> {
        if !response.status().is_success() {
            return Err(anyhow!("{} failed: HTTP {}", what, response.status()));
        }
        response
            .json()
            .await
            .with_context(|| format!("invalid {} response", what))
    }

    // ── Working memory ───────────────────────────────────────────────────────

    pub async fn working_store(
        &self,
        plan_id: &str,
        key: &str,
        value: &Value,
    ) -> Result<WorkingMemoryDto> {
        let response = self
            .request(
                reqwest::Method::PUT,
                &format!("/v1/memory/working/{}/{}", plan_id, key),
            )
            .json(&json!({ "value": value }))
            .send()
            .await?;
        Self::expect_json(response, "working store").await
    }

    pub async fn working_retrieve(
        &self,
        plan_id: &str,
        key: &str,
    ) -> Result<Option<WorkingMemoryDto>> {
        let response = self
            .request(
                reqwest::Method::GET,
                &format!("/v1/memory/working/{}/{}", plan_id, key),
            )
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(Self::expect_json(response, "working retrieve").await?))
    }

    /// Idempotent: reports whether the key existed.
    pub async fn working_delete(&self, plan_id: &str, key: &str) -> Result<bool> {
        let response = self
            .request(
                reqwest::Method::DELETE,
                &format!("/v1/memory/working/{}/{}", plan_id, key),
            )
            .send()
            .await?;
        let body: Value = Self::expect_json(response, "working delete").await?;
        Ok(body.get("deleted").and_then(|v| v.as_bool()).unwrap_or(false))
    }

    pub async fn working_delete_plan(&self, plan_id: &str) -> Result<usize> {
        let response = self
            .request(
                reqwest::Method::DELETE,
                &format!("/v1/memory/working/{}", plan_id),
            )
            .send()
            .await?;
        let body: Value = Self::expect_json(response, "working plan delete").await?;
        Ok(body
            .get("countDeleted")
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as usize)
    }

    // ── Episodic memory ──────────────────────────────────────────────────────

    pub async fn log_interaction(
        &self,
        agent_id: &str,
        role: Role,
        content: &str,
        metadata: Option<Value>,
    ) -> Result<EpisodicDto> {
        let response = self
            .request(reqwest::Method::POST, "/v1/memory/episodic")
            .json(&json!({
                "agent_id": agent_id,
                "role": role,
                "content": content,
                "metadata": metadata,
            }))
            .send()
            .await?;
        Self::expect_json(response, "episodic append").await
    }

    pub async fn recent_history(
        &self,
        agent_id: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<EpisodicDto>> {
        let mut request = self.request(reqwest::Method::GET, "/v1/memory/episodic/recent");
        if let Some(agent_id) = agent_id {
            request = request.query(&[("agent_id", agent_id)]);
        }
        if let Some(limit) = limit {
            request = request.query(&[("limit", limit.to_string())]);
        }
        Self::expect_json(request.send().await?, "episodic recent").await
    }

    pub async fn search_interactions(
        &self,
        agent_id: Option<&str>,
        query: &str,
        limit: Option<usize>,
    ) -> Result<Vec<EpisodicDto>> {
        let mut request = self
            .request(reqwest::Method::GET, "/v1/memory/episodic/search")
            .query(&[("q", query)]);
        if let Some(agent_id) = agent_id {
            request = request.query(&[("agent_id", agent_id)]);
        }
        if let Some(limit) = limit {
            request = request.query(&[("limit", limit.to_string())]);
        }
        Self::expect_json(request.send().await?, "episodic search").await
    }

    // ── Semantic memory ──────────────────────────────────────────────────────

    pub async fn store_knowledge(
        &self,
        content: &str,
        external_id: Option<&str>,
        is_public: bool,
        metadata: Option<Value>,
    ) -> Result<SemanticDto> {
        let response = self
            .request(reqwest::Method::POST, "/v1/memory/semantic")
            .json(&json!({
                "content": content,
                "externalId": external_id,
                "isPublic": is_public,
                "metadata": metadata,
            }))
            .send()
            .await?;
        Self::expect_json(response, "semantic store").await
    }

    pub async fn search_knowledge(
        &self,
        query: &str,
        limit: Option<usize>,
        include_public: bool,
    ) -> Result<Vec<SemanticDto>> {
        let response = self
            .request(reqwest::Method::POST, "/v1/memory/semantic/search")
            .json(&json!({
                "query": query,
                "limit": limit,
                "includePublic": include_public,
            }))
            .send()
            .await?;
        Self::expect_json(response, "semantic search").await
    }

    // ── Procedural memory ────────────────────────────────────────────────────

    pub async fn store_procedure(
        &self,
        agent_id: &str,
        procedure_type: &str,
        trigger_condition: &str,
        content: &str,
    ) -> Result<ProceduralDto> {
        let response = self
            .request(reqwest::Method::POST, "/v1/memory/procedural")
            .json(&json!({
                "agent_id": agent_id,
                "procedure_type": procedure_type,
                "trigger_condition": trigger_condition,
                "content": content,
            }))
            .send()
            .await?;
        Self::expect_json(response, "procedural store").await
    }

    /// Procedures whose trigger condition matches the current situation.
    pub async fn get_relevant_skills(
        &self,
        agent_id: Option<&str>,
        situation: &str,
        limit: Option<usize>,
    ) -> Result<Vec<ProceduralDto>> {
        let mut request = self
            .request(reqwest::Method::GET, "/v1/memory/procedural/search")
            .query(&[("q", situation)]);
        if let Some(agent_id) = agent_id {
            request = request.query(&[("agent_id", agent_id)]);
        }
        if let Some(limit) = limit {
            request = request.query(&[("limit", limit.to_string())]);
        }
        Self::expect_json(request.send().await?, "procedural search").await
    }

    // ── Plan contexts ────────────────────────────────────────────────────────

    pub async fn create_plan(&self, plan: &Value) -> Result<PlanDto> {
        let response = self
            .request(reqwest::Method::POST, "/v1/plans")
            .json(plan)
            .send()
            .await?;
        Self::expect_json(response, "plan create").await
    }

    pub async fn get_plan(&self, plan_id: &str) -> Result<Option<PlanDto>> {
        let response = self
            .request(reqwest::Method::GET, &format!("/v1/plans/{}", plan_id))
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(Self::expect_json(response, "plan get").await?))
    }

    pub async fn get_plan_by_correlation(&self, correlation_id: &str) -> Result<Option<PlanDto>> {
        let response = self
            .request(
                reqwest::Method::GET,
                &format!("/v1/plans/by-correlation/{}", correlation_id),
            )
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(
            Self::expect_json(response, "plan by correlation").await?,
        ))
    }

    pub async fn update_plan(
        &self,
        plan_id: &str,
        status: Option<PlanStatus>,
        state: Option<&Value>,
        current_state: Option<&str>,
        correlation_ids: Option<&[String]>,
    ) -> Result<Option<PlanDto>> {
        let response = self
            .request(reqwest::Method::PATCH, &format!("/v1/plans/{}", plan_id))
            .json(&json!({
                "status": status,
                "state": state,
                "currentState": current_state,
                "correlationIds": correlation_ids,
            }))
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(Self::expect_json(response, "plan update").await?))
    }

    /// Deletes the plan and its working memory.
    pub async fn delete_plan(&self, plan_id: &str) -> Result<bool> {
        let response = self
            .request(reqwest::Method::DELETE, &format!("/v1/plans/{}", plan_id))
            .send()
            .await?;
        Ok(response.status().is_success())
    }

    // ── Task contexts ────────────────────────────────────────────────────────

    pub async fn upsert_task(&self, task: &Value) -> Result<TaskDto> {
        let response = self
            .request(reqwest::Method::POST, "/v1/tasks")
            .json(task)
            .send()
            .await?;
        Self::expect_json(response, "task upsert").await
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Option<TaskDto>> {
        let response = self
            .request(reqwest::Method::GET, &format!("/v1/tasks/{}", task_id))
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(Self::expect_json(response, "task get").await?))
    }

    /// The parent task of a sub-task id, if any row claims it.
    pub async fn get_task_by_subtask(&self, sub_task_id: &str) -> Result<Option<TaskDto>> {
        let response = self
            .request(
                reqwest::Method::GET,
                &format!("/v1/tasks/by-subtask/{}", sub_task_id),
            )
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(Self::expect_json(response, "task by subtask").await?))
    }

    pub async fn update_task(
        &self,
        task_id: &str,
        sub_tasks: Option<&[String]>,
        state: Option<&Value>,
    ) -> Result<Option<TaskDto>> {
        let response = self
            .request(reqwest::Method::PATCH, &format!("/v1/tasks/{}", task_id))
            .json(&json!({
                "subTasks": sub_tasks,
                "state": state,
            }))
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(Self::expect_json(response, "task update").await?))
    }

    pub async fn delete_task(&self, task_id: &str) -> Result<bool> {
        let response = self
            .request(reqwest::Method::DELETE, &format!("/v1/tasks/{}", task_id))
            .send()
            .await?;
        Ok(response.status().is_success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parser_assembles_frames_across_chunks() {
        let mut parser = SseParser::new();

        assert!(parser.feed("event: conn").is_empty());
        let frames = parser.feed("ected\ndata: {\"connection_id\": \"c1\"}\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event, "connected");
        assert_eq!(frames[0].data, "{\"connection_id\": \"c1\"}");
    }

    #[test]
    fn parser_handles_multiple_frames_in_one_chunk() {
        let mut parser = SseParser::new();
        let frames = parser.feed(
            "event: message\ndata: {\"id\":\"E1\"}\n\nevent: heartbeat\ndata: {}\n\n",
        );
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].event, "message");
        assert_eq!(frames[1].event, "heartbeat");
    }

    #[test]
    fn parser_defaults_event_name_and_joins_data_lines() {
        let mut parser = SseParser::new();
        let frames = parser.feed("data: line1\ndata: line2\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event, "message");
        assert_eq!(frames[0].data, "line1\nline2");
    }

    #[test]
    fn parser_ignores_comments_and_crlf() {
        let mut parser = SseParser::new();
        let frames = parser.feed(": keepalive\r\nevent: message\r\ndata: {}\r\n\r\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "{}");
    }
}
