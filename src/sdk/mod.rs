// Agent SDK - the client-side contract of the platform
//
// An agent process: connects to the Event Service stream, registers itself
// at the Registry (failure leaves it in offline mode, never exits), keeps a
// heartbeat loop alive with re-registration and capped backoff, and
// dispatches incoming envelopes to its handler table. Request/response
// helpers enforce the correlation contract; plan/task handles encode the
// orchestration conventions.

pub mod client;
mod handlers;
pub mod plan;
pub mod task;

pub use client::{AgentRegistration, EventClient, MemoryClient, RegistryClient, SseParser};
pub use handlers::{EventHandler, HandlerTable, WILDCARD_EVENT};
pub use plan::PlanHandle;
pub use task::{DelegationSpec, TaskHandle};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::events::{EventEnvelope, EventTopic};

/// Default heartbeat cadence.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Default deadline for `request`.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Logical name; instances sharing it load-balance via queue groups
    pub name: String,
    /// Unique per process
    pub agent_id: String,
    pub agent_type: String,
    pub event_service_url: String,
    pub registry_url: String,
    pub memory_url: String,
    pub tenant_id: String,
    pub user_id: String,
    pub heartbeat_interval: Duration,
    pub capabilities: Vec<String>,
    pub events_produced: Vec<String>,
    pub metadata: Option<HashMap<String, Value>>,
}

impl AgentConfig {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let agent_id = format!("{}-{}", name, &Uuid::new_v4().to_string()[..8]);
        Self {
            name,
            agent_id,
            agent_type: "worker".to_string(),
            event_service_url: "http://localhost:8081".to_string(),
            registry_url: "http://localhost:8082".to_string(),
            memory_url: "http://localhost:8083".to_string(),
            tenant_id: "default".to_string(),
            user_id: "system".to_string(),
            heartbeat_interval: HEARTBEAT_INTERVAL,
            capabilities: Vec::new(),
            events_produced: Vec::new(),
            metadata: None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Context
// ─────────────────────────────────────────────────────────────────────────────

/// Outcome of a `request` call. A timeout is a value, not an error - the
/// caller decides what a missing answer means.
#[derive(Debug)]
pub enum RequestOutcome {
    Response(EventEnvelope),
    TimedOut,
}

type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<EventEnvelope>>>>;

/// Everything a handler needs to talk back to the platform.
#[derive(Clone)]
pub struct AgentContext {
    pub agent_id: String,
    pub name: String,
    pub events: EventClient,
    pub registry: RegistryClient,
    pub memory: MemoryClient,
    /// In-flight requests waiting for a response by correlation id
    pending: PendingMap,
}

impl AgentContext {
    /// Construct a context without an agent run loop behind it. Useful in
    /// tests that only exercise bookkeeping.
    #[cfg(test)]
    pub(crate) fn new_for_tests(config: &AgentConfig) -> Self {
        Self::new(config)
    }

    fn new(config: &AgentConfig) -> Self {
        Self {
            agent_id: config.agent_id.clone(),
            name: config.name.clone(),
            events: EventClient::new(&config.event_service_url),
            registry: RegistryClient::new(&config.registry_url),
            memory: MemoryClient::new(&config.memory_url, &config.tenant_id, &config.user_id),
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Publish a pre-built envelope.
    pub async fn publish(&self, envelope: &EventEnvelope) -> Result<String> {
        self.events.publish(envelope).await
    }

    /// Announce a business fact; no response expected.
    pub async fn announce(&self, event_type: &str, data: Value) -> Result<String> {
        self.publish(&EventEnvelope::business_fact(&self.agent_id, event_type, data))
            .await
    }

    /// Publish an action request and wait for its response.
    ///
    /// The response is matched purely by correlation id. On deadline the
    /// pending slot is dropped and `TimedOut` returned; nothing is published
    /// on timeout.
    pub async fn request(
        &self,
        event_type: &str,
        data: Value,
        response_event: &str,
        timeout: Option<Duration>,
    ) -> Result<RequestOutcome> {
        let envelope =
            EventEnvelope::action_request(&self.agent_id, event_type, data, response_event);
        let correlation_id = envelope.correlation_id.clone();

        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending map poisoned")
            .insert(correlation_id.clone(), tx);

        if let Err(e) = self.publish(&envelope).await {
            self.pending
                .lock()
                .expect("pending map poisoned")
                .remove(&correlation_id);
            return Err(e);
        }

        match tokio::time::timeout(timeout.unwrap_or(REQUEST_TIMEOUT), rx).await {
            Ok(Ok(response)) => Ok(RequestOutcome::Response(response)),
            // Elapsed, or the agent shut down and dropped the sender.
            _ => {
                self.pending
                    .lock()
                    .expect("pending map poisoned")
                    .remove(&correlation_id);
                Ok(RequestOutcome::TimedOut)
            }
        }
    }

    /// Publish the response to a request, per the derivation rule. Returns
    /// None when the request did not ask for a response.
    pub async fn respond(&self, request: &EventEnvelope, data: Value) -> Result<Option<String>> {
        match request.response(&self.agent_id, data) {
            Some(response) => Ok(Some(self.publish(&response).await?)),
            None => Ok(None),
        }
    }

    /// Route an incoming envelope to a waiting `request` call, if any.
    /// Returns true when the envelope was consumed.
    fn try_route_response(&self, envelope: &EventEnvelope) -> bool {
        let waiter = self
            .pending
            .lock()
            .expect("pending map poisoned")
            .remove(&envelope.correlation_id);
        match waiter {
            Some(tx) => tx.send(envelope.clone()).is_ok(),
            None => false,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Agent
// ─────────────────────────────────────────────────────────────────────────────

pub struct AgentBuilder {
    config: AgentConfig,
    handlers: HandlerTable,
}

impl AgentBuilder {
    /// Register a handler for `(topic, event_type)`. Use
    /// [`WILDCARD_EVENT`] to catch every event on a topic.
    pub fn on_event<F, Fut>(mut self, topic: EventTopic, event_type: &str, handler: F) -> Self
    where
        F: Fn(EventEnvelope, AgentContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        self.handlers.insert(
            topic,
            event_type,
            Arc::new(move |envelope, context| Box::pin(handler(envelope, context))),
        );
        self
    }

    pub fn build(self) -> Agent {
        let context = AgentContext::new(&self.config);
        Agent {
            config: self.config,
            handlers: Arc::new(self.handlers),
            context,
        }
    }
}

pub struct Agent {
    config: AgentConfig,
    handlers: Arc<HandlerTable>,
    context: AgentContext,
}

impl Agent {
    pub fn builder(config: AgentConfig) -> AgentBuilder {
        AgentBuilder {
            config,
            handlers: HandlerTable::new(),
        }
    }

    pub fn context(&self) -> AgentContext {
        self.context.clone()
    }

    /// Run until the shutdown signal fires: register, heartbeat, subscribe,
    /// dispatch. Network failures degrade, they never exit the loop.
    pub async fn run(self, shutdown_rx: oneshot::Receiver<()>) -> Result<()> {
        let registered = self.register().await;
        if !registered {
            tracing::warn!(
                agent_id = %self.config.agent_id,
                "registry registration failed; continuing in offline mode"
            );
        }

        let heartbeat = tokio::spawn(heartbeat_loop(
            self.context.clone(),
            self.registration(),
            self.config.heartbeat_interval,
        ));

        let result = self.stream_loop(shutdown_rx).await;

        heartbeat.abort();
        match self.context.registry.deregister(&self.config.agent_id).await {
            Ok(true) => tracing::info!(agent_id = %self.config.agent_id, "deregistered"),
            Ok(false) => {}
            Err(e) => tracing::debug!("deregistration failed: {:#}", e),
        }
        result
    }

    fn registration(&self) -> AgentRegistration {
        AgentRegistration {
            agent_id: self.config.agent_id.clone(),
            name: self.config.name.clone(),
            agent_type: self.config.agent_type.clone(),
            capabilities: self.config.capabilities.clone(),
            events_consumed: self.handlers.consumed_events(),
            events_produced: self.config.events_produced.clone(),
            metadata: self.config.metadata.clone(),
        }
    }

    async fn register(&self) -> bool {
        match self.context.registry.register(&self.registration()).await {
            Ok(ok) => ok,
            Err(e) => {
                tracing::warn!("registration error: {:#}", e);
                false
            }
        }
    }

    /// Consume the SSE stream, reconnecting with capped exponential backoff.
    async fn stream_loop(&self, mut shutdown_rx: oneshot::Receiver<()>) -> Result<()> {
        let topics = self.handlers.topics();
        if topics.is_empty() {
            tracing::warn!("no handlers registered; nothing to subscribe to");
            let _ = shutdown_rx.await;
            return Ok(());
        }

        let mut backoff = Duration::from_secs(1);
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    tracing::info!("agent shutting down");
                    return Ok(());
                }
                outcome = self.consume_stream(&topics) => {
                    match outcome {
                        Ok(()) => {
                            tracing::info!("event stream closed; reconnecting");
                            backoff = Duration::from_secs(1);
                        }
                        Err(e) => {
                            tracing::warn!("event stream error: {:#}; retrying in {:?}", e, backoff);
                        }
                    }
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_secs(30));
                }
            }
        }
    }

    async fn consume_stream(&self, topics: &[String]) -> Result<()> {
        let response = self
            .context
            .events
            .open_stream(topics, &self.config.agent_id, Some(&self.config.name))
            .await?;

        tracing::info!(?topics, "event stream connected");
        let mut parser = SseParser::new();
        let mut body = response.bytes_stream();

        while let Some(chunk) = body.next().await {
            let chunk = chunk.context("stream read failed")?;
            let text = String::from_utf8_lossy(&chunk);
            for frame in parser.feed(&text) {
                self.handle_frame(frame);
            }
        }
        Ok(())
    }

    fn handle_frame(&self, frame: client::SseFrame) {
        match frame.event.as_str() {
            "message" => match serde_json::from_str::<EventEnvelope>(&frame.data) {
                Ok(envelope) => self.dispatch(envelope),
                // Malformed envelopes are logged and dropped.
                Err(e) => tracing::warn!("dropping malformed envelope: {}", e),
            },
            "connected" => tracing::info!("stream session established: {}", frame.data),
            "heartbeat" => tracing::trace!("stream heartbeat"),
            "disconnected" => tracing::info!("stream session closed by server"),
            other => tracing::debug!("ignoring SSE frame type {:?}", other),
        }
    }

    fn dispatch(&self, envelope: EventEnvelope) {
        // Responses to in-flight `request` calls win over handlers.
        if self.context.try_route_response(&envelope) {
            return;
        }

        let Some(handler) = self.handlers.resolve(envelope.topic, &envelope.event_type) else {
            tracing::debug!(
                topic = %envelope.topic,
                event_type = %envelope.event_type,
                "no handler for envelope"
            );
            return;
        };

        // Handlers run in their own tasks so a slow one cannot stall the
        // stream reader.
        let handler = handler.clone();
        let context = self.context.clone();
        let event_type = envelope.event_type.clone();
        tokio::spawn(async move {
            if let Err(e) = handler(envelope, context).await {
                tracing::error!(event_type, "handler error: {:#}", e);
            }
        });
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Heartbeat loop
// ─────────────────────────────────────────────────────────────────────────────

/// Beat every interval. On failure attempt one re-registration; on repeated
/// failure back off (capped) but never stop - the agent keeps serving events
/// and the registry catches up when it returns.
async fn heartbeat_loop(
    context: AgentContext,
    registration: AgentRegistration,
    interval: Duration,
) {
    let mut consecutive_failures: u32 = 0;
    let mut last_ack: Option<DateTime<Utc>> = None;

    loop {
        tokio::time::sleep(interval).await;

        let ok = match context.registry.heartbeat(&registration.agent_id).await {
            Ok(ok) => ok,
            Err(e) => {
                tracing::debug!("heartbeat transport error: {:#}", e);
                false
            }
        };

        if ok {
            if consecutive_failures > 0 {
                tracing::info!(agent_id = %registration.agent_id, "heartbeat restored");
            }
            consecutive_failures = 0;
            last_ack = Some(Utc::now());
            continue;
        }

        consecutive_failures += 1;
        tracing::error!(
            agent_id = %registration.agent_id,
            consecutive_failures,
            last_ack = ?last_ack,
            "heartbeat failed; attempting re-registration"
        );

        match context.registry.register(&registration).await {
            Ok(true) => {
                tracing::info!(agent_id = %registration.agent_id, "re-registered");
                consecutive_failures = 0;
                last_ack = Some(Utc::now());
            }
            _ => {
                // Extra capped backoff on top of the regular interval.
                let penalty =
                    Duration::from_secs(2u64.saturating_pow(consecutive_failures.min(6)));
                tracing::warn!(
                    "re-registration failed; backing off {:?} before next attempt",
                    penalty
                );
                tokio::time::sleep(penalty.min(Duration::from_secs(60))).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn pending_responses_route_by_correlation_id() {
        let context = AgentContext::new(&AgentConfig::new("test"));

        let (tx, rx) = oneshot::channel();
        context
            .pending
            .lock()
            .unwrap()
            .insert("C1".to_string(), tx);

        let mut response = EventEnvelope::action_result("worker", "x.done", json!({"ok": true}));
        response.correlation_id = "C1".to_string();

        assert!(context.try_route_response(&response));
        assert_eq!(rx.await.unwrap().event_type, "x.done");
        // A second envelope with the same correlation id has no waiter left.
        assert!(!context.try_route_response(&response));
    }

    #[tokio::test]
    async fn unmatched_correlation_is_not_consumed() {
        let context = AgentContext::new(&AgentConfig::new("test"));
        let envelope = EventEnvelope::action_result("worker", "x.done", json!({}));
        assert!(!context.try_route_response(&envelope));
    }

    #[test]
    fn config_defaults_are_sane() {
        let config = AgentConfig::new("researcher");
        assert!(config.agent_id.starts_with("researcher-"));
        assert_eq!(config.heartbeat_interval, HEARTBEAT_INTERVAL);
    }
}
