// Event envelope and topic model shared by every component
//
// Every message on the platform travels inside a CloudEvents-shaped envelope.
// The envelope is the only wire type the bus, the gateway and the SDK agree
// on; services never exchange bare payloads. Using one struct plus typed
// constructors (instead of per-topic subtypes) keeps the wire tolerant and
// the matching rules in one place.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Topic the response to a request lands on when the caller does not pick one.
pub const DEFAULT_RESPONSE_TOPIC: &str = "action-results";

/// CloudEvents spec version carried by every envelope.
pub const SPEC_VERSION: &str = "1.0";

// ─────────────────────────────────────────────────────────────────────────────
// Topics
// ─────────────────────────────────────────────────────────────────────────────

/// The closed set of logical channels the bus carries.
///
/// Adding a topic is a code change; free-form topics are rejected at the
/// publish endpoint so subscribers can rely on the set being stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventTopic {
    /// General business facts/observations
    #[serde(rename = "business-facts")]
    BusinessFacts,
    /// Requests for agent actions
    #[serde(rename = "action-requests")]
    ActionRequests,
    /// Results from agent actions
    #[serde(rename = "action-results")]
    ActionResults,
    /// Usage/cost tracking
    #[serde(rename = "billing-events")]
    BillingEvents,
    /// User notifications
    #[serde(rename = "notification-events")]
    NotificationEvents,
    /// Platform lifecycle events
    #[serde(rename = "system-events")]
    SystemEvents,
    /// Plan creation/updates
    #[serde(rename = "plan-events")]
    PlanEvents,
    /// Task lifecycle events
    #[serde(rename = "task-events")]
    TaskEvents,
}

impl EventTopic {
    /// All topics, in wire order. Used by validation and by SDK topic math.
    pub const ALL: [EventTopic; 8] = [
        EventTopic::BusinessFacts,
        EventTopic::ActionRequests,
        EventTopic::ActionResults,
        EventTopic::BillingEvents,
        EventTopic::NotificationEvents,
        EventTopic::SystemEvents,
        EventTopic::PlanEvents,
        EventTopic::TaskEvents,
    ];

    /// The string value used on the wire and as the bus subject.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventTopic::BusinessFacts => "business-facts",
            EventTopic::ActionRequests => "action-requests",
            EventTopic::ActionResults => "action-results",
            EventTopic::BillingEvents => "billing-events",
            EventTopic::NotificationEvents => "notification-events",
            EventTopic::SystemEvents => "system-events",
            EventTopic::PlanEvents => "plan-events",
            EventTopic::TaskEvents => "task-events",
        }
    }
}

impl fmt::Display for EventTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventTopic {
    type Err = UnknownTopic;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventTopic::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownTopic(s.to_string()))
    }
}

/// Error for a topic string outside the closed set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownTopic(pub String);

impl fmt::Display for UnknownTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown topic: {}", self.0)
    }
}

impl std::error::Error for UnknownTopic {}

// ─────────────────────────────────────────────────────────────────────────────
// Envelope
// ─────────────────────────────────────────────────────────────────────────────

/// The platform's uniform wire message.
///
/// Serializes with snake_case keys (the SDK contract); camelCase input is
/// accepted via aliases. Fields nobody recognizes are kept in `extra` so an
/// envelope survives a round-trip through a newer peer unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Unique identifier for this event (UUID), generated when absent
    #[serde(default = "new_uuid")]
    pub id: String,

    /// Agent ID or service that produced this event
    pub source: String,

    /// Event type, dotted name (e.g. "research.requested")
    #[serde(rename = "type")]
    pub event_type: String,

    /// The destination topic for this event
    pub topic: EventTopic,

    /// CloudEvents spec version, always "1.0"
    #[serde(default = "spec_version")]
    pub specversion: String,

    /// Creation timestamp (UTC on the wire)
    #[serde(default = "Utc::now")]
    pub time: DateTime<Utc>,

    /// The event payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    /// The ONLY identifier used to match a response to its request.
    /// Generated when absent.
    #[serde(default = "new_uuid", alias = "correlationId")]
    pub correlation_id: String,

    /// Event type the callee must use for the reply
    #[serde(
        default,
        alias = "responseEvent",
        skip_serializing_if = "Option::is_none"
    )]
    pub response_event: Option<String>,

    /// Topic for the reply; `action-results` when unset
    #[serde(
        default,
        alias = "responseTopic",
        skip_serializing_if = "Option::is_none"
    )]
    pub response_topic: Option<String>,

    /// Root trace ID for the entire workflow. Tracing only, never matching.
    #[serde(default, alias = "traceId", skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,

    /// ID of the parent event in the trace tree. Tracing only.
    #[serde(
        default,
        alias = "parentEventId",
        skip_serializing_if = "Option::is_none"
    )]
    pub parent_event_id: Option<String>,

    /// Tenant scope for multi-tenancy
    #[serde(default, alias = "tenantId", skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,

    /// User scope within the tenant
    #[serde(default, alias = "userId", skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    /// Session/conversation correlation
    #[serde(default, alias = "sessionId", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,

    /// Optional subject/resource this event pertains to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,

    /// Registered schema name for the payload (diagnostic hint)
    #[serde(
        default,
        alias = "payloadSchemaName",
        skip_serializing_if = "Option::is_none"
    )]
    pub payload_schema_name: Option<String>,

    /// Unknown fields, preserved on round-trip
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

fn new_uuid() -> String {
    Uuid::new_v4().to_string()
}

fn spec_version() -> String {
    SPEC_VERSION.to_string()
}

impl EventEnvelope {
    /// Create a minimal envelope with generated id/correlation_id and
    /// the current time.
    pub fn new(source: impl Into<String>, event_type: impl Into<String>, topic: EventTopic) -> Self {
        Self {
            id: new_uuid(),
            source: source.into(),
            event_type: event_type.into(),
            topic,
            specversion: spec_version(),
            time: Utc::now(),
            data: None,
            correlation_id: new_uuid(),
            response_event: None,
            response_topic: None,
            trace_id: None,
            parent_event_id: None,
            tenant_id: None,
            user_id: None,
            session_id: None,
            subject: None,
            payload_schema_name: None,
            extra: BTreeMap::new(),
        }
    }

    /// Request for an agent action. `response_event` is the type the callee
    /// must use for its reply.
    pub fn action_request(
        source: impl Into<String>,
        event_type: impl Into<String>,
        data: Value,
        response_event: impl Into<String>,
    ) -> Self {
        let mut e = Self::new(source, event_type, EventTopic::ActionRequests);
        e.data = Some(data);
        e.response_event = Some(response_event.into());
        e.response_topic = Some(DEFAULT_RESPONSE_TOPIC.to_string());
        e
    }

    /// Result of an agent action.
    pub fn action_result(
        source: impl Into<String>,
        event_type: impl Into<String>,
        data: Value,
    ) -> Self {
        let mut e = Self::new(source, event_type, EventTopic::ActionResults);
        e.data = Some(data);
        e
    }

    /// Domain fact/observation; no response expected.
    pub fn business_fact(
        source: impl Into<String>,
        event_type: impl Into<String>,
        data: Value,
    ) -> Self {
        let mut e = Self::new(source, event_type, EventTopic::BusinessFacts);
        e.data = Some(data);
        e
    }

    /// Platform lifecycle event (plan pauses, agent failures, ...).
    pub fn system_event(
        source: impl Into<String>,
        event_type: impl Into<String>,
        data: Value,
    ) -> Self {
        let mut e = Self::new(source, event_type, EventTopic::SystemEvents);
        e.data = Some(data);
        e
    }

    /// User-facing notification.
    pub fn notification(
        source: impl Into<String>,
        event_type: impl Into<String>,
        data: Value,
    ) -> Self {
        let mut e = Self::new(source, event_type, EventTopic::NotificationEvents);
        e.data = Some(data);
        e
    }

    /// Plan lifecycle event.
    pub fn plan_event(source: impl Into<String>, event_type: impl Into<String>, data: Value) -> Self {
        let mut e = Self::new(source, event_type, EventTopic::PlanEvents);
        e.data = Some(data);
        e
    }

    /// Task lifecycle event.
    pub fn task_event(source: impl Into<String>, event_type: impl Into<String>, data: Value) -> Self {
        let mut e = Self::new(source, event_type, EventTopic::TaskEvents);
        e.data = Some(data);
        e
    }

    /// The topic a reply to this envelope must be published on.
    pub fn response_topic(&self) -> &str {
        self.response_topic.as_deref().unwrap_or(DEFAULT_RESPONSE_TOPIC)
    }

    /// Derive a child request from this envelope.
    ///
    /// Copies the tenancy scope and trace linkage, records this event as the
    /// parent, and mints a NEW correlation_id — a child's replies must never
    /// be confused with replies to its parent.
    pub fn child_request(
        &self,
        source: impl Into<String>,
        event_type: impl Into<String>,
        data: Value,
        response_event: impl Into<String>,
    ) -> Self {
        let mut child = Self::action_request(source, event_type, data, response_event);
        // A missing trace root is seeded from the parent event id so the
        // whole sub-tree shares one trace.
        child.trace_id = self.trace_id.clone().or_else(|| Some(self.id.clone()));
        child.parent_event_id = Some(self.id.clone());
        child.tenant_id = self.tenant_id.clone();
        child.user_id = self.user_id.clone();
        child.session_id = self.session_id.clone();
        child
    }

    /// Derive the response to this envelope.
    ///
    /// Copies correlation_id, trace linkage and tenancy scope from the
    /// request; the type is the request's `response_event` and the topic its
    /// `response_topic` (default `action-results`). Returns None when the
    /// request did not ask for a response.
    pub fn response(&self, source: impl Into<String>, data: Value) -> Option<Self> {
        let response_event = self.response_event.clone()?;
        let topic = EventTopic::from_str(self.response_topic())
            .unwrap_or(EventTopic::ActionResults);

        let mut resp = Self::new(source, response_event, topic);
        resp.data = Some(data);
        resp.correlation_id = self.correlation_id.clone();
        resp.trace_id = self.trace_id.clone();
        resp.parent_event_id = Some(self.id.clone());
        resp.tenant_id = self.tenant_id.clone();
        resp.user_id = self.user_id.clone();
        resp.session_id = self.session_id.clone();
        Some(resp)
    }

    /// Validate the envelope for publishing: the required identity fields
    /// must be non-empty and the spec version must be the one we speak.
    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("envelope id must not be empty".to_string());
        }
        if self.source.trim().is_empty() {
            return Err("envelope source must not be empty".to_string());
        }
        if self.event_type.trim().is_empty() {
            return Err("envelope type must not be empty".to_string());
        }
        if self.correlation_id.trim().is_empty() {
            return Err("correlation_id must not be empty".to_string());
        }
        if self.specversion != SPEC_VERSION {
            return Err(format!(
                "unsupported specversion {:?} (expected {:?})",
                self.specversion, SPEC_VERSION
            ));
        }
        if let Some(rt) = &self.response_topic {
            EventTopic::from_str(rt).map_err(|e| e.to_string())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn topic_wire_values_round_trip() {
        for topic in EventTopic::ALL {
            let s = serde_json::to_string(&topic).unwrap();
            assert_eq!(s, format!("\"{}\"", topic.as_str()));
            let back: EventTopic = serde_json::from_str(&s).unwrap();
            assert_eq!(back, topic);
            assert_eq!(EventTopic::from_str(topic.as_str()).unwrap(), topic);
        }
        assert!(EventTopic::from_str("no-such-topic").is_err());
    }

    #[test]
    fn envelope_round_trip_preserves_fields() {
        let mut env = EventEnvelope::action_request(
            "planner",
            "research.requested",
            json!({"q": "x"}),
            "research.completed",
        );
        env.tenant_id = Some("t1".into());
        env.user_id = Some("u1".into());
        env.session_id = Some("s1".into());
        env.subject = Some("doc-42".into());
        env.payload_schema_name = Some("research.request.v1".into());

        let wire = serde_json::to_string(&env).unwrap();
        let back: EventEnvelope = serde_json::from_str(&wire).unwrap();

        assert_eq!(back.id, env.id);
        assert_eq!(back.source, "planner");
        assert_eq!(back.event_type, "research.requested");
        assert_eq!(back.topic, EventTopic::ActionRequests);
        assert_eq!(back.specversion, SPEC_VERSION);
        assert_eq!(back.time, env.time);
        assert_eq!(back.data, env.data);
        assert_eq!(back.correlation_id, env.correlation_id);
        assert_eq!(back.response_event.as_deref(), Some("research.completed"));
        assert_eq!(back.response_topic.as_deref(), Some("action-results"));
        assert_eq!(back.tenant_id.as_deref(), Some("t1"));
        assert_eq!(back.user_id.as_deref(), Some("u1"));
        assert_eq!(back.session_id.as_deref(), Some("s1"));
        assert_eq!(back.subject.as_deref(), Some("doc-42"));
        assert_eq!(
            back.payload_schema_name.as_deref(),
            Some("research.request.v1")
        );
    }

    #[test]
    fn unknown_fields_survive_round_trip() {
        let wire = json!({
            "source": "a",
            "type": "x.y",
            "topic": "business-facts",
            "vendor_hint": {"k": 1}
        });
        let env: EventEnvelope = serde_json::from_value(wire).unwrap();
        assert_eq!(env.extra.get("vendor_hint"), Some(&json!({"k": 1})));

        let back = serde_json::to_value(&env).unwrap();
        assert_eq!(back.get("vendor_hint"), Some(&json!({"k": 1})));
    }

    #[test]
    fn camel_case_input_accepted() {
        let wire = json!({
            "source": "a",
            "type": "x.y",
            "topic": "action-requests",
            "correlationId": "C1",
            "responseEvent": "x.done",
            "tenantId": "t1"
        });
        let env: EventEnvelope = serde_json::from_value(wire).unwrap();
        assert_eq!(env.correlation_id, "C1");
        assert_eq!(env.response_event.as_deref(), Some("x.done"));
        assert_eq!(env.tenant_id.as_deref(), Some("t1"));
    }

    #[test]
    fn missing_id_and_correlation_are_generated() {
        let wire = json!({"source": "a", "type": "x.y", "topic": "system-events"});
        let env: EventEnvelope = serde_json::from_value(wire).unwrap();
        assert!(!env.id.is_empty());
        assert!(!env.correlation_id.is_empty());
        assert_eq!(env.specversion, SPEC_VERSION);
    }

    #[test]
    fn child_request_mints_new_correlation_and_links_trace() {
        let mut parent = EventEnvelope::action_request(
            "client",
            "plan.requested",
            json!({}),
            "plan.completed",
        );
        parent.tenant_id = Some("t1".into());
        parent.session_id = Some("s1".into());

        let child = parent.child_request("planner", "step.requested", json!({}), "step.done");

        assert_ne!(child.correlation_id, parent.correlation_id);
        assert_eq!(child.parent_event_id.as_deref(), Some(parent.id.as_str()));
        // Parent had no trace root, so the child's trace is seeded from it.
        assert_eq!(child.trace_id.as_deref(), Some(parent.id.as_str()));
        assert_eq!(child.tenant_id, parent.tenant_id);
        assert_eq!(child.session_id, parent.session_id);
    }

    #[test]
    fn response_copies_correlation_and_uses_requested_type() {
        let mut req = EventEnvelope::action_request(
            "planner",
            "step.requested",
            json!({}),
            "step.done",
        );
        req.trace_id = Some("trace-1".into());
        req.tenant_id = Some("t1".into());

        let resp = req.response("worker", json!({"ok": true})).unwrap();
        assert_eq!(resp.event_type, "step.done");
        assert_eq!(resp.topic, EventTopic::ActionResults);
        assert_eq!(resp.correlation_id, req.correlation_id);
        assert_eq!(resp.trace_id.as_deref(), Some("trace-1"));
        assert_eq!(resp.tenant_id.as_deref(), Some("t1"));

        let no_reply = EventEnvelope::business_fact("a", "fact", json!({}));
        assert!(no_reply.response("b", json!({})).is_none());
    }

    #[test]
    fn validation_rejects_bad_envelopes() {
        let mut env = EventEnvelope::new("src", "t.x", EventTopic::SystemEvents);
        assert!(env.validate().is_ok());

        env.source = "  ".into();
        assert!(env.validate().is_err());

        let mut env = EventEnvelope::new("src", "t.x", EventTopic::SystemEvents);
        env.specversion = "2.0".into();
        assert!(env.validate().is_err());

        let mut env = EventEnvelope::new("src", "t.x", EventTopic::SystemEvents);
        env.response_topic = Some("not-a-topic".into());
        assert!(env.validate().is_err());
    }
}
