// Bus adapter seam - the capability set the Event Service consumes
//
// The gateway never talks to a broker directly; it goes through a BusAdapter.
// Two implementations exist: an in-memory one for development and tests, and
// a NATS-backed one for real deployments. Both apply the same topic pattern
// semantics and the same queue-group delivery rule, so the gateway treats
// them identically.

mod memory;
mod nats;

pub use memory::MemoryAdapter;
pub use nats::NatsAdapter;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::events::EventEnvelope;

/// Async callback invoked with `(matched_topic, envelope)` for every
/// delivered message. A handler error is logged by the adapter and never
/// propagated to the publisher.
pub type MessageHandler =
    Arc<dyn Fn(String, EventEnvelope) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Errors surfaced by bus adapters.
#[derive(Debug)]
pub enum AdapterError {
    /// Operation attempted before `connect` (or after `disconnect`)
    NotConnected,
    /// The broker rejected or failed a publish
    Publish(String),
    /// A subscription could not be created
    Subscribe(String),
    /// Connection to the broker failed
    Connection(String),
}

impl fmt::Display for AdapterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotConnected => write!(f, "adapter not connected"),
            Self::Publish(msg) => write!(f, "publish failed: {}", msg),
            Self::Subscribe(msg) => write!(f, "subscribe failed: {}", msg),
            Self::Connection(msg) => write!(f, "connection failed: {}", msg),
        }
    }
}

impl std::error::Error for AdapterError {}

/// Pluggable message bus backend.
///
/// Queue-group contract: a message matching a subscription that carries a
/// non-empty `queue_group` is delivered to exactly ONE member of that group
/// (round-robin); subscriptions without a group are broadcast. Both delivery
/// paths fire independently for every matching message.
#[async_trait]
pub trait BusAdapter: Send + Sync {
    /// Establish the connection to the bus.
    async fn connect(&self) -> Result<(), AdapterError>;

    /// Tear down subscriptions and close the connection.
    async fn disconnect(&self) -> Result<(), AdapterError>;

    /// Publish an envelope to a topic.
    async fn publish(&self, topic: &str, envelope: &EventEnvelope) -> Result<(), AdapterError>;

    /// Subscribe `handler` to one or more topic patterns.
    ///
    /// Returns the subscription id (the caller-supplied one when given,
    /// otherwise generated) for use with `unsubscribe`.
    async fn subscribe(
        &self,
        patterns: Vec<String>,
        handler: MessageHandler,
        subscription_id: Option<String>,
        queue_group: Option<String>,
    ) -> Result<String, AdapterError>;

    /// Remove a subscription. Unknown ids are logged, not errors.
    async fn unsubscribe(&self, subscription_id: &str) -> Result<(), AdapterError>;

    /// Whether the adapter currently holds a live connection.
    fn is_connected(&self) -> bool;

    /// Adapter name for logging and the health endpoint.
    fn name(&self) -> &'static str;
}

// ─────────────────────────────────────────────────────────────────────────────
// Topic pattern matching
// ─────────────────────────────────────────────────────────────────────────────

/// NATS-style topic pattern match.
///
/// Tokens are `.`-separated. `*` matches exactly one token. `>` matches one
/// or more trailing tokens and is only legal as the final token. Literal
/// tokens must match exactly.
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    if pattern == topic {
        return true;
    }

    let pattern_parts: Vec<&str> = pattern.split('.').collect();
    let topic_parts: Vec<&str> = topic.split('.').collect();

    if pattern_parts.last() == Some(&">") {
        let prefix = &pattern_parts[..pattern_parts.len() - 1];
        // ">" requires at least one token beyond the prefix.
        if topic_parts.len() <= prefix.len() {
            return false;
        }
        return prefix
            .iter()
            .zip(&topic_parts)
            .all(|(p, t)| *p == "*" || p == t);
    }

    if pattern_parts.len() != topic_parts.len() {
        return false;
    }

    pattern_parts
        .iter()
        .zip(&topic_parts)
        .all(|(p, t)| *p == "*" || p == t)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_patterns_match_exactly() {
        assert!(topic_matches("action-requests", "action-requests"));
        assert!(!topic_matches("action-requests", "action-results"));
        assert!(!topic_matches("a.b", "a.b.c"));
    }

    #[test]
    fn star_matches_exactly_one_token() {
        assert!(topic_matches("a.*", "a.b"));
        assert!(!topic_matches("a.*", "a.b.c"));
        assert!(!topic_matches("a.*", "a"));
        assert!(topic_matches("*.b", "a.b"));
        assert!(!topic_matches("a.*.c", "a.b.c.d"));
    }

    #[test]
    fn gt_matches_one_or_more_trailing_tokens() {
        assert!(topic_matches("a.>", "a.b"));
        assert!(topic_matches("a.>", "a.b.c.d"));
        assert!(!topic_matches("a.>", "a"));
        assert!(!topic_matches("x.>", "a.b"));
        assert!(topic_matches("a.*.>", "a.b.c"));
        assert!(!topic_matches("a.*.>", "a.b"));
    }
}
