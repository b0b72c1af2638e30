// Handler table for agent event dispatch
//
// An agent declares its handlers up front; the table is read-only once the
// run loop starts. Dispatch is keyed by (topic, event type), with a "*"
// event type as the per-topic catch-all. The table also answers the two
// registration questions: which topics to subscribe to, and which event
// types to advertise as consumed (wildcards are implementation detail, not
// contract, so they are never advertised).

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;

use super::AgentContext;
use crate::events::{EventEnvelope, EventTopic};

/// Async event handler. Errors are logged by the dispatch loop.
pub type EventHandler =
    Arc<dyn Fn(EventEnvelope, AgentContext) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Matches any event type on its topic.
pub const WILDCARD_EVENT: &str = "*";

#[derive(Default)]
pub struct HandlerTable {
    handlers: HashMap<(EventTopic, String), EventHandler>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. A second registration for the same key replaces
    /// the first.
    pub fn insert(&mut self, topic: EventTopic, event_type: impl Into<String>, handler: EventHandler) {
        self.handlers.insert((topic, event_type.into()), handler);
    }

    /// Resolve the handler for an envelope: exact event type first, then the
    /// topic's wildcard.
    pub fn resolve(&self, topic: EventTopic, event_type: &str) -> Option<&EventHandler> {
        self.handlers
            .get(&(topic, event_type.to_string()))
            .or_else(|| self.handlers.get(&(topic, WILDCARD_EVENT.to_string())))
    }

    /// The deduplicated topic list implied by the handler set - exactly what
    /// the agent subscribes to.
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self
            .handlers
            .keys()
            .map(|(topic, _)| topic.as_str().to_string())
            .collect();
        topics.sort();
        topics.dedup();
        topics
    }

    /// Event types to advertise as consumed at the registry. Wildcard
    /// registrations are excluded.
    pub fn consumed_events(&self) -> Vec<String> {
        let mut events: Vec<String> = self
            .handlers
            .keys()
            .map(|(_, event_type)| event_type.clone())
            .filter(|e| e != WILDCARD_EVENT)
            .collect();
        events.sort();
        events.dedup();
        events
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> EventHandler {
        Arc::new(|_, _| Box::pin(async { Ok(()) }))
    }

    fn table() -> HandlerTable {
        let mut table = HandlerTable::new();
        table.insert(EventTopic::ActionRequests, "order.requested", noop());
        table.insert(EventTopic::ActionRequests, "refund.requested", noop());
        table.insert(EventTopic::ActionResults, WILDCARD_EVENT, noop());
        table.insert(EventTopic::SystemEvents, "plan.waiting_for_input", noop());
        table
    }

    #[test]
    fn resolves_exact_key_then_topic_wildcard() {
        let table = table();

        assert!(table
            .resolve(EventTopic::ActionRequests, "order.requested")
            .is_some());
        // No exact handler, but the topic has a wildcard.
        assert!(table
            .resolve(EventTopic::ActionResults, "anything.done")
            .is_some());
        // Neither exact nor wildcard on this topic.
        assert!(table
            .resolve(EventTopic::ActionRequests, "unknown.event")
            .is_none());
        assert!(table.resolve(EventTopic::PlanEvents, "order.requested").is_none());
    }

    #[test]
    fn topics_are_deduplicated_and_sorted() {
        let table = table();
        assert_eq!(
            table.topics(),
            vec!["action-requests", "action-results", "system-events"]
        );
    }

    #[test]
    fn wildcards_are_not_advertised_as_consumed() {
        let table = table();
        assert_eq!(
            table.consumed_events(),
            vec!["order.requested", "plan.waiting_for_input", "refund.requested"]
        );
    }

    #[test]
    fn duplicate_registration_replaces() {
        let mut table = HandlerTable::new();
        table.insert(EventTopic::TaskEvents, "x", noop());
        table.insert(EventTopic::TaskEvents, "x", noop());
        assert_eq!(table.len(), 1);
    }
}
