// In-memory bus adapter for development and tests
//
// Simulates a broker by keeping the subscription table in process and
// invoking handlers directly on publish. Matching is O(#subscriptions) per
// publish, which is fine for the small fan-out this adapter serves.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use futures::future::join_all;
use uuid::Uuid;

use super::{topic_matches, AdapterError, BusAdapter, MessageHandler};
use crate::events::EventEnvelope;

struct Subscription {
    patterns: Vec<String>,
    handler: MessageHandler,
    queue_group: Option<String>,
}

#[derive(Default)]
struct Tables {
    subscriptions: HashMap<String, Subscription>,
    /// Queue group -> subscription ids in insertion order (round-robin order)
    queue_groups: HashMap<String, Vec<String>>,
    /// Queue group -> next round-robin offset
    cursors: HashMap<String, u64>,
}

/// In-memory event adapter.
///
/// The tables are mutated only on subscribe/unsubscribe; a publish takes a
/// snapshot of the matching handlers under the lock and invokes them after
/// releasing it, so a slow handler never blocks other publishers.
pub struct MemoryAdapter {
    connected: AtomicBool,
    tables: Mutex<Tables>,
}

impl MemoryAdapter {
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(false),
            tables: Mutex::new(Tables::default()),
        }
    }

    /// Select the handlers a publish must reach: every matching subscription
    /// without a queue group, plus one round-robin member per matching group.
    fn select_handlers(&self, topic: &str) -> Vec<MessageHandler> {
        let mut tables = self.tables.lock().expect("bus tables poisoned");

        // Matching subscriptions grouped into broadcast vs queue groups.
        let mut broadcast: Vec<String> = Vec::new();
        let mut grouped: HashMap<String, Vec<String>> = HashMap::new();
        for (sub_id, sub) in &tables.subscriptions {
            if !sub.patterns.iter().any(|p| topic_matches(p, topic)) {
                continue;
            }
            match &sub.queue_group {
                Some(group) => grouped.entry(group.clone()).or_default().push(sub_id.clone()),
                None => broadcast.push(sub_id.clone()),
            }
        }

        let mut selected = broadcast;

        // One delivery per group, chosen by the per-group cursor over the
        // matching members in their subscription order. The cursor advances
        // on every matching publish, independent of other groups.
        for (group, mut members) in grouped {
            let order = tables.queue_groups.get(&group).cloned().unwrap_or_default();
            members.sort_by_key(|id| order.iter().position(|o| o == id).unwrap_or(usize::MAX));
            if members.is_empty() {
                continue;
            }
            let cursor = tables.cursors.entry(group).or_insert(0);
            let chosen = members[(*cursor as usize) % members.len()].clone();
            *cursor += 1;
            selected.push(chosen);
        }

        selected
            .into_iter()
            .filter_map(|id| tables.subscriptions.get(&id).map(|s| s.handler.clone()))
            .collect()
    }
}

impl Default for MemoryAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BusAdapter for MemoryAdapter {
    async fn connect(&self) -> Result<(), AdapterError> {
        if self.connected.swap(true, Ordering::SeqCst) {
            tracing::warn!("memory adapter already connected");
        } else {
            tracing::info!("memory adapter connected (in-memory mode)");
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), AdapterError> {
        let mut tables = self.tables.lock().expect("bus tables poisoned");
        tables.subscriptions.clear();
        tables.queue_groups.clear();
        tables.cursors.clear();
        drop(tables);
        self.connected.store(false, Ordering::SeqCst);
        tracing::info!("memory adapter disconnected");
        Ok(())
    }

    async fn publish(&self, topic: &str, envelope: &EventEnvelope) -> Result<(), AdapterError> {
        if !self.is_connected() {
            return Err(AdapterError::NotConnected);
        }

        tracing::debug!(topic, event_id = %envelope.id, "publishing");

        let handlers = self.select_handlers(topic);
        if handlers.is_empty() {
            tracing::debug!(topic, "no subscribers");
            return Ok(());
        }

        // Handlers run concurrently; failures are logged and swallowed so one
        // bad subscriber cannot fail the publish for the rest.
        let deliveries = handlers
            .into_iter()
            .map(|h| h(topic.to_string(), envelope.clone()));
        for result in join_all(deliveries).await {
            if let Err(e) = result {
                tracing::error!(topic, "handler error: {:#}", e);
            }
        }

        Ok(())
    }

    async fn subscribe(
        &self,
        patterns: Vec<String>,
        handler: MessageHandler,
        subscription_id: Option<String>,
        queue_group: Option<String>,
    ) -> Result<String, AdapterError> {
        if !self.is_connected() {
            return Err(AdapterError::NotConnected);
        }

        let sub_id = subscription_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let queue_group = queue_group.filter(|g| !g.is_empty());

        let mut tables = self.tables.lock().expect("bus tables poisoned");
        if let Some(group) = &queue_group {
            tables
                .queue_groups
                .entry(group.clone())
                .or_default()
                .push(sub_id.clone());
            tables.cursors.entry(group.clone()).or_insert(0);
        }
        tables.subscriptions.insert(
            sub_id.clone(),
            Subscription {
                patterns: patterns.clone(),
                handler,
                queue_group,
            },
        );
        drop(tables);

        tracing::info!(?patterns, sub_id, "subscribed");
        Ok(sub_id)
    }

    async fn unsubscribe(&self, subscription_id: &str) -> Result<(), AdapterError> {
        let mut tables = self.tables.lock().expect("bus tables poisoned");
        let Some(sub) = tables.subscriptions.remove(subscription_id) else {
            tracing::warn!(subscription_id, "subscription not found");
            return Ok(());
        };

        if let Some(group) = &sub.queue_group {
            if let Some(members) = tables.queue_groups.get_mut(group) {
                members.retain(|id| id != subscription_id);
                if members.is_empty() {
                    tables.queue_groups.remove(group);
                    tables.cursors.remove(group);
                }
            }
        }
        drop(tables);

        tracing::info!(subscription_id, "unsubscribed");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventTopic;
    use serde_json::json;
    use std::sync::Arc;

    /// Handler that appends `(topic, event id)` to a shared log.
    fn recording_handler(log: Arc<Mutex<Vec<(String, String)>>>) -> MessageHandler {
        Arc::new(move |topic, env: EventEnvelope| {
            let log = log.clone();
            Box::pin(async move {
                log.lock().unwrap().push((topic, env.id));
                Ok(())
            })
        })
    }

    fn envelope(n: usize) -> EventEnvelope {
        let mut e = EventEnvelope::new("test", "unit.test", EventTopic::ActionRequests);
        e.id = format!("E{}", n);
        e.data = Some(json!({"n": n}));
        e
    }

    #[tokio::test]
    async fn publish_requires_connection() {
        let adapter = MemoryAdapter::new();
        let err = adapter
            .publish("action-requests", &envelope(0))
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::NotConnected));
    }

    #[tokio::test]
    async fn broadcast_reaches_every_matching_subscriber() {
        let adapter = MemoryAdapter::new();
        adapter.connect().await.unwrap();

        let log_a = Arc::new(Mutex::new(Vec::new()));
        let log_b = Arc::new(Mutex::new(Vec::new()));
        adapter
            .subscribe(
                vec!["action-requests".into()],
                recording_handler(log_a.clone()),
                Some("sub-a".into()),
                None,
            )
            .await
            .unwrap();
        adapter
            .subscribe(
                vec!["*".into()],
                recording_handler(log_b.clone()),
                Some("sub-b".into()),
                None,
            )
            .await
            .unwrap();

        adapter.publish("action-requests", &envelope(1)).await.unwrap();

        assert_eq!(log_a.lock().unwrap().len(), 1);
        assert_eq!(log_b.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn queue_group_round_robins_deterministically() {
        let adapter = MemoryAdapter::new();
        adapter.connect().await.unwrap();

        let log_a = Arc::new(Mutex::new(Vec::new()));
        let log_b = Arc::new(Mutex::new(Vec::new()));
        for (id, log) in [("w-1", log_a.clone()), ("w-2", log_b.clone())] {
            adapter
                .subscribe(
                    vec!["action-requests".into()],
                    recording_handler(log),
                    Some(id.into()),
                    Some("workers".into()),
                )
                .await
                .unwrap();
        }

        for n in 0..10 {
            adapter.publish("action-requests", &envelope(n)).await.unwrap();
        }

        let a = log_a.lock().unwrap();
        let b = log_b.lock().unwrap();
        assert_eq!(a.len(), 5);
        assert_eq!(b.len(), 5);
        // Alternating split: w-1 gets E0, E2, ...; w-2 gets E1, E3, ...
        assert_eq!(a[0].1, "E0");
        assert_eq!(b[0].1, "E1");
    }

    #[tokio::test]
    async fn groups_and_broadcast_are_independent() {
        let adapter = MemoryAdapter::new();
        adapter.connect().await.unwrap();

        let grouped = Arc::new(Mutex::new(Vec::new()));
        let broadcast = Arc::new(Mutex::new(Vec::new()));
        adapter
            .subscribe(
                vec!["task-events".into()],
                recording_handler(grouped.clone()),
                Some("grouped".into()),
                Some("g1".into()),
            )
            .await
            .unwrap();
        adapter
            .subscribe(
                vec!["task-events".into()],
                recording_handler(broadcast.clone()),
                Some("plain".into()),
                None,
            )
            .await
            .unwrap();

        for n in 0..4 {
            adapter.publish("task-events", &envelope(n)).await.unwrap();
        }

        // Sole group member sees everything, and so does the broadcast sub.
        assert_eq!(grouped.lock().unwrap().len(), 4);
        assert_eq!(broadcast.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn unsubscribed_member_leaves_the_rotation() {
        let adapter = MemoryAdapter::new();
        adapter.connect().await.unwrap();

        let log_a = Arc::new(Mutex::new(Vec::new()));
        let log_b = Arc::new(Mutex::new(Vec::new()));
        for (id, log) in [("w-1", log_a.clone()), ("w-2", log_b.clone())] {
            adapter
                .subscribe(
                    vec!["action-requests".into()],
                    recording_handler(log),
                    Some(id.into()),
                    Some("workers".into()),
                )
                .await
                .unwrap();
        }

        adapter.unsubscribe("w-1").await.unwrap();
        for n in 0..4 {
            adapter.publish("action-requests", &envelope(n)).await.unwrap();
        }

        assert_eq!(log_a.lock().unwrap().len(), 0);
        assert_eq!(log_b.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn handler_errors_do_not_fail_the_publish() {
        let adapter = MemoryAdapter::new();
        adapter.connect().await.unwrap();

        let failing: MessageHandler = Arc::new(|_, _| {
            Box::pin(async { Err(anyhow::anyhow!("handler exploded")) })
        });
        let log = Arc::new(Mutex::new(Vec::new()));

        adapter
            .subscribe(vec!["system-events".into()], failing, Some("bad".into()), None)
            .await
            .unwrap();
        adapter
            .subscribe(
                vec!["system-events".into()],
                recording_handler(log.clone()),
                Some("good".into()),
                None,
            )
            .await
            .unwrap();

        let mut env = envelope(0);
        env.topic = EventTopic::SystemEvents;
        adapter.publish("system-events", &env).await.unwrap();

        assert_eq!(log.lock().unwrap().len(), 1);
    }
}
