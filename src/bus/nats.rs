// NATS bus adapter
//
// Maps the adapter capability set onto a NATS client. Topics are namespaced
// under `soorma.events.` on the wire; handlers always see the bare topic.
// Queue groups map directly onto NATS queue subscriptions, which enforce
// single-delivery per group on the server side. Reconnection is delegated to
// the client; connection events are logged, not surfaced.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::{AdapterError, BusAdapter, MessageHandler};
use crate::events::EventEnvelope;

/// Subject namespace for all platform traffic on a shared NATS cluster.
const SUBJECT_PREFIX: &str = "soorma.events.";

pub struct NatsAdapter {
    url: String,
    client: Mutex<Option<async_nats::Client>>,
    /// Subscription id -> consumer tasks (one per subscribed pattern)
    consumers: Mutex<HashMap<String, Vec<JoinHandle<()>>>>,
}

impl NatsAdapter {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: Mutex::new(None),
            consumers: Mutex::new(HashMap::new()),
        }
    }

    fn current_client(&self) -> Option<async_nats::Client> {
        self.client.lock().expect("nats client poisoned").clone()
    }

    fn prefixed(topic: &str) -> String {
        format!("{}{}", SUBJECT_PREFIX, topic)
    }

    /// Drive one NATS subscriber, handing each message to the handler with
    /// the namespace prefix stripped.
    async fn consume(mut subscriber: async_nats::Subscriber, handler: MessageHandler) {
        while let Some(message) = subscriber.next().await {
            let subject = message.subject.as_str();
            let topic = subject
                .strip_prefix(SUBJECT_PREFIX)
                .unwrap_or(subject)
                .to_string();

            let envelope: EventEnvelope = match serde_json::from_slice(&message.payload) {
                Ok(env) => env,
                Err(e) => {
                    tracing::error!(subject, "dropping undecodable message: {}", e);
                    continue;
                }
            };

            if let Err(e) = handler(topic.clone(), envelope).await {
                tracing::error!(topic, "handler error: {:#}", e);
            }
        }
    }
}

#[async_trait]
impl BusAdapter for NatsAdapter {
    async fn connect(&self) -> Result<(), AdapterError> {
        if self.is_connected() {
            tracing::warn!("nats adapter already connected");
            return Ok(());
        }

        let client = async_nats::ConnectOptions::new()
            .event_callback(|event| async move {
                // Reconnects are handled by the client; we only log them.
                tracing::info!("nats connection event: {}", event);
            })
            .connect(self.url.as_str())
            .await
            .map_err(|e| AdapterError::Connection(e.to_string()))?;

        *self.client.lock().expect("nats client poisoned") = Some(client);
        tracing::info!(url = %self.url, "nats adapter connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), AdapterError> {
        let handles: Vec<JoinHandle<()>> = {
            let mut consumers = self.consumers.lock().expect("nats consumers poisoned");
            consumers.drain().flat_map(|(_, h)| h).collect()
        };
        for handle in handles {
            handle.abort();
        }

        let client = self.client.lock().expect("nats client poisoned").take();
        if let Some(client) = client {
            if let Err(e) = client.flush().await {
                tracing::warn!("nats flush on disconnect failed: {}", e);
            }
        }
        tracing::info!("nats adapter disconnected");
        Ok(())
    }

    async fn publish(&self, topic: &str, envelope: &EventEnvelope) -> Result<(), AdapterError> {
        let client = self.current_client().ok_or(AdapterError::NotConnected)?;

        let payload =
            serde_json::to_vec(envelope).map_err(|e| AdapterError::Publish(e.to_string()))?;

        client
            .publish(Self::prefixed(topic), payload.into())
            .await
            .map_err(|e| AdapterError::Publish(e.to_string()))
    }

    async fn subscribe(
        &self,
        patterns: Vec<String>,
        handler: MessageHandler,
        subscription_id: Option<String>,
        queue_group: Option<String>,
    ) -> Result<String, AdapterError> {
        let client = self.current_client().ok_or(AdapterError::NotConnected)?;
        let sub_id = subscription_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let queue_group = queue_group.filter(|g| !g.is_empty());

        let mut handles = Vec::with_capacity(patterns.len());
        for pattern in &patterns {
            // NATS wildcards use the same `*`/`>` grammar, so patterns pass
            // through unchanged under the namespace prefix.
            let subject = Self::prefixed(pattern);
            let subscriber = match &queue_group {
                Some(group) => client
                    .queue_subscribe(subject, group.clone())
                    .await
                    .map_err(|e| AdapterError::Subscribe(e.to_string()))?,
                None => client
                    .subscribe(subject)
                    .await
                    .map_err(|e| AdapterError::Subscribe(e.to_string()))?,
            };
            handles.push(tokio::spawn(Self::consume(subscriber, handler.clone())));
        }

        self.consumers
            .lock()
            .expect("nats consumers poisoned")
            .insert(sub_id.clone(), handles);

        tracing::info!(?patterns, sub_id, queue_group = ?queue_group, "nats subscription active");
        Ok(sub_id)
    }

    async fn unsubscribe(&self, subscription_id: &str) -> Result<(), AdapterError> {
        let handles = self
            .consumers
            .lock()
            .expect("nats consumers poisoned")
            .remove(subscription_id);

        match handles {
            Some(handles) => {
                for handle in handles {
                    handle.abort();
                }
                tracing::info!(subscription_id, "nats subscription removed");
            }
            None => tracing::warn!(subscription_id, "subscription not found"),
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.current_client()
            .map(|c| c.connection_state() == async_nats::connection::State::Connected)
            .unwrap_or(false)
    }

    fn name(&self) -> &'static str {
        "nats"
    }
}
