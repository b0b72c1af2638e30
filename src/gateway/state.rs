// Gateway state types and per-connection queue
//
// The gateway owns every live SSE connection. Each connection gets a bounded
// FIFO of envelopes; the adapter callback is the single producer and the SSE
// loop the single consumer. The queue must never block the adapter: when it
// is full the OLDEST pending envelope is dropped to make room — availability
// over completeness, and agents must tolerate gaps.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use tokio::sync::{watch, Notify};

use crate::bus::BusAdapter;
use crate::config::EventServiceConfig;
use crate::events::EventEnvelope;

// ─────────────────────────────────────────────────────────────────────────────
// Bounded stream queue
// ─────────────────────────────────────────────────────────────────────────────

struct QueueInner {
    items: VecDeque<EventEnvelope>,
    dropped: u64,
}

/// Bounded drop-oldest FIFO between the adapter callback and one SSE loop.
pub struct StreamQueue {
    capacity: usize,
    inner: Mutex<QueueInner>,
    notify: Notify,
}

impl StreamQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(QueueInner {
                items: VecDeque::new(),
                dropped: 0,
            }),
            notify: Notify::new(),
        }
    }

    /// Enqueue without blocking. Drops the oldest pending envelope when full.
    pub fn push(&self, envelope: EventEnvelope) {
        let mut inner = self.inner.lock().expect("stream queue poisoned");
        if inner.items.len() >= self.capacity {
            inner.items.pop_front();
            inner.dropped += 1;
        }
        inner.items.push_back(envelope);
        drop(inner);
        // notify_one stores a permit when no consumer is waiting, so a push
        // that races the consumer between lock release and await is not lost.
        self.notify.notify_one();
    }

    /// Wait for the next envelope.
    pub async fn pop(&self) -> EventEnvelope {
        loop {
            if let Some(item) = self
                .inner
                .lock()
                .expect("stream queue poisoned")
                .items
                .pop_front()
            {
                return item;
            }
            self.notify.notified().await;
        }
    }

    /// Envelopes currently waiting to be streamed.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("stream queue poisoned").items.len()
    }

    /// Envelopes discarded because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.inner.lock().expect("stream queue poisoned").dropped
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Connection table
// ─────────────────────────────────────────────────────────────────────────────

/// Bookkeeping for one live SSE connection, kept for the admin endpoint.
pub struct ConnectionInfo {
    pub agent_id: String,
    pub topics: Vec<String>,
    pub queue: Arc<StreamQueue>,
}

/// Shared state for the Event Service.
#[derive(Clone)]
pub struct GatewayState {
    /// The configured bus backend
    pub adapter: Arc<dyn BusAdapter>,
    /// Active SSE connections: connection_id -> info
    pub connections: Arc<Mutex<HashMap<String, ConnectionInfo>>>,
    /// Flipped to true once at shutdown. A watch channel rather than a
    /// notification: a stream loop that is mid-send when the flag flips
    /// still observes it on its next iteration.
    shutdown: Arc<watch::Sender<bool>>,
    pub config: Arc<EventServiceConfig>,
}

impl GatewayState {
    pub fn new(adapter: Arc<dyn BusAdapter>, config: EventServiceConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            adapter,
            connections: Arc::new(Mutex::new(HashMap::new())),
            shutdown: Arc::new(shutdown),
            config: Arc::new(config),
        }
    }

    /// Per-connection view of the shutdown flag.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Tell every stream loop to wind down.
    pub fn begin_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn active_streams(&self) -> usize {
        self.connections.lock().expect("connections poisoned").len()
    }

    pub fn register_connection(&self, connection_id: &str, info: ConnectionInfo) {
        self.connections
            .lock()
            .expect("connections poisoned")
            .insert(connection_id.to_string(), info);
    }

    pub fn remove_connection(&self, connection_id: &str) {
        self.connections
            .lock()
            .expect("connections poisoned")
            .remove(connection_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventTopic;

    fn envelope(n: usize) -> EventEnvelope {
        let mut e = EventEnvelope::new("test", "unit.test", EventTopic::ActionRequests);
        e.id = format!("E{}", n);
        e
    }

    #[tokio::test]
    async fn queue_delivers_in_fifo_order() {
        let queue = StreamQueue::new(8);
        queue.push(envelope(1));
        queue.push(envelope(2));
        assert_eq!(queue.pop().await.id, "E1");
        assert_eq!(queue.pop().await.id, "E2");
    }

    #[tokio::test]
    async fn overflow_drops_oldest_and_counts() {
        let queue = StreamQueue::new(3);
        for n in 0..5 {
            queue.push(envelope(n));
        }
        // E0 and E1 were dropped to make room for E3 and E4.
        assert_eq!(queue.dropped(), 2);
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.pop().await.id, "E2");
        assert_eq!(queue.pop().await.id, "E3");
        assert_eq!(queue.pop().await.id, "E4");
    }

    #[tokio::test]
    async fn pop_wakes_on_push() {
        let queue = Arc::new(StreamQueue::new(4));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await.id })
        };
        // Give the consumer a chance to start waiting first.
        tokio::task::yield_now().await;
        queue.push(envelope(7));
        assert_eq!(consumer.await.unwrap(), "E7");
    }

    #[tokio::test]
    async fn sustained_overflow_never_grows_past_capacity() {
        let queue = StreamQueue::new(16);
        for n in 0..10_000 {
            queue.push(envelope(n));
        }
        assert_eq!(queue.len(), 16);
        assert_eq!(queue.dropped(), 10_000 - 16);
    }
}
