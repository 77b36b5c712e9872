//! Monitoring events of the cluster engine.
//!
//! Listeners run synchronously on the task that emitted the event.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

/// Cluster events emitted by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClusterEvent {
    /// First message received from a peer.
    NodeDiscovered {
        #[serde(rename = "nodeId")]
        node_id: String,
    },
    /// Peer silent for longer than the heartbeat timeout.
    NodeDown {
        #[serde(rename = "nodeId")]
        node_id: String,
    },
    /// Outgoing message accepted by the transport.
    MessagePublished {
        #[serde(rename = "messageType")]
        message_type: String,
        nsp: String,
    },
    /// Incoming message from another node or an emitter.
    MessageReceived {
        #[serde(rename = "messageType")]
        message_type: String,
        nsp: String,
        /// Sender uid, `"emitter"` for external publishers.
        origin: String,
    },
    /// A multi-node request gave up waiting.
    RequestTimedOut {
        #[serde(rename = "messageType")]
        message_type: String,
        received: usize,
        expected: usize,
    },
}

/// Keeps a listener registered. Dropping it removes the listener.
pub struct Subscription {
    bus: Weak<EventBus>,
    key: u64,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(self.key);
        }
    }
}

type Listener = Arc<dyn Fn(ClusterEvent) + Send + Sync>;

/// Fans [`ClusterEvent`]s out to listeners. Share it behind an `Arc`.
#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<BTreeMap<u64, Listener>>,
    next_key: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(
        self: &Arc<Self>,
        listener: impl Fn(ClusterEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, Arc::new(listener));
        Subscription {
            bus: Arc::downgrade(self),
            key,
        }
    }

    fn remove(&self, key: u64) {
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&key);
    }

    pub fn emit(&self, event: ClusterEvent) {
        let snapshot: Vec<Listener> = self
            .listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();

        if let Some((last, rest)) = snapshot.split_last() {
            for listener in rest {
                listener(event.clone());
            }
            last(event);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.listeners.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}
