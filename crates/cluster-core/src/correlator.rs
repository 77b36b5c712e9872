//! Request correlation for multi-node requests.
//!
//! Two shapes of request exist:
//! - **Counted** ([`RequestCorrelator`]): one reply is expected from every
//!   live peer. The request completes when the count is reached, or fails with
//!   the partial result when its timeout fires first.
//! - **Acknowledgement** ([`AckRegistry`]): replies are streamed to callbacks
//!   as they arrive. The entry is simply forgotten after the caller's timeout.

use crate::local::{AckCallback, ClientCountCallback};
use crate::protocol::MessageKind;
use crate::transport::TransportError;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;

/// Random identifier matching replies to their request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    pub fn generate() -> Self {
        use rand::Rng;
        let id: u64 = rand::rng().random();
        Self(format!("{:016x}", id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequestId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

#[derive(Debug, Error)]
pub enum RequestError<T> {
    /// Not every peer answered in time. `responses` holds what did arrive.
    #[error("timeout reached: only {received} responses received out of {expected}")]
    Timeout {
        received: usize,
        expected: usize,
        responses: Vec<T>,
    },

    #[error("Failed to publish request: {0}")]
    Publish(#[from] TransportError),

    #[error("Adapter closed before the request completed")]
    Closed,
}

impl<T> RequestError<T> {
    /// Responses gathered before the failure.
    pub fn into_partial(self) -> Vec<T> {
        match self {
            RequestError::Timeout { responses, .. } => responses,
            _ => Vec::new(),
        }
    }
}

struct Pending<T> {
    kind: MessageKind,
    expected: usize,
    received: usize,
    responses: Vec<T>,
    done: oneshot::Sender<Vec<T>>,
}

/// Snapshot of a request whose timeout fired.
#[derive(Debug)]
pub struct Expired<T> {
    pub kind: MessageKind,
    pub received: usize,
    pub expected: usize,
    pub responses: Vec<T>,
}

/// In-flight counted requests keyed by [`RequestId`].
pub struct RequestCorrelator<T> {
    pending: Mutex<HashMap<RequestId, Pending<T>>>,
}

impl<T> Default for RequestCorrelator<T> {
    fn default() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }
}

impl<T: Send + 'static> RequestCorrelator<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a request that needs `expected` replies.
    ///
    /// `seed` is included in the result ahead of any reply. Dropping the
    /// returned handle before it resolves forgets the request.
    pub fn register(
        &self,
        id: RequestId,
        kind: MessageKind,
        expected: usize,
        seed: Vec<T>,
    ) -> PendingRequest<'_, T> {
        let (done, rx) = oneshot::channel();
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).insert(
            id.clone(),
            Pending {
                kind,
                expected,
                received: 0,
                responses: seed,
                done,
            },
        );
        PendingRequest {
            correlator: self,
            id,
            rx,
        }
    }

    /// Record one node's reply. Returns `false` for unknown (or already
    /// completed) requests.
    pub fn record(&self, id: &RequestId, items: impl IntoIterator<Item = T>) -> bool {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        let Some(request) = pending.get_mut(id) else {
            return false;
        };

        request.received += 1;
        request.responses.extend(items);

        if request.received >= request.expected
            && let Some(request) = pending.remove(id)
        {
            // The waiter may already be gone; nothing to do then.
            let _ = request.done.send(request.responses);
        }
        true
    }

    /// Remove a request because its deadline passed.
    pub fn expire(&self, id: &RequestId) -> Option<Expired<T>> {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id)
            .map(|request| Expired {
                kind: request.kind,
                received: request.received,
                expected: request.expected,
                responses: request.responses,
            })
    }

    pub fn cancel(&self, id: &RequestId) {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
    }

    /// Drop every in-flight request. Waiters resolve with
    /// [`RequestError::Closed`].
    pub fn close_all(&self) -> usize {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        let count = pending.len();
        pending.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handle to a registered request. Forgets the request when dropped.
pub struct PendingRequest<'a, T: Send + 'static> {
    correlator: &'a RequestCorrelator<T>,
    id: RequestId,
    rx: oneshot::Receiver<Vec<T>>,
}

impl<T: Send + 'static> PendingRequest<'_, T> {
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    /// Wait for every reply, or fail with the partial result after `timeout`.
    pub async fn wait(mut self, timeout: Duration) -> Result<Vec<T>, RequestError<T>> {
        let sleep = tokio::time::sleep(timeout);
        tokio::pin!(sleep);

        tokio::select! {
            result = &mut self.rx => result.map_err(|_| RequestError::Closed),
            _ = &mut sleep => match self.correlator.expire(&self.id) {
                Some(expired) => Err(RequestError::Timeout {
                    received: expired.received,
                    expected: expired.expected,
                    responses: expired.responses,
                }),
                // Completed between the deadline and the lock.
                None => (&mut self.rx).await.map_err(|_| RequestError::Closed),
            },
        }
    }
}

impl<T: Send + 'static> Drop for PendingRequest<'_, T> {
    fn drop(&mut self) {
        self.correlator.cancel(&self.id);
    }
}

struct AckEntry {
    on_client_count: ClientCountCallback,
    on_ack: AckCallback,
    timer: Option<JoinHandle<()>>,
}

impl AckEntry {
    fn cancel(mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

/// Callbacks of acknowledged broadcasts, keyed by [`RequestId`].
#[derive(Default)]
pub struct AckRegistry {
    entries: Mutex<HashMap<RequestId, AckEntry>>,
}

impl AckRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register callbacks, forgotten after `ttl`. Must be called from within
    /// a Tokio runtime.
    pub fn register(
        self: &Arc<Self>,
        id: RequestId,
        on_client_count: ClientCountCallback,
        on_ack: AckCallback,
        ttl: Duration,
    ) {
        let registry: Weak<Self> = Arc::downgrade(self);
        let timer_id = id.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            if let Some(registry) = registry.upgrade() {
                debug!("forgetting acknowledgement request {}", timer_id);
                registry
                    .entries
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&timer_id);
            }
        });

        let replaced = self.entries.lock().unwrap_or_else(|e| e.into_inner()).insert(
            id,
            AckEntry {
                on_client_count,
                on_ack,
                timer: Some(timer),
            },
        );
        if let Some(replaced) = replaced {
            replaced.cancel();
        }
    }

    /// Forward a client count. Returns `false` for unknown requests.
    pub fn client_count(&self, id: &RequestId, count: u64) -> bool {
        let callback = self
            .entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .map(|entry| Arc::clone(&entry.on_client_count));
        match callback {
            Some(callback) => {
                callback(count);
                true
            }
            None => false,
        }
    }

    /// Forward one acknowledgement. Returns `false` for unknown requests.
    pub fn ack(&self, id: &RequestId, value: Value) -> bool {
        let callback = self
            .entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .map(|entry| Arc::clone(&entry.on_ack));
        match callback {
            Some(callback) => {
                callback(value);
                true
            }
            None => false,
        }
    }

    /// Forget a request and cancel its expiry timer.
    pub fn remove(&self, id: &RequestId) -> bool {
        let removed = self
            .entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
        match removed {
            Some(entry) => {
                entry.cancel();
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: &RequestId) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(id)
    }

    pub fn close_all(&self) {
        let entries: Vec<AckEntry> = self
            .entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, entry)| entry)
            .collect();
        for entry in entries {
            entry.cancel();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
