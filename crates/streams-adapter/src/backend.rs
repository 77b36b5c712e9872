//! StreamBackend trait: the log + pub/sub + key/value substrate.
//!
//! Implementations:
//! - `InMemoryBackend` - in-process, for tests and the fiddle binary
//!
//! One backend value stands for one client connection. Blocking reads and
//! subscriptions use dedicated connections obtained with
//! [`StreamBackend::duplicate`].

use async_trait::async_trait;
use cluster_core::{LogCursor, TransportError};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Connection closed")]
    Disconnected,

    #[error("Command failed: {0}")]
    Command(String),
}

pub type Result<T> = std::result::Result<T, BackendError>;

impl From<BackendError> for TransportError {
    fn from(e: BackendError) -> Self {
        match e {
            BackendError::Disconnected => TransportError::Closed,
            BackendError::Command(msg) => TransportError::PublishFailed(msg),
        }
    }
}

/// Classic pub/sub, or sharded pub/sub where topics are bound to a shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PubSubMode {
    Classic,
    Sharded,
}

impl PubSubMode {
    pub fn from_sharded(sharded: bool) -> Self {
        if sharded {
            PubSubMode::Sharded
        } else {
            PubSubMode::Classic
        }
    }
}

/// One log entry: its cursor and flat string fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub cursor: LogCursor,
    pub fields: Vec<(String, String)>,
}

/// Messages received on subscribed topics: `(topic, payload)`.
pub type TopicReceiver = mpsc::UnboundedReceiver<(String, Vec<u8>)>;

#[async_trait]
pub trait StreamBackend: Send + Sync {
    /// Append an entry, trimming the stream to roughly `max_len` entries.
    async fn append(
        &self,
        stream: &str,
        fields: Vec<(String, String)>,
        max_len: usize,
    ) -> Result<LogCursor>;

    /// Cursor of the newest entry, `None` for an empty stream.
    async fn latest_cursor(&self, stream: &str) -> Result<Option<LogCursor>>;

    /// Up to `count` entries strictly after `after`. Waits up to `block` for
    /// the first one and returns an empty list when none arrived.
    async fn read_tail(
        &self,
        stream: &str,
        after: LogCursor,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>>;

    /// Entries with `start <= cursor <= end` (`end = None`: no upper bound),
    /// at most `count` of them.
    async fn read_range(
        &self,
        stream: &str,
        start: LogCursor,
        end: Option<LogCursor>,
        count: Option<usize>,
    ) -> Result<Vec<StreamEntry>>;

    /// Returns the number of receivers.
    async fn publish(&self, mode: PubSubMode, topic: &str, payload: Vec<u8>) -> Result<usize>;

    /// Subscribe this connection to `topics`.
    async fn subscribe(&self, mode: PubSubMode, topics: &[String]) -> Result<TopicReceiver>;

    async fn unsubscribe(&self, mode: PubSubMode, topics: &[String]) -> Result<()>;

    /// Store a value that disappears after `ttl`. Overwrites.
    async fn set_with_expiry(&self, key: &str, value: String, ttl: Duration) -> Result<()>;

    /// Atomically read and delete a key.
    async fn get_and_delete(&self, key: &str) -> Result<Option<String>>;

    /// Number of connections subscribed to `topic`, over every substrate node.
    async fn subscriber_count(&self, mode: PubSubMode, topic: &str) -> Result<usize>;

    /// Open another connection to the same substrate.
    async fn duplicate(&self) -> Result<Arc<dyn StreamBackend>>;

    /// Close this connection. Pending blocking reads fail and subscriptions
    /// end.
    async fn disconnect(&self);
}
