//! ClusterPublisher trait: how the engine hands messages to the substrate.
//!
//! Implementations:
//! - Log + pub/sub: `streams-adapter` (durable messages appended to a
//!   partitioned log, ephemeral ones over pub/sub)

use crate::cursor::LogCursor;
use crate::node_id::NodeId;
use crate::protocol::{ClusterMessage, CodecError};
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Encoding failed: {0}")]
    Encode(#[from] CodecError),

    #[error("Publish failed: {0}")]
    PublishFailed(String),

    #[error("Transport closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Outbound side of the cluster protocol.
#[async_trait]
pub trait ClusterPublisher: Send + Sync {
    /// Send a message to the other nodes of its channel.
    ///
    /// Returns the cursor assigned by the log for durable messages, `None`
    /// for messages sent over pub/sub.
    async fn publish(&self, message: &ClusterMessage) -> Result<Option<LogCursor>>;

    /// Send a reply to the node that issued a request.
    async fn publish_response(&self, requester: NodeId, message: &ClusterMessage) -> Result<()> {
        let _ = requester;
        self.publish(message).await.map(|_| ())
    }
}
