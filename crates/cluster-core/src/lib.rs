//! cluster-core: Transport-independent clustering protocol for real-time
//! event broadcasting.
//!
//! This crate provides:
//! - The cluster protocol engine (broadcasts, room management, multi-node
//!   queries, heartbeats)
//! - Heartbeat-based membership tracking
//! - Request correlation with bounded waits and partial results
//! - The wire codec (flat log fields and compact pub/sub payloads)
//! - `LocalAdapter` and `ClusterPublisher` trait abstractions, plus an
//!   in-memory namespace
//! - Session records for connection state recovery

pub mod config;
pub mod correlator;
pub mod cursor;
pub mod engine;
pub mod events;
pub mod local;
pub mod membership;
pub mod node_id;
pub mod protocol;
pub mod session;
pub mod transport;
pub mod value;

pub use config::{ClusterConfig, DEFAULT_REQUEST_TIMEOUT_MS, RecoveryConfig};
pub use correlator::{RequestError, RequestId};
pub use cursor::{CursorError, LogCursor};
pub use engine::ClusterEngine;
pub use events::{ClusterEvent, EventBus, Subscription};
pub use local::{
    AckCallback, ClientCountCallback, LocalAdapter, MemoryNamespace, ServerSideReply,
    SocketDetails,
};
pub use node_id::{EMITTER_UID, NodeId, NodeIdError};
pub use protocol::{
    BroadcastFlags, BroadcastOptions, ClusterMessage, Codec, CodecError, Delivery, MessageBody,
    MessageKind, Packet, PacketType, RawMessage, Room,
};
pub use session::{PersistedSession, RestoredSession, should_include_packet};
pub use transport::{ClusterPublisher, TransportError};
pub use value::Value;
