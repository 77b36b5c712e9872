//! streams-adapter: Log-backed transport for the cluster engine.
//!
//! Durable messages are appended to partitioned streams and tailed by every
//! node; queries and their replies travel over pub/sub. Disconnected
//! sessions are persisted with an expiry and restored by replaying the log.
//!
//! The substrate is abstracted as [`StreamBackend`]; [`InMemoryBackend`]
//! implements it in-process.

pub mod adapter;
pub mod backend;
pub mod config;
pub mod error;
pub mod fiddle_config;
pub mod memory;
pub mod partition;
pub mod publisher;
pub mod session;

// Re-export key types for convenience
pub use adapter::{NamespaceAdapter, StreamsAdapter};
pub use backend::{BackendError, PubSubMode, StreamBackend, StreamEntry, TopicReceiver};
pub use config::StreamsConfig;
pub use error::{AdapterError, RecoveryError, Result};
pub use fiddle_config::FiddleConfig;
pub use memory::InMemoryBackend;
pub use partition::{hash_code, partition_index, stream_name, stream_names};
pub use publisher::{StreamPublisher, private_topic, public_topic};
pub use session::{MAX_RANGE_READS, SessionStore};
