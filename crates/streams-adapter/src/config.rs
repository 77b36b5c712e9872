//! Log transport configuration.

use crate::backend::PubSubMode;
use crate::error::{AdapterError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamsConfig {
    /// Base name of the log streams (default: "socket.io")
    #[serde(default = "default_stream_name")]
    pub stream_name: String,

    /// Number of partitions (default: 1)
    #[serde(default = "default_stream_count")]
    pub stream_count: usize,

    /// Prefix of the pub/sub topics (default: "socket.io")
    #[serde(default = "default_channel_prefix")]
    pub channel_prefix: String,

    /// Use sharded pub/sub for ephemeral messages
    #[serde(default)]
    pub use_sharded_pubsub: bool,

    /// Approximate maximum number of entries per stream (default: 10000)
    #[serde(default = "default_max_len")]
    pub max_len: usize,

    /// Entries fetched per read (default: 100)
    #[serde(default = "default_read_count")]
    pub read_count: usize,

    /// How long a tail read blocks before polling again (default: 5s)
    #[serde(default = "default_block_time")]
    pub block_time_ms: u64,

    /// Key prefix of persisted sessions (default: "sio:session:")
    #[serde(default = "default_session_key_prefix")]
    pub session_key_prefix: String,

    /// Always encode log payloads as JSON
    #[serde(default)]
    pub only_plaintext: bool,
}

impl Default for StreamsConfig {
    fn default() -> Self {
        Self {
            stream_name: default_stream_name(),
            stream_count: default_stream_count(),
            channel_prefix: default_channel_prefix(),
            use_sharded_pubsub: false,
            max_len: default_max_len(),
            read_count: default_read_count(),
            block_time_ms: default_block_time(),
            session_key_prefix: default_session_key_prefix(),
            only_plaintext: false,
        }
    }
}

impl StreamsConfig {
    pub fn validate(&self) -> Result<()> {
        if self.stream_count == 0 {
            return Err(AdapterError::InvalidConfig(
                "stream_count must be at least 1".into(),
            ));
        }
        if self.read_count == 0 {
            return Err(AdapterError::InvalidConfig(
                "read_count must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn block_time(&self) -> Duration {
        Duration::from_millis(self.block_time_ms)
    }

    pub fn pubsub_mode(&self) -> PubSubMode {
        PubSubMode::from_sharded(self.use_sharded_pubsub)
    }

    pub fn session_key(&self, pid: &str) -> String {
        format!("{}{}", self.session_key_prefix, pid)
    }
}

fn default_stream_name() -> String {
    "socket.io".to_string()
}

fn default_stream_count() -> usize {
    1
}

fn default_channel_prefix() -> String {
    "socket.io".to_string()
}

fn default_max_len() -> usize {
    10_000
}

fn default_read_count() -> usize {
    100
}

fn default_block_time() -> u64 {
    5_000
}

fn default_session_key_prefix() -> String {
    "sio:session:".to_string()
}
