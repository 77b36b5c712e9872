//! Connection state recovery on top of the log.
//!
//! A disconnecting client's state is stored under `<prefix><pid>` with a TTL.
//! On reconnection the record is consumed and the channel's stream is replayed
//! from the client's last cursor to rebuild the packets it missed.

use crate::backend::StreamBackend;
use crate::config::StreamsConfig;
use crate::error::{AdapterError, RecoveryError};
use crate::partition;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use cluster_core::{
    Codec, LogCursor, MessageBody, MessageKind, PersistedSession, RawMessage, RestoredSession,
    should_include_packet,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Upper bound on range reads per restore. A client that missed more than
/// `MAX_RANGE_READS * read_count` entries gets a partial replay.
pub const MAX_RANGE_READS: usize = 100;

pub struct SessionStore {
    backend: Arc<dyn StreamBackend>,
    config: Arc<StreamsConfig>,
    codec: Codec,
    ttl: Duration,
}

impl SessionStore {
    pub fn new(backend: Arc<dyn StreamBackend>, config: Arc<StreamsConfig>, ttl: Duration) -> Self {
        let codec = Codec::new(config.only_plaintext);
        Self {
            backend,
            config,
            codec,
            ttl,
        }
    }

    /// Store `session` until it is restored or expires. Overwrites.
    pub async fn persist_session(&self, session: &PersistedSession) -> Result<(), AdapterError> {
        let bytes = bincode::serialize(session).map_err(|e| AdapterError::Encode(e.to_string()))?;
        let key = self.config.session_key(&session.pid);
        self.backend
            .set_with_expiry(&key, BASE64.encode(bytes), self.ttl)
            .await?;
        debug!("persisted session {} for {:?}", session.sid, self.ttl);
        Ok(())
    }

    /// Claim the session stored under `pid` and collect the broadcasts of
    /// `nsp` it missed after `offset`.
    ///
    /// The stored record is deleted even when the restore fails.
    pub async fn restore_session(
        &self,
        nsp: &str,
        pid: &str,
        offset: &str,
    ) -> Result<RestoredSession, RecoveryError> {
        let cursor: LogCursor = offset
            .parse()
            .map_err(|_| RecoveryError::InvalidCursor(offset.to_string()))?;

        let key = self.config.session_key(pid);
        let stream = partition::stream_name(&self.config, nsp);

        let (stored, anchor) = tokio::join!(
            self.backend.get_and_delete(&key),
            self.backend.read_range(&stream, cursor, Some(cursor), None),
        );
        let stored = stored?.ok_or(RecoveryError::NotFound)?;
        if anchor?.is_empty() {
            // The cursor was trimmed away; the replay would have a gap.
            return Err(RecoveryError::NotFound);
        }

        let bytes = BASE64
            .decode(stored)
            .map_err(|e| RecoveryError::Decode(e.to_string()))?;
        let persisted: PersistedSession =
            bincode::deserialize(&bytes).map_err(|e| RecoveryError::Decode(e.to_string()))?;

        let mut session = RestoredSession::new(persisted);
        self.collect_missed_packets(&stream, nsp, cursor, &mut session)
            .await?;
        Ok(session)
    }

    async fn collect_missed_packets(
        &self,
        stream: &str,
        nsp: &str,
        cursor: LogCursor,
        session: &mut RestoredSession,
    ) -> Result<(), RecoveryError> {
        let read_count = self.config.read_count;
        let mut start = cursor.next();

        for _ in 0..MAX_RANGE_READS {
            let entries = self
                .backend
                .read_range(stream, start, None, Some(read_count))
                .await?;
            let exhausted = entries.len() < read_count;

            for entry in entries {
                start = entry.cursor.next();

                let raw = match RawMessage::from_fields(&entry.fields) {
                    Ok(raw) => raw,
                    Err(e) => {
                        debug!("skipping malformed entry {}: {}", entry.cursor, e);
                        continue;
                    }
                };
                if raw.nsp != nsp || raw.message_kind() != Some(MessageKind::Broadcast) {
                    continue;
                }
                let message = match self.codec.decode(&raw) {
                    Ok(message) => message,
                    Err(e) => {
                        debug!("skipping undecodable entry {}: {}", entry.cursor, e);
                        continue;
                    }
                };

                if let MessageBody::Broadcast(mut payload) = message.body
                    && payload.packet.is_recoverable(&payload.opts)
                    && should_include_packet(&session.rooms, &payload.opts)
                {
                    payload.packet.push_cursor(entry.cursor);
                    session.missed_packets.push(payload.packet.data);
                }
            }

            if exhausted {
                return Ok(());
            }
        }

        warn!(
            "Stopped replaying {} after {} reads, session {} may miss packets",
            stream, MAX_RANGE_READS, session.sid
        );
        Ok(())
    }
}
