//! [`ClusterPublisher`] over a [`StreamBackend`].
//!
//! Durable messages are appended to the channel's partition. Ephemeral ones
//! are published on the channel topic, and replies on the requester's private
//! topic.

use crate::backend::StreamBackend;
use crate::config::StreamsConfig;
use crate::partition;
use async_trait::async_trait;
use cluster_core::transport::Result;
use cluster_core::{ClusterMessage, ClusterPublisher, Codec, Delivery, LogCursor, NodeId};
use std::sync::Arc;
use tracing::debug;

/// Topic every node of `nsp` subscribes to.
pub fn public_topic(prefix: &str, nsp: &str) -> String {
    format!("{}#{}#", prefix, nsp)
}

/// Topic only node `uid` of `nsp` subscribes to.
pub fn private_topic(prefix: &str, nsp: &str, uid: NodeId) -> String {
    format!("{}#{}#{}#", prefix, nsp, uid)
}

pub struct StreamPublisher {
    backend: Arc<dyn StreamBackend>,
    config: Arc<StreamsConfig>,
    codec: Codec,
}

impl StreamPublisher {
    pub fn new(backend: Arc<dyn StreamBackend>, config: Arc<StreamsConfig>) -> Self {
        let codec = Codec::new(config.only_plaintext);
        Self {
            backend,
            config,
            codec,
        }
    }

    async fn append(&self, message: &ClusterMessage) -> Result<LogCursor> {
        let stream = partition::stream_name(&self.config, &message.nsp);
        let fields = self.codec.encode(message)?.to_fields();
        let cursor = self
            .backend
            .append(&stream, fields, self.config.max_len)
            .await?;
        debug!("appended {} to {} at {}", message.kind(), stream, cursor);
        Ok(cursor)
    }

    async fn publish_on(&self, topic: String, message: &ClusterMessage) -> Result<()> {
        let payload = self.codec.encode_binary(message)?;
        let receivers = self
            .backend
            .publish(self.config.pubsub_mode(), &topic, payload)
            .await?;
        debug!("published {} on {} ({} receivers)", message.kind(), topic, receivers);
        Ok(())
    }
}

#[async_trait]
impl ClusterPublisher for StreamPublisher {
    async fn publish(&self, message: &ClusterMessage) -> Result<Option<LogCursor>> {
        match message.delivery() {
            Delivery::Log => self.append(message).await.map(Some),
            Delivery::PubSub | Delivery::Response => {
                let topic = public_topic(&self.config.channel_prefix, &message.nsp);
                self.publish_on(topic, message).await.map(|_| None)
            }
        }
    }

    async fn publish_response(&self, requester: NodeId, message: &ClusterMessage) -> Result<()> {
        let topic = private_topic(&self.config.channel_prefix, &message.nsp, requester);
        self.publish_on(topic, message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::PubSubMode;
    use crate::memory::InMemoryBackend;
    use cluster_core::protocol::message::{BroadcastPayload, ClientCountPayload, RoomsPayload};
    use cluster_core::{BroadcastOptions, MessageBody, Packet, RawMessage, RequestId, Value};

    fn setup(config: StreamsConfig) -> (Arc<InMemoryBackend>, StreamPublisher) {
        let backend = InMemoryBackend::new();
        let publisher = StreamPublisher::new(backend.clone(), Arc::new(config));
        (backend, publisher)
    }

    fn uid() -> NodeId {
        NodeId::from(0xabc)
    }

    #[test]
    fn test_topics() {
        assert_eq!(public_topic("socket.io", "/"), "socket.io#/#");
        assert_eq!(
            private_topic("socket.io", "/", uid()),
            "socket.io#/#0000000000000abc#"
        );
    }

    #[tokio::test]
    async fn test_durable_message_is_appended() {
        let (backend, publisher) = setup(StreamsConfig::default());
        let message = ClusterMessage::new(
            Some(uid()),
            "/",
            MessageBody::SocketsJoin(RoomsPayload {
                opts: BroadcastOptions::new(),
                rooms: vec!["room1".into()],
            }),
        );

        let cursor = publisher.publish(&message).await.unwrap();
        let entries = backend.entries("socket.io");
        assert_eq!(entries.len(), 1);
        assert_eq!(Some(entries[0].cursor), cursor);

        let raw = RawMessage::from_fields(&entries[0].fields).unwrap();
        assert_eq!(raw.kind, "4");
        assert_eq!(Codec::default().decode(&raw).unwrap(), message);
    }

    #[tokio::test]
    async fn test_binary_broadcast_in_plaintext_mode_is_json() {
        let (backend, publisher) = setup(StreamsConfig {
            only_plaintext: true,
            ..Default::default()
        });
        let message = ClusterMessage::new(
            Some(uid()),
            "/",
            MessageBody::Broadcast(BroadcastPayload {
                packet: Packet::event("e", [Value::binary(vec![1, 2, 3])]),
                request_id: None,
                opts: BroadcastOptions::new(),
            }),
        );
        publisher.publish(&message).await.unwrap();

        let raw = RawMessage::from_fields(&backend.entries("socket.io")[0].fields).unwrap();
        assert!(raw.data.unwrap().starts_with('{'));
    }

    #[tokio::test]
    async fn test_ephemeral_message_goes_to_public_topic() {
        let (backend, publisher) = setup(StreamsConfig::default());
        let mut rx = backend
            .subscribe(PubSubMode::Classic, &[public_topic("socket.io", "/")])
            .await
            .unwrap();
        let message = ClusterMessage::new(
            Some(uid()),
            "/",
            MessageBody::Broadcast(BroadcastPayload {
                packet: Packet::event("e", []),
                request_id: Some(RequestId::from("r1")),
                opts: BroadcastOptions::new(),
            }),
        );

        assert_eq!(publisher.publish(&message).await.unwrap(), None);
        let (topic, payload) = rx.recv().await.unwrap();
        assert_eq!(topic, "socket.io#/#");
        assert_eq!(Codec::default().decode_binary(&payload).unwrap(), message);
        assert_eq!(backend.stream_len("socket.io"), 0);
    }

    #[tokio::test]
    async fn test_response_goes_to_private_topic() {
        let (backend, publisher) = setup(StreamsConfig {
            use_sharded_pubsub: true,
            ..Default::default()
        });
        let requester = NodeId::from(7);
        let mut rx = backend
            .subscribe(
                PubSubMode::Sharded,
                &[private_topic("socket.io", "/", requester)],
            )
            .await
            .unwrap();
        let message = ClusterMessage::new(
            Some(uid()),
            "/",
            MessageBody::BroadcastClientCount(ClientCountPayload {
                request_id: RequestId::from("r1"),
                client_count: 3,
            }),
        );

        publisher.publish_response(requester, &message).await.unwrap();
        let (_, payload) = rx.recv().await.unwrap();
        assert_eq!(Codec::default().decode_binary(&payload).unwrap(), message);
    }

    #[tokio::test]
    async fn test_backend_failure_is_reported() {
        let (backend, publisher) = setup(StreamsConfig::default());
        backend.fail_next_appends(1);
        let message = ClusterMessage::new(Some(uid()), "/", MessageBody::Heartbeat);
        assert!(publisher.publish(&message).await.is_err());
        assert!(publisher.publish(&message).await.is_ok());
    }
}
