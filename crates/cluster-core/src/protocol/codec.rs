//! Message encoding.
//!
//! Two encodings are in use:
//! - **Log fields**: flat string fields `uid`, `nsp`, `type` and an optional
//!   `data`. `data` is JSON text (always starts with `{`) or, for payloads
//!   carrying binary, base64 of the bincode encoding.
//! - **Pub/sub**: bincode of the whole [`ClusterMessage`].

use super::message::{ClusterMessage, MessageBody, MessageKind};
use crate::node_id::{NodeIdError, format_origin, parse_origin};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Invalid uid: {0}")]
    InvalidUid(#[from] NodeIdError),

    #[error("Unknown message type: {0:?}")]
    UnknownKind(String),

    #[error("Missing field: {0}")]
    MissingField(&'static str),

    #[error("Missing data for message type {0}")]
    MissingData(MessageKind),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Base64 error: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Bincode error: {0}")]
    Bincode(#[from] bincode::Error),
}

pub type Result<T> = std::result::Result<T, CodecError>;

/// Encoding of a log entry's `data` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataEncoding {
    Json,
    Binary,
    Empty,
}

/// Detect how a `data` field was encoded.
///
/// JSON payloads are always objects, so they start with `{`. The base64
/// alphabet never contains `{`.
pub fn detect_data_encoding(data: &str) -> DataEncoding {
    match data.as_bytes().first() {
        Some(b'{') => DataEncoding::Json,
        Some(_) => DataEncoding::Binary,
        None => DataEncoding::Empty,
    }
}

/// A log entry in its flat-field form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub uid: String,
    pub nsp: String,
    /// Message kind ordinal as a decimal string.
    pub kind: String,
    pub data: Option<String>,
}

impl RawMessage {
    pub fn to_fields(&self) -> Vec<(String, String)> {
        let mut fields = vec![
            ("uid".to_string(), self.uid.clone()),
            ("nsp".to_string(), self.nsp.clone()),
            ("type".to_string(), self.kind.clone()),
        ];
        if let Some(data) = &self.data {
            fields.push(("data".to_string(), data.clone()));
        }
        fields
    }

    /// Rebuild from log fields. Unknown fields are ignored.
    pub fn from_fields(fields: &[(String, String)]) -> Result<Self> {
        let get = |name: &str| {
            fields
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.clone())
        };
        Ok(Self {
            uid: get("uid").unwrap_or_default(),
            nsp: get("nsp").ok_or(CodecError::MissingField("nsp"))?,
            kind: get("type").ok_or(CodecError::MissingField("type"))?,
            data: get("data"),
        })
    }

    pub fn message_kind(&self) -> Option<MessageKind> {
        self.kind.parse().ok().and_then(MessageKind::from_ordinal)
    }
}

/// Converts [`ClusterMessage`]s to and from their wire encodings.
#[derive(Debug, Clone, Copy, Default)]
pub struct Codec {
    /// Skip binary detection and always write JSON.
    pub only_plaintext: bool,
}

impl Codec {
    pub fn new(only_plaintext: bool) -> Self {
        Self { only_plaintext }
    }

    pub fn encode(&self, message: &ClusterMessage) -> Result<RawMessage> {
        let kind = message.kind();
        let binary = !self.only_plaintext && kind.may_carry_binary() && message.has_binary();

        let data = match &message.body {
            MessageBody::InitialHeartbeat | MessageBody::Heartbeat => None,
            MessageBody::Broadcast(p) => Some(encode_data(p, binary)?),
            MessageBody::SocketsJoin(p) | MessageBody::SocketsLeave(p) => {
                Some(encode_data(p, binary)?)
            }
            MessageBody::DisconnectSockets(p) => Some(encode_data(p, binary)?),
            MessageBody::FetchSockets(p) => Some(encode_data(p, binary)?),
            MessageBody::FetchSocketsResponse(p) => Some(encode_data(p, binary)?),
            MessageBody::ServerSideEmit(p) => Some(encode_data(p, binary)?),
            MessageBody::ServerSideEmitResponse(p) | MessageBody::BroadcastAck(p) => {
                Some(encode_data(p, binary)?)
            }
            MessageBody::BroadcastClientCount(p) => Some(encode_data(p, binary)?),
        };

        Ok(RawMessage {
            uid: format_origin(message.uid),
            nsp: message.nsp.clone(),
            kind: kind.ordinal().to_string(),
            data,
        })
    }

    pub fn decode(&self, raw: &RawMessage) -> Result<ClusterMessage> {
        let kind = raw
            .message_kind()
            .ok_or_else(|| CodecError::UnknownKind(raw.kind.clone()))?;
        let data = raw.data.as_deref();

        let body = match kind {
            MessageKind::InitialHeartbeat => MessageBody::InitialHeartbeat,
            MessageKind::Heartbeat => MessageBody::Heartbeat,
            MessageKind::Broadcast => MessageBody::Broadcast(decode_data(kind, data)?),
            MessageKind::SocketsJoin => MessageBody::SocketsJoin(decode_data(kind, data)?),
            MessageKind::SocketsLeave => MessageBody::SocketsLeave(decode_data(kind, data)?),
            MessageKind::DisconnectSockets => {
                MessageBody::DisconnectSockets(decode_data(kind, data)?)
            }
            MessageKind::FetchSockets => MessageBody::FetchSockets(decode_data(kind, data)?),
            MessageKind::FetchSocketsResponse => {
                MessageBody::FetchSocketsResponse(decode_data(kind, data)?)
            }
            MessageKind::ServerSideEmit => MessageBody::ServerSideEmit(decode_data(kind, data)?),
            MessageKind::ServerSideEmitResponse => {
                MessageBody::ServerSideEmitResponse(decode_data(kind, data)?)
            }
            MessageKind::BroadcastClientCount => {
                MessageBody::BroadcastClientCount(decode_data(kind, data)?)
            }
            MessageKind::BroadcastAck => MessageBody::BroadcastAck(decode_data(kind, data)?),
        };

        Ok(ClusterMessage {
            uid: parse_origin(&raw.uid)?,
            nsp: raw.nsp.clone(),
            body,
        })
    }

    /// Compact encoding of a whole message, used for pub/sub.
    pub fn encode_binary(&self, message: &ClusterMessage) -> Result<Vec<u8>> {
        Ok(bincode::serialize(message)?)
    }

    pub fn decode_binary(&self, payload: &[u8]) -> Result<ClusterMessage> {
        Ok(bincode::deserialize(payload)?)
    }
}

fn encode_data<T: Serialize>(payload: &T, binary: bool) -> Result<String> {
    if binary {
        Ok(BASE64.encode(bincode::serialize(payload)?))
    } else {
        Ok(serde_json::to_string(payload)?)
    }
}

fn decode_data<T: DeserializeOwned>(kind: MessageKind, data: Option<&str>) -> Result<T> {
    let data = data.unwrap_or_default();
    match detect_data_encoding(data) {
        DataEncoding::Json => Ok(serde_json::from_str(data)?),
        DataEncoding::Binary => Ok(bincode::deserialize(&BASE64.decode(data)?)?),
        DataEncoding::Empty => Err(CodecError::MissingData(kind)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlator::RequestId;
    use crate::local::SocketDetails;
    use crate::node_id::NodeId;
    use crate::protocol::message::{
        BroadcastPayload, ClientCountPayload, FetchSocketsResponsePayload,
    };
    use crate::protocol::{BroadcastOptions, Packet};
    use crate::value::Value;

    fn broadcast(packet: Packet) -> ClusterMessage {
        ClusterMessage::new(
            Some(NodeId::from(42)),
            "/chat",
            MessageBody::Broadcast(BroadcastPayload {
                packet,
                request_id: None,
                opts: BroadcastOptions::new().to("room1").except("room2"),
            }),
        )
    }

    #[test]
    fn test_detect_data_encoding() {
        assert_eq!(detect_data_encoding(r#"{"a":1}"#), DataEncoding::Json);
        assert_eq!(detect_data_encoding("AAEC"), DataEncoding::Binary);
        assert_eq!(detect_data_encoding(""), DataEncoding::Empty);
    }

    #[test]
    fn test_plain_json_payload() {
        let codec = Codec::default();
        let message = broadcast(Packet::event(
            "hello",
            [Value::from(serde_json::json!({"nested": [1, "two"]}))],
        ));

        let raw = codec.encode(&message).unwrap();
        assert_eq!(raw.uid, "000000000000002a");
        assert_eq!(raw.kind, "3");
        let data = raw.data.as_deref().unwrap();
        assert!(data.starts_with('{'));
        assert!(data.contains("\"rooms\":[\"room1\"]"));

        let decoded = codec.decode(&raw).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_nested_binary_payload() {
        let codec = Codec::default();
        let message = broadcast(Packet::event(
            "file",
            [Value::object([(
                "chunks",
                Value::Array(vec![Value::binary(vec![0u8, 159, 146, 150])]),
            )])],
        ));

        let raw = codec.encode(&message).unwrap();
        assert_eq!(
            detect_data_encoding(raw.data.as_deref().unwrap()),
            DataEncoding::Binary
        );
        assert_eq!(codec.decode(&raw).unwrap(), message);
    }

    #[test]
    fn test_only_plaintext_writes_json_for_binary() {
        let codec = Codec::new(true);
        let message = broadcast(Packet::event("file", [Value::binary(vec![1u8, 2, 3])]));

        let raw = codec.encode(&message).unwrap();
        let data = raw.data.as_deref().unwrap();
        assert!(data.contains("$binary"));
        assert_eq!(codec.decode(&raw).unwrap(), message);
    }

    #[test]
    fn test_fields_roundtrip() {
        let codec = Codec::default();
        let message = ClusterMessage::new(None, "/", MessageBody::Heartbeat);
        let raw = codec.encode(&message).unwrap();
        assert_eq!(raw.uid, "emitter");
        assert_eq!(raw.data, None);

        let fields = raw.to_fields();
        assert_eq!(fields.len(), 3);
        let back = RawMessage::from_fields(&fields).unwrap();
        assert_eq!(codec.decode(&back).unwrap(), message);
    }

    #[test]
    fn test_pubsub_roundtrip_with_response() {
        let codec = Codec::default();
        let message = ClusterMessage::new(
            Some(NodeId::from(7)),
            "/",
            MessageBody::FetchSocketsResponse(FetchSocketsResponsePayload {
                request_id: RequestId::generate(),
                sockets: vec![SocketDetails {
                    id: "s1".into(),
                    handshake: Value::object([("address", Value::from("::1"))]),
                    rooms: ["s1".to_string(), "lobby".to_string()].into_iter().collect(),
                    data: Value::binary(vec![9u8]),
                }],
            }),
        );

        let payload = codec.encode_binary(&message).unwrap();
        assert_eq!(codec.decode_binary(&payload).unwrap(), message);
    }

    #[test]
    fn test_malformed_messages() {
        let codec = Codec::default();
        let raw = |kind: &str, data: Option<&str>| RawMessage {
            uid: "emitter".into(),
            nsp: "/".into(),
            kind: kind.into(),
            data: data.map(str::to_string),
        };

        assert!(matches!(
            codec.decode(&raw("99", None)),
            Err(CodecError::UnknownKind(_))
        ));
        assert!(matches!(
            codec.decode(&raw("3", None)),
            Err(CodecError::MissingData(MessageKind::Broadcast))
        ));
        assert!(codec.decode(&raw("3", Some("{not json"))).is_err());
        assert!(codec.decode(&raw("3", Some("!!!"))).is_err());
        assert!(RawMessage::from_fields(&[("uid".into(), "x".into())]).is_err());

        let mut bad_uid = raw("2", None);
        bad_uid.uid = "nope".into();
        assert!(matches!(codec.decode(&bad_uid), Err(CodecError::InvalidUid(_))));
    }

    #[test]
    fn test_client_count_is_json() {
        let codec = Codec::default();
        let message = ClusterMessage::new(
            Some(NodeId::from(1)),
            "/",
            MessageBody::BroadcastClientCount(ClientCountPayload {
                request_id: RequestId::generate(),
                client_count: 3,
            }),
        );
        let raw = codec.encode(&message).unwrap();
        assert!(raw.data.as_deref().unwrap().contains("\"clientCount\":3"));
    }
}
