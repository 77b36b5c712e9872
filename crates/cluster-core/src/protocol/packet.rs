//! Connection-framework packets carried by broadcasts.

use super::options::BroadcastOptions;
use crate::cursor::LogCursor;
use crate::value::Value;
use serde::{Deserialize, Serialize};

/// Packet type ordinals of the connection framework.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
#[repr(u8)]
pub enum PacketType {
    Connect = 0,
    Disconnect = 1,
    Event = 2,
    Ack = 3,
    ConnectError = 4,
    BinaryEvent = 5,
    BinaryAck = 6,
}

impl From<PacketType> for u8 {
    fn from(kind: PacketType) -> Self {
        kind as u8
    }
}

impl TryFrom<u8> for PacketType {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => PacketType::Connect,
            1 => PacketType::Disconnect,
            2 => PacketType::Event,
            3 => PacketType::Ack,
            4 => PacketType::ConnectError,
            5 => PacketType::BinaryEvent,
            6 => PacketType::BinaryAck,
            other => return Err(format!("unknown packet type {other}")),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    #[serde(rename = "type")]
    pub kind: PacketType,
    #[serde(default)]
    pub data: Vec<Value>,
    /// Acknowledgement id; present when the sender expects a reply.
    #[serde(default)]
    pub id: Option<u64>,
}

impl Packet {
    /// A plain event: `[name, ...args]`.
    pub fn event(name: &str, args: impl IntoIterator<Item = Value>) -> Self {
        let mut data = vec![Value::from(name)];
        data.extend(args);
        Self {
            kind: PacketType::Event,
            data,
            id: None,
        }
    }

    pub fn with_ack_id(mut self, id: u64) -> Self {
        self.id = Some(id);
        self
    }

    /// Event name, when the first data element is a string.
    pub fn event_name(&self) -> Option<&str> {
        self.data.first().and_then(Value::as_str)
    }

    /// Whether a reconnecting client could be handed this packet again: a
    /// plain event without acknowledgement that was not sent as volatile.
    pub fn is_recoverable(&self, opts: &BroadcastOptions) -> bool {
        self.kind == PacketType::Event && self.id.is_none() && !opts.flags.volatile
    }

    /// Append the log position so the client can resume from it.
    pub fn push_cursor(&mut self, cursor: LogCursor) {
        self.data.push(Value::String(cursor.to_string()));
    }

    pub fn has_binary(&self) -> bool {
        self.data.iter().any(Value::has_binary)
    }
}
