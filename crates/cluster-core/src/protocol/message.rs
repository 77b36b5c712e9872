//! Cluster messages: the twelve message kinds and their payloads.

use super::options::{BroadcastOptions, Room};
use super::packet::Packet;
use crate::correlator::RequestId;
use crate::local::SocketDetails;
use crate::node_id::NodeId;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Message kind with its wire ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    InitialHeartbeat = 1,
    Heartbeat = 2,
    Broadcast = 3,
    SocketsJoin = 4,
    SocketsLeave = 5,
    DisconnectSockets = 6,
    FetchSockets = 7,
    FetchSocketsResponse = 8,
    ServerSideEmit = 9,
    ServerSideEmitResponse = 10,
    BroadcastClientCount = 11,
    BroadcastAck = 12,
}

impl MessageKind {
    pub fn ordinal(self) -> u8 {
        self as u8
    }

    pub fn from_ordinal(ordinal: u8) -> Option<Self> {
        use MessageKind::*;
        Some(match ordinal {
            1 => InitialHeartbeat,
            2 => Heartbeat,
            3 => Broadcast,
            4 => SocketsJoin,
            5 => SocketsLeave,
            6 => DisconnectSockets,
            7 => FetchSockets,
            8 => FetchSocketsResponse,
            9 => ServerSideEmit,
            10 => ServerSideEmitResponse,
            11 => BroadcastClientCount,
            12 => BroadcastAck,
            _ => return None,
        })
    }

    /// Kinds whose payload may legitimately contain binary data.
    pub fn may_carry_binary(self) -> bool {
        matches!(
            self,
            MessageKind::Broadcast
                | MessageKind::FetchSocketsResponse
                | MessageKind::ServerSideEmit
                | MessageKind::ServerSideEmitResponse
                | MessageKind::BroadcastAck
        )
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastPayload {
    pub packet: Packet,
    /// Present when the sender collects client acknowledgements.
    #[serde(default)]
    pub request_id: Option<RequestId>,
    pub opts: BroadcastOptions,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomsPayload {
    pub opts: BroadcastOptions,
    pub rooms: Vec<Room>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisconnectPayload {
    pub opts: BroadcastOptions,
    pub close: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchSocketsPayload {
    pub opts: BroadcastOptions,
    pub request_id: RequestId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchSocketsResponsePayload {
    pub request_id: RequestId,
    pub sockets: Vec<SocketDetails>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerSideEmitPayload {
    /// Present when the sender waits for one reply per node.
    #[serde(default)]
    pub request_id: Option<RequestId>,
    pub packet: Vec<Value>,
}

/// Shared by `ServerSideEmitResponse` and `BroadcastAck`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckPayload {
    pub request_id: RequestId,
    pub packet: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientCountPayload {
    pub request_id: RequestId,
    pub client_count: u64,
}

/// Kind-specific content of a [`ClusterMessage`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MessageBody {
    InitialHeartbeat,
    Heartbeat,
    Broadcast(BroadcastPayload),
    SocketsJoin(RoomsPayload),
    SocketsLeave(RoomsPayload),
    DisconnectSockets(DisconnectPayload),
    FetchSockets(FetchSocketsPayload),
    FetchSocketsResponse(FetchSocketsResponsePayload),
    ServerSideEmit(ServerSideEmitPayload),
    ServerSideEmitResponse(AckPayload),
    BroadcastClientCount(ClientCountPayload),
    BroadcastAck(AckPayload),
}

/// How a message travels between nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Appended to the ordered, durable log.
    Log,
    /// Published on the channel's shared topic.
    PubSub,
    /// Published on the requesting node's private topic.
    Response,
}

impl MessageBody {
    pub fn kind(&self) -> MessageKind {
        match self {
            MessageBody::InitialHeartbeat => MessageKind::InitialHeartbeat,
            MessageBody::Heartbeat => MessageKind::Heartbeat,
            MessageBody::Broadcast(_) => MessageKind::Broadcast,
            MessageBody::SocketsJoin(_) => MessageKind::SocketsJoin,
            MessageBody::SocketsLeave(_) => MessageKind::SocketsLeave,
            MessageBody::DisconnectSockets(_) => MessageKind::DisconnectSockets,
            MessageBody::FetchSockets(_) => MessageKind::FetchSockets,
            MessageBody::FetchSocketsResponse(_) => MessageKind::FetchSocketsResponse,
            MessageBody::ServerSideEmit(_) => MessageKind::ServerSideEmit,
            MessageBody::ServerSideEmitResponse(_) => MessageKind::ServerSideEmitResponse,
            MessageBody::BroadcastClientCount(_) => MessageKind::BroadcastClientCount,
            MessageBody::BroadcastAck(_) => MessageKind::BroadcastAck,
        }
    }

    pub fn has_binary(&self) -> bool {
        match self {
            MessageBody::Broadcast(p) => p.packet.has_binary(),
            MessageBody::FetchSocketsResponse(p) => p
                .sockets
                .iter()
                .any(|s| s.handshake.has_binary() || s.data.has_binary()),
            MessageBody::ServerSideEmit(p) => p.packet.iter().any(Value::has_binary),
            MessageBody::ServerSideEmitResponse(p) | MessageBody::BroadcastAck(p) => {
                p.packet.has_binary()
            }
            _ => false,
        }
    }
}

/// A message exchanged between the nodes of one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterMessage {
    /// Originating node; `None` for messages published by an emitter.
    pub uid: Option<NodeId>,
    /// Channel (namespace) name.
    pub nsp: String,
    pub body: MessageBody,
}

impl ClusterMessage {
    pub fn new(uid: Option<NodeId>, nsp: impl Into<String>, body: MessageBody) -> Self {
        Self {
            uid,
            nsp: nsp.into(),
            body,
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.body.kind()
    }

    pub fn has_binary(&self) -> bool {
        self.body.has_binary()
    }

    /// Durable vs ephemeral classification.
    ///
    /// Queries and acknowledged broadcasts are only meaningful to nodes that
    /// are up right now, so they skip the log. Replies go straight back to the
    /// requester. Everything else is appended to the log so that it is
    /// ordered per channel and can be replayed for recovery.
    pub fn delivery(&self) -> Delivery {
        match &self.body {
            MessageBody::Broadcast(p) if p.request_id.is_some() => Delivery::PubSub,
            MessageBody::FetchSockets(_) | MessageBody::ServerSideEmit(_) => Delivery::PubSub,
            MessageBody::FetchSocketsResponse(_)
            | MessageBody::ServerSideEmitResponse(_)
            | MessageBody::BroadcastClientCount(_)
            | MessageBody::BroadcastAck(_) => Delivery::Response,
            _ => Delivery::Log,
        }
    }
}
