//! Wire protocol shared by every node of the cluster.
//!
//! - Message kinds and typed payloads ([`message`])
//! - Broadcast targeting options ([`options`])
//! - Connection-framework packets ([`packet`])
//! - Flat-field log encoding and compact pub/sub encoding ([`codec`])

pub mod codec;
pub mod message;
pub mod options;
pub mod packet;

pub use codec::{Codec, CodecError, DataEncoding, RawMessage, detect_data_encoding};
pub use message::{
    AckPayload, BroadcastPayload, ClientCountPayload, ClusterMessage, Delivery,
    DisconnectPayload, FetchSocketsPayload, FetchSocketsResponsePayload, MessageBody,
    MessageKind, RoomsPayload, ServerSideEmitPayload,
};
pub use options::{BroadcastFlags, BroadcastOptions, Room};
pub use packet::{Packet, PacketType};
