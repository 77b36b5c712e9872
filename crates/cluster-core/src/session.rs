//! Session records for connection state recovery.
//!
//! When a client disconnects, its subscription state is persisted under a
//! private id. On reconnection the record is consumed and returned together
//! with the packets broadcast in the meantime that the client would have
//! received.

use crate::protocol::{BroadcastOptions, Room};
use crate::value::Value;
use serde::{Deserialize, Serialize};

/// State of a disconnected client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedSession {
    /// Public session id.
    pub sid: String,
    /// Private id the client presents to claim the session.
    pub pid: String,
    pub rooms: Vec<Room>,
    pub data: Value,
}

/// A claimed session and the event payloads it missed, in log order.
///
/// Each missed payload is the packet's data array with the log cursor of its
/// entry appended.
#[derive(Debug, Clone, PartialEq)]
pub struct RestoredSession {
    pub sid: String,
    pub pid: String,
    pub rooms: Vec<Room>,
    pub data: Value,
    pub missed_packets: Vec<Vec<Value>>,
}

impl RestoredSession {
    pub fn new(session: PersistedSession) -> Self {
        Self {
            sid: session.sid,
            pid: session.pid,
            rooms: session.rooms,
            data: session.data,
            missed_packets: Vec::new(),
        }
    }
}

/// Whether a client in `session_rooms` would have received a broadcast sent
/// with `opts`.
pub fn should_include_packet(session_rooms: &[Room], opts: &BroadcastOptions) -> bool {
    opts.selects(session_rooms)
}
