//! Broadcast targeting options.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

pub type Room = String;

/// Modifiers applied to a broadcast or a multi-node query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastFlags {
    /// Only act on this node.
    pub local: bool,
    /// The event may be dropped and is never stored for recovery.
    pub volatile: bool,
    /// Acknowledgement / query timeout in milliseconds.
    pub timeout: Option<u64>,
}

/// Which connections an operation targets.
///
/// Sets travel as JSON arrays on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastOptions {
    pub rooms: BTreeSet<Room>,
    pub except: BTreeSet<Room>,
    pub flags: BroadcastFlags,
}

impl BroadcastOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn to(mut self, room: impl Into<Room>) -> Self {
        self.rooms.insert(room.into());
        self
    }

    pub fn except(mut self, room: impl Into<Room>) -> Self {
        self.except.insert(room.into());
        self
    }

    pub fn local(mut self) -> Self {
        self.flags.local = true;
        self
    }

    pub fn volatile(mut self) -> Self {
        self.flags.volatile = true;
        self
    }

    pub fn timeout_ms(mut self, timeout: u64) -> Self {
        self.flags.timeout = Some(timeout);
        self
    }

    /// Whether a member of `rooms` is targeted: it is in one of the target
    /// rooms (or no room is targeted) and in none of the excluded rooms.
    pub fn selects<'a, I>(&self, rooms: I) -> bool
    where
        I: IntoIterator<Item = &'a Room>,
    {
        let mut included = self.rooms.is_empty();
        for room in rooms {
            if self.except.contains(room) {
                return false;
            }
            included |= self.rooms.contains(room);
        }
        included
    }
}
