//! NodeId: Unique identifier for a server process in the cluster.
//!
//! Wraps a random u64 but displays (and travels on the wire) as a
//! 16-character hex string.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

/// Wire uid used by processes that publish into the cluster without being
/// members of it (emitters). Messages carrying it never refresh membership.
pub const EMITTER_UID: &str = "emitter";

#[derive(Debug, Error)]
pub enum NodeIdError {
    #[error("Invalid node ID format: expected 16 hex chars")]
    InvalidFormat,
    #[error("Invalid hex: {0}")]
    InvalidHex(#[from] std::num::ParseIntError),
}

/// A unique identifier for a node in the cluster.
///
/// # Examples
/// ```
/// use cluster_core::NodeId;
///
/// let node_id = NodeId::generate();
/// let parsed: NodeId = node_id.to_string().parse().unwrap();
/// assert_eq!(node_id, parsed);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl NodeId {
    /// Generate a new random node ID. Never returns zero.
    pub fn generate() -> Self {
        use rand::Rng;
        loop {
            let id: u64 = rand::rng().random();
            if id != 0 {
                return Self(id);
            }
        }
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for NodeId {
    type Err = NodeIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() == 16 && s.chars().all(|c| c.is_ascii_hexdigit()) {
            let id = u64::from_str_radix(&s.to_ascii_lowercase(), 16)?;
            return Ok(Self(id));
        }
        Err(NodeIdError::InvalidFormat)
    }
}

impl From<u64> for NodeId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

// Serialize as hex string so logs, JSON payloads and topic names agree
impl serde::Serialize for NodeId {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for NodeId {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Parse the `uid` field of a wire message.
///
/// Returns `Ok(None)` for messages published by an emitter (or with an empty
/// uid), which are processed but are not attributed to any node.
pub fn parse_origin(uid: &str) -> Result<Option<NodeId>, NodeIdError> {
    if uid.is_empty() || uid == EMITTER_UID {
        return Ok(None);
    }
    uid.parse().map(Some)
}

/// Inverse of [`parse_origin`].
pub fn format_origin(origin: Option<NodeId>) -> String {
    match origin {
        Some(id) => id.to_string(),
        None => EMITTER_UID.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_zero_padded() {
        let node_id = NodeId(0xff);
        assert_eq!(node_id.to_string(), "00000000000000ff");
    }

    #[test]
    fn test_parse_uppercase_hex() {
        let node_id: NodeId = "A1B2C3D4E5F67890".parse().unwrap();
        assert_eq!(node_id.as_u64(), 0xa1b2c3d4e5f67890);
    }

    #[test]
    fn test_roundtrip() {
        let original = NodeId::generate();
        let parsed: NodeId = original.to_string().parse().unwrap();
        assert_eq!(original, parsed);
    }

    #[test]
    fn test_reject_invalid() {
        assert!("".parse::<NodeId>().is_err());
        assert!("a1b2c3d4e5f6789".parse::<NodeId>().is_err()); // 15 chars
        assert!("ghijklmnopqrstuv".parse::<NodeId>().is_err()); // non-hex
    }

    #[test]
    fn test_generate_not_zero() {
        for _ in 0..1000 {
            assert_ne!(NodeId::generate().as_u64(), 0);
        }
    }

    #[test]
    fn test_emitter_origin() {
        assert!(parse_origin("emitter").unwrap().is_none());
        assert!(parse_origin("").unwrap().is_none());
        assert_eq!(format_origin(None), "emitter");

        let id = NodeId::generate();
        assert_eq!(parse_origin(&format_origin(Some(id))).unwrap(), Some(id));
        assert!(parse_origin("not-a-node").is_err());
    }

    #[test]
    fn test_serde_roundtrip() {
        let original = NodeId::generate();
        let json = serde_json::to_string(&original).unwrap();
        assert_eq!(json, format!("\"{}\"", original));
        let parsed: NodeId = serde_json::from_str(&json).unwrap();
        assert_eq!(original, parsed);
    }
}
