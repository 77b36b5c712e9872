//! LogCursor: position of an entry in a partition of the ordered log.
//!
//! Cursors look like `<millis>-<seq>` on the wire and compare numerically,
//! first by timestamp, then by sequence number.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CursorError {
    #[error("Invalid cursor format: {0:?}")]
    InvalidFormat(String),
}

/// Position of an entry within one log partition.
///
/// # Examples
/// ```
/// use cluster_core::LogCursor;
///
/// let cursor: LogCursor = "1700000000000-3".parse().unwrap();
/// assert_eq!(cursor.next().to_string(), "1700000000000-4");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct LogCursor {
    pub millis: u64,
    pub seq: u64,
}

impl LogCursor {
    /// Position before every entry.
    pub const ZERO: LogCursor = LogCursor { millis: 0, seq: 0 };

    pub fn new(millis: u64, seq: u64) -> Self {
        Self { millis, seq }
    }

    /// The smallest cursor strictly greater than this one.
    pub fn next(&self) -> Self {
        match self.seq.checked_add(1) {
            Some(seq) => Self::new(self.millis, seq),
            None => Self::new(self.millis.saturating_add(1), 0),
        }
    }

    /// Whether `s` has the shape `^[0-9]+-[0-9]+$`.
    pub fn is_well_formed(s: &str) -> bool {
        match s.split_once('-') {
            Some((millis, seq)) => is_digits(millis) && is_digits(seq),
            None => false,
        }
    }
}

fn is_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

impl Display for LogCursor {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.millis, self.seq)
    }
}

impl FromStr for LogCursor {
    type Err = CursorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || CursorError::InvalidFormat(s.to_string());
        if !Self::is_well_formed(s) {
            return Err(invalid());
        }
        let (millis, seq) = s.split_once('-').ok_or_else(invalid)?;
        Ok(Self {
            millis: millis.parse().map_err(|_| invalid())?,
            seq: seq.parse().map_err(|_| invalid())?,
        })
    }
}

impl serde::Serialize for LogCursor {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for LogCursor {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
