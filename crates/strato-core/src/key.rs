//! The composite key under which cloud payloads are published.

use std::fmt;

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::wire::{DecodeError, WireDecode, WireEncode};

/// Composite `(primary, secondary)` key.
///
/// The primary key typically names an application-level table or topic and
/// the secondary key an instance within it. Ordering is lexicographic on
/// the pair; equality is bitwise. 8 bytes on the wire.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct CloudKey {
    /// Application-level table or topic.
    pub primary: u32,
    /// Instance within the primary key.
    pub secondary: u32,
}

impl CloudKey {
    /// Creates a key from its two components.
    pub const fn new(primary: u32, secondary: u32) -> Self {
        Self { primary, secondary }
    }
}

impl fmt::Debug for CloudKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CloudKey({}, {})", self.primary, self.secondary)
    }
}

impl fmt::Display for CloudKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.primary, self.secondary)
    }
}

impl From<(u32, u32)> for CloudKey {
    fn from((primary, secondary): (u32, u32)) -> Self {
        Self { primary, secondary }
    }
}

impl WireEncode for CloudKey {
    fn encode(&self, buf: &mut BytesMut) {
        self.primary.encode(buf);
        self.secondary.encode(buf);
    }
}

impl WireDecode for CloudKey {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        Ok(Self {
            primary: u32::decode(buf)?,
            secondary: u32::decode(buf)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_roundtrip() {
        let key = CloudKey::new(7, 42);
        let encoded = key.to_vec();
        assert_eq!(encoded.len(), 8);
        assert_eq!(CloudKey::from_bytes(&encoded).unwrap(), key);
    }

    #[test]
    fn ordering_is_lexicographic() {
        assert!(CloudKey::new(1, 9) < CloudKey::new(2, 0));
        assert!(CloudKey::new(3, 1) < CloudKey::new(3, 2));
        assert_eq!(CloudKey::new(5, 5), CloudKey::new(5, 5));
    }
}
