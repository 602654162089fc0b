//! Identifier types for peers on the mesh.
//!
//! A `PeerGuid` is the stable 64-bit identity of a process (client or
//! server) on the mesh; a `PeerAddress` is its transport coordinate. Both
//! are held by value throughout the cloud subsystem and used as map keys.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::wire::{DecodeError, WireDecode, WireEncode};

/// Stable 64-bit peer identifier.
///
/// Assigned once per process by the transport layer and never reused while
/// the process lives.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct PeerGuid(pub u64);

impl PeerGuid {
    /// The sentinel for "no peer".
    pub const UNASSIGNED: PeerGuid = PeerGuid(0);

    /// Creates a guid from a raw value.
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw value.
    pub const fn value(&self) -> u64 {
        self.0
    }

    /// Generates a random guid.
    pub fn random() -> Self {
        use rand::RngCore;
        Self(rand::thread_rng().next_u64())
    }

    /// Returns true if this is the unassigned sentinel.
    pub const fn is_unassigned(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for PeerGuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerGuid({:016x})", self.0)
    }
}

impl fmt::Display for PeerGuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl From<u64> for PeerGuid {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl WireEncode for PeerGuid {
    fn encode(&self, buf: &mut BytesMut) {
        self.0.encode(buf);
    }
}

impl WireDecode for PeerGuid {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        Ok(Self(u64::decode(buf)?))
    }
}

/// Transport coordinate of a peer.
///
/// The wire encoding is a family byte (4 or 6), the address octets, and a
/// big-endian port. `UNASSIGNED` (`0.0.0.0:0`) marks coordinates that are
/// not yet known, e.g. on subscription placeholders.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerAddress(pub SocketAddr);

impl PeerAddress {
    /// The sentinel for "no address".
    pub const UNASSIGNED: PeerAddress = PeerAddress(SocketAddr::new(
        IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        0,
    ));

    /// Creates an address from a socket address.
    pub const fn new(addr: SocketAddr) -> Self {
        Self(addr)
    }

    /// Returns the socket address.
    pub const fn socket_addr(&self) -> SocketAddr {
        self.0
    }

    /// Returns true if this is the unassigned sentinel.
    pub fn is_unassigned(&self) -> bool {
        *self == Self::UNASSIGNED
    }
}

impl Default for PeerAddress {
    fn default() -> Self {
        Self::UNASSIGNED
    }
}

impl fmt::Debug for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerAddress({})", self.0)
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<SocketAddr> for PeerAddress {
    fn from(addr: SocketAddr) -> Self {
        Self(addr)
    }
}

impl WireEncode for PeerAddress {
    fn encode(&self, buf: &mut BytesMut) {
        match self.0 {
            SocketAddr::V4(v4) => {
                buf.put_u8(4);
                buf.put_slice(&v4.ip().octets());
                buf.put_u16(v4.port());
            }
            SocketAddr::V6(v6) => {
                buf.put_u8(6);
                buf.put_slice(&v6.ip().octets());
                buf.put_u16(v6.port());
            }
        }
    }
}

impl WireDecode for PeerAddress {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        let family = u8::decode(buf)?;
        match family {
            4 => {
                let octets = <[u8; 4]>::decode(buf)?;
                let port = u16::decode(buf)?;
                Ok(Self(SocketAddr::new(
                    IpAddr::V4(Ipv4Addr::from(octets)),
                    port,
                )))
            }
            6 => {
                let octets = <[u8; 16]>::decode(buf)?;
                let port = u16::decode(buf)?;
                Ok(Self(SocketAddr::new(
                    IpAddr::V6(Ipv6Addr::from(octets)),
                    port,
                )))
            }
            other => Err(DecodeError::InvalidAddressFamily(other)),
        }
    }
}
