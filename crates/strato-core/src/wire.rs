//! Wire encoding for the mesh protocol.
//!
//! All multi-byte integers are big-endian on the wire. Counts are written
//! with the width the owning message declares (u16 for key lists, u32 for
//! row lists and payload lengths), so list framing lives in the message
//! codecs rather than in a blanket sequence impl.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Errors during wire decoding.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Not enough bytes to decode
    #[error("insufficient bytes: expected {expected}, got {available}")]
    InsufficientBytes {
        /// Expected number of bytes
        expected: usize,
        /// Actually available bytes
        available: usize,
    },

    /// Invalid message or subcommand tag
    #[error("invalid tag: {0}")]
    InvalidTag(u32),

    /// Invalid address family byte
    #[error("invalid address family: {0}")]
    InvalidAddressFamily(u8),

    /// Declared length exceeds what remains in the packet
    #[error("declared length {declared} exceeds remaining {remaining}")]
    LengthOverrun {
        /// Length prefix read from the wire
        declared: usize,
        /// Bytes actually remaining
        remaining: usize,
    },
}

/// Trait for types that encode to the wire representation.
pub trait WireEncode {
    /// Appends the wire representation to `buf`.
    fn encode(&self, buf: &mut BytesMut);

    /// Returns the wire representation as frozen bytes.
    fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Returns the wire representation as a Vec.
    fn to_vec(&self) -> Vec<u8> {
        self.to_bytes().as_ref().to_vec()
    }
}

/// Trait for types that decode from the wire representation.
pub trait WireDecode: Sized {
    /// Decodes from the front of `buf`, advancing it.
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError>;

    /// Decodes from a byte slice.
    fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut buf = Bytes::copy_from_slice(bytes);
        Self::decode(&mut buf)
    }
}

fn need(buf: &Bytes, expected: usize) -> Result<(), DecodeError> {
    if buf.remaining() < expected {
        return Err(DecodeError::InsufficientBytes {
            expected,
            available: buf.remaining(),
        });
    }
    Ok(())
}

impl WireEncode for u8 {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(*self);
    }
}

impl WireDecode for u8 {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        need(buf, 1)?;
        Ok(buf.get_u8())
    }
}

impl WireEncode for u16 {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16(*self);
    }
}

impl WireDecode for u16 {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        need(buf, 2)?;
        Ok(buf.get_u16())
    }
}

impl WireEncode for u32 {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(*self);
    }
}

impl WireDecode for u32 {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        need(buf, 4)?;
        Ok(buf.get_u32())
    }
}

impl WireEncode for u64 {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64(*self);
    }
}

impl WireDecode for u64 {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        need(buf, 8)?;
        Ok(buf.get_u64())
    }
}

impl WireEncode for bool {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(*self as u8);
    }
}

impl WireDecode for bool {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        need(buf, 1)?;
        Ok(buf.get_u8() != 0)
    }
}

impl<const N: usize> WireEncode for [u8; N] {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_slice(self);
    }
}

impl<const N: usize> WireDecode for [u8; N] {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        need(buf, N)?;
        let mut arr = [0u8; N];
        buf.copy_to_slice(&mut arr);
        Ok(arr)
    }
}

// Opaque payloads: u32 length prefix followed by the raw bytes.
impl WireEncode for Bytes {
    fn encode(&self, buf: &mut BytesMut) {
        debug_assert!(self.len() <= u32::MAX as usize);
        buf.put_u32(self.len() as u32);
        buf.put_slice(self);
    }
}

impl WireDecode for Bytes {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        let len = u32::decode(buf)? as usize;
        if buf.remaining() < len {
            return Err(DecodeError::LengthOverrun {
                declared: len,
                remaining: buf.remaining(),
            });
        }
        Ok(buf.copy_to_bytes(len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integers_are_big_endian() {
        let value: u32 = 0x12345678;
        assert_eq!(value.to_vec(), vec![0x12, 0x34, 0x56, 0x78]);

        let value: u16 = 0xBEEF;
        assert_eq!(value.to_vec(), vec![0xBE, 0xEF]);
    }

    #[test]
    fn roundtrip_primitives() {
        let val: u64 = 0x0102030405060708;
        assert_eq!(u64::from_bytes(&val.to_vec()).unwrap(), val);

        assert!(bool::from_bytes(&[1]).unwrap());
        assert!(!bool::from_bytes(&[0]).unwrap());
    }

    #[test]
    fn payload_roundtrip() {
        let payload = Bytes::from_static(b"hello");
        let encoded = payload.to_vec();
        assert_eq!(&encoded[..4], &[0, 0, 0, 5]);
        assert_eq!(Bytes::from_bytes(&encoded).unwrap(), payload);
    }

    #[test]
    fn payload_length_overrun() {
        // Declares 10 bytes, supplies 2.
        let err = Bytes::from_bytes(&[0, 0, 0, 10, 0xAA, 0xBB]).unwrap_err();
        assert!(matches!(err, DecodeError::LengthOverrun { declared: 10, .. }));
    }

    #[test]
    fn truncated_integer() {
        let err = u32::from_bytes(&[0x01, 0x02]).unwrap_err();
        assert_eq!(
            err,
            DecodeError::InsufficientBytes {
                expected: 4,
                available: 2
            }
        );
    }
}
