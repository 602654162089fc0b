//! Strato Core - Core types and primitives for the strato cloud mesh.
//!
//! This crate provides:
//! - Identifier types (PeerGuid, PeerAddress)
//! - The composite CloudKey under which payloads are published
//! - Timestamps in epoch milliseconds
//! - Wire encoding for the mesh protocol

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod identifiers;
pub mod key;
pub mod time;
pub mod wire;

pub use identifiers::*;
pub use key::CloudKey;
pub use time::Timestamp;
pub use wire::{DecodeError, WireDecode, WireEncode};

/// Protocol major version.
pub const PROTOCOL_VERSION_MAJOR: u32 = 1;
/// Protocol minor version.
pub const PROTOCOL_VERSION_MINOR: u32 = 0;
