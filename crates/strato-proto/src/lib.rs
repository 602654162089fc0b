//! Strato Protocol - Wire protocol and message definitions.
//!
//! This crate defines:
//! - Query, row and result types shared by both ends of the protocol
//! - Client-to-server and server-to-server message payloads
//! - Message framing (tag byte, subcommand byte for the server family)

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod messages;
pub mod query;

pub use messages::{CloudMessage, MessageKind, ServerCommand, ServerCommandKind};
pub use query::{CloudQuery, CloudQueryResult, CloudQueryRow, CloudQueryWithOrigins};
