//! Strato Cloud - federated pub/sub key-value store.
//!
//! Each node holds a local repository of payloads published under
//! `CloudKey`s, tracks per-client uploads and subscriptions, and federates
//! with peer servers: uploaded- and subscribed-key sets are exchanged on
//! handshake and maintained incrementally, reads fan out to peers that
//! advertise matching keys, and changes are pushed to local and remote
//! subscribers.
//!
//! The core is a single-threaded cooperative state machine: the caller
//! feeds inbound packets into [`CloudNode::handle_packet`], invokes
//! [`CloudNode::tick`] on its own cadence, and drains the outbox of
//! envelopes toward the transport.

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod aggregator;
pub mod clients;
pub mod config;
pub mod filter;
pub mod node;
pub mod repository;
pub mod servers;

pub use aggregator::{GetAggregator, GetRequest, PeerResponse};
pub use clients::{ClientRegistry, KeySubscription, RemoteCloudClient};
pub use config::CloudConfig;
pub use filter::{FilterChain, QueryFilter};
pub use node::{CloudNode, CloudStats, Envelope};
pub use repository::{CloudData, CloudDataList, DataRepository};
pub use servers::{PeerSyncState, RemoteServer, ServerRegistry};

/// Default lifetime of an aggregated get request in milliseconds.
///
/// Requests older than this complete with whatever rows have arrived.
pub const DEFAULT_GET_REQUEST_TIMEOUT_MS: u64 = 3000;

/// Default interval between timeout sweeps in milliseconds.
pub const DEFAULT_GET_SWEEP_INTERVAL_MS: u64 = 1000;
