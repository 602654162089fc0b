//! Strato Tests - multi-node test harness for the cloud mesh.
//!
//! Provides [`TestMesh`], an in-memory mesh of cloud nodes with envelope
//! routing, simulated clients, link failures and a synthetic clock, so
//! integration tests can drive multi-peer scenarios deterministically.

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod harness;

pub use harness::TestMesh;
