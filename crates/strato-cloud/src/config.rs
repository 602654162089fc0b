//! Cloud node configuration.

use serde::{Deserialize, Serialize};
use strato_core::PeerAddress;

use crate::{DEFAULT_GET_REQUEST_TIMEOUT_MS, DEFAULT_GET_SWEEP_INTERVAL_MS};

/// Configuration for a cloud node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudConfig {
    /// Maximum bytes a single client may hold uploaded at once; 0 = unlimited.
    pub max_upload_bytes_per_client: u64,
    /// Maximum payload bytes in a single get response; 0 = unlimited.
    pub max_bytes_per_download: u64,
    /// Overrides the server address advertised in rows, when the node sits
    /// behind a NAT or proxy the transport cannot see through.
    pub force_external_address: Option<PeerAddress>,
    /// Lifetime of an aggregated get request in milliseconds.
    pub get_request_timeout_ms: u64,
    /// Interval between timeout sweeps in milliseconds.
    pub get_sweep_interval_ms: u64,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            max_upload_bytes_per_client: 0,
            max_bytes_per_download: 0,
            force_external_address: None,
            get_request_timeout_ms: DEFAULT_GET_REQUEST_TIMEOUT_MS,
            get_sweep_interval_ms: DEFAULT_GET_SWEEP_INTERVAL_MS,
        }
    }
}
