//! Upload and Connectivity Configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Telemetry upload configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Collector base URL, without trailing slash
    pub base_url: String,
    /// Bearer token sent with every upload
    pub auth_token: Option<String>,
    /// Samples per upload
    pub batch_size: usize,
    /// Buffer is cleared when it would grow past this
    pub buffer_ceiling: usize,
    /// Per-request timeout
    pub request_timeout_ms: u64,
    /// Driver-to-uploader channel capacity
    pub channel_capacity: usize,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/api".to_string(),
            auth_token: None,
            batch_size: 180,
            buffer_ceiling: 1000,
            request_timeout_ms: 10_000,
            channel_capacity: 256,
        }
    }
}

impl UploadConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Connectivity monitoring configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Assumed state until the first report or probe
    pub initially_online: bool,
    /// Probe the collector periodically instead of relying on reports alone
    pub probe_enabled: bool,
    /// `host:port` to probe. Derived from the collector URL when unset.
    pub probe_address: Option<String>,
    pub probe_interval_ms: u64,
    pub probe_timeout_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            initially_online: true,
            probe_enabled: false,
            probe_address: None,
            probe_interval_ms: 15_000,
            probe_timeout_ms: 3_000,
        }
    }
}

impl NetworkConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms.max(1))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}
