//! Cloud Synchronization Module
//!
//! Telemetry delivery to the remote collector:
//! - Batching of completed poll cycles
//! - HTTP upload with offline queue fallback
//! - Queue replay when connectivity returns

mod buffer;
mod collector;
mod config;
mod monitor;
mod payload;
mod uploader;

pub use buffer::TelemetryBuffer;
pub use collector::{Collector, HttpCollector};
pub use config::{NetworkConfig, UploadConfig};
pub use monitor::{ConnectivityProbe, ConnectivityReporter, NetworkMonitor, TcpProbe};
pub use payload::{TelemetryBatch, TelemetryItem};
pub use uploader::{ReplayReport, UploadOutcome, Uploader};

use thiserror::Error;

/// Upload error types
#[derive(Error, Debug)]
pub enum UploadError {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("Collector rejected upload with status {status}")]
    Rejected { status: u16 },

    #[error("Collector is unreachable")]
    Offline,

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("No vehicle bound")]
    NoVehicle,
}
