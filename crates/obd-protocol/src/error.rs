//! OBD-II Error Types

use thiserror::Error;

/// Errors raised by a transport adapter
#[derive(Debug, Error)]
pub enum TransportError {
    /// Could not open a link to the device
    #[error("Failed to connect to {address}: {reason}")]
    Connect { address: String, reason: String },

    /// Write to the adapter failed
    #[error("Write failed: {0}")]
    Write(String),

    /// Link is closed
    #[error("Transport link closed")]
    Closed,

    /// The requested transport kind has no backend on this device
    #[error("Transport kind {0} is not available")]
    Unsupported(String),

    /// Underlying I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serial port error
    #[error("Serial port error: {0}")]
    Serial(String),
}

impl From<tokio_serial::Error> for TransportError {
    fn from(err: tokio_serial::Error) -> Self {
        TransportError::Serial(err.to_string())
    }
}

/// Non-fatal errors while decoding an adapter response.
///
/// None of these abort a poll cycle: the affected parameter simply keeps
/// its previous value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Response does not start with the expected mode/PID prefix
    #[error("Response does not match expected prefix {expected}")]
    NoMatch { expected: String },

    /// Fewer payload bytes than the parameter declares
    #[error("Insufficient data: expected {expected} bytes, got {actual}")]
    InsufficientData { expected: usize, actual: usize },

    /// Payload is not a valid hex byte string
    #[error("Invalid hex payload: {0}")]
    InvalidHex(String),
}
