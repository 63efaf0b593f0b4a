//! OBD-II Protocol Implementation
//!
//! This crate speaks the ELM327 ASCII dialogue: it knows the parameters the
//! driver polls, decodes their hex replies into physical values, and opens
//! the notify-style and serial-style links the adapter is reached over.

pub mod codec;
mod error;
mod pid;
mod protocol;
mod snapshot;
pub mod transport;

pub use error::{ProtocolError, TransportError};
pub use pid::{lookup, FrameKind, Parameter, ParameterDefinition, PidValue};
pub use protocol::{init_sequence, ObdProtocol};
pub use snapshot::{TelemetryEvent, TelemetrySample, VehicleSnapshot};
pub use transport::{
    AdapterConnector, Connector, DeviceInfo, DeviceRef, LinkEvent, Transport, TransportKind,
};

/// OBD-II mode constants
pub mod mode {
    /// Current data
    pub const CURRENT_DATA: u8 = 0x01;
    /// Vehicle information
    pub const VEHICLE_INFO: u8 = 0x09;
}
