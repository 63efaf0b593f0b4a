use obd_protocol::TransportError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Driver task has stopped")]
    Stopped,
}
