//! Transport Adapters
//!
//! Two link kinds carry the ELM327 dialogue: a push-notification radio link
//! and a serial-style link. Both are wrapped in [`Transport`] so the driver
//! sees one `write` / `recv` surface regardless of which was chosen at
//! connect time.

mod notify;
mod serial;
mod sim;

pub use notify::{NotifyPeripheral, NotifyRadio, NotifyTransport};
pub use serial::{list_serial_ports, SerialIo, SerialSettings, SerialTransport};
pub use sim::{SimulatedRadio, SimulatorConfig, SIMULATOR_ADDRESS};

use crate::error::TransportError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Link kind, chosen once per session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Radio link delivering data by push notification
    Notify,
    /// Serial-style link read after a settle delay
    Serial,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Notify => write!(f, "notify"),
            TransportKind::Serial => write!(f, "serial"),
        }
    }
}

impl FromStr for TransportKind {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "notify" => Ok(TransportKind::Notify),
            "serial" => Ok(TransportKind::Serial),
            other => Err(TransportError::Unsupported(other.to_string())),
        }
    }
}

/// Address of a device on a given link kind
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceRef {
    pub kind: TransportKind,
    pub address: String,
}

impl DeviceRef {
    pub fn new(kind: TransportKind, address: impl Into<String>) -> Self {
        Self {
            kind,
            address: address.into(),
        }
    }
}

impl fmt::Display for DeviceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.address)
    }
}

/// A candidate device found by discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub device: DeviceRef,
    /// Human readable name, when the backend reports one
    pub name: Option<String>,
}

/// Something that happened on the link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Raw bytes in arrival order. Chunk boundaries carry no meaning.
    Data(Vec<u8>),
    /// The link went away
    Closed,
}

/// An open link to an adapter
pub enum Transport {
    Notify(NotifyTransport),
    Serial(SerialTransport),
}

impl Transport {
    pub fn kind(&self) -> TransportKind {
        match self {
            Transport::Notify(_) => TransportKind::Notify,
            Transport::Serial(_) => TransportKind::Serial,
        }
    }

    pub fn address(&self) -> &str {
        match self {
            Transport::Notify(t) => t.address(),
            Transport::Serial(t) => t.address(),
        }
    }

    /// Write raw bytes. Failure is reported to the caller, never retried.
    pub async fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        match self {
            Transport::Notify(t) => t.write(bytes).await,
            Transport::Serial(t) => t.write(bytes).await,
        }
    }

    /// Wait for the next link event.
    ///
    /// Cancel safe: dropping the future loses no data, so it can sit in a
    /// `select!` next to timers and commands.
    pub async fn recv(&mut self) -> LinkEvent {
        match self {
            Transport::Notify(t) => t.recv().await,
            Transport::Serial(t) => t.recv().await,
        }
    }

    /// Discard input that is already waiting, returning the byte count
    pub async fn drain(&mut self) -> usize {
        let drained = match self {
            Transport::Notify(t) => t.drain(),
            Transport::Serial(t) => t.drain().await,
        };
        if drained > 0 {
            debug!("Discarded {} stale bytes from {}", drained, self.address());
        }
        drained
    }

    /// Close the link. Errors are logged; the transport is gone either way.
    pub async fn disconnect(&mut self) {
        let result = match self {
            Transport::Notify(t) => t.disconnect().await,
            Transport::Serial(t) => t.disconnect().await,
        };
        if let Err(e) = result {
            warn!("Error while closing {}: {}", self.address(), e);
        }
    }
}

/// Opens transports for devices. The driver holds one of these for its
/// lifetime and calls it on every connect and reconnect.
#[async_trait]
pub trait Connector: Send + Sync {
    /// List candidate devices. Failures yield an empty list.
    async fn discover(&self, kind: TransportKind) -> Vec<DeviceInfo>;

    /// Open a link to the device
    async fn connect(&self, device: &DeviceRef) -> Result<Transport, TransportError>;
}

/// Connector backed by real serial ports and an optional radio backend
pub struct AdapterConnector {
    serial: SerialSettings,
    radio: Option<Arc<dyn NotifyRadio>>,
}

impl AdapterConnector {
    pub fn new(serial: SerialSettings) -> Self {
        Self {
            serial,
            radio: None,
        }
    }

    /// Attach the backend used for notify-style links
    pub fn with_radio(mut self, radio: Arc<dyn NotifyRadio>) -> Self {
        self.radio = Some(radio);
        self
    }

    fn radio(&self) -> Result<&Arc<dyn NotifyRadio>, TransportError> {
        self.radio
            .as_ref()
            .ok_or_else(|| TransportError::Unsupported(TransportKind::Notify.to_string()))
    }
}

#[async_trait]
impl Connector for AdapterConnector {
    async fn discover(&self, kind: TransportKind) -> Vec<DeviceInfo> {
        let result = match kind {
            TransportKind::Serial => list_serial_ports(),
            TransportKind::Notify => match self.radio() {
                Ok(radio) => radio.discover().await,
                Err(e) => Err(e),
            },
        };

        match result {
            Ok(devices) => {
                debug!("Discovered {} {} devices", devices.len(), kind);
                devices
            }
            Err(e) => {
                warn!("{} discovery failed: {}", kind, e);
                Vec::new()
            }
        }
    }

    async fn connect(&self, device: &DeviceRef) -> Result<Transport, TransportError> {
        info!("Opening {} link to {}", device.kind, device.address);
        match device.kind {
            TransportKind::Serial => {
                SerialTransport::open(&device.address, &self.serial).map(Transport::Serial)
            }
            TransportKind::Notify => self
                .radio()?
                .connect(&device.address)
                .await
                .map(Transport::Notify),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_round_trips_through_text() {
        for kind in [TransportKind::Notify, TransportKind::Serial] {
            assert_eq!(kind.to_string().parse::<TransportKind>().unwrap(), kind);
        }
        assert!("bluetooth".parse::<TransportKind>().is_err());
    }

    #[tokio::test]
    async fn test_notify_without_radio_is_unsupported() {
        let connector = AdapterConnector::new(SerialSettings::default());
        assert!(connector.discover(TransportKind::Notify).await.is_empty());

        let result = connector
            .connect(&DeviceRef::new(TransportKind::Notify, "AA:BB"))
            .await;
        assert!(matches!(result, Err(TransportError::Unsupported(_))));
    }

    #[tokio::test]
    async fn test_connector_uses_attached_radio() {
        let radio = Arc::new(SimulatedRadio::new(SimulatorConfig::default()));
        let connector = AdapterConnector::new(SerialSettings::default()).with_radio(radio.clone());

        let devices = connector.discover(TransportKind::Notify).await;
        assert_eq!(devices.len(), 1);

        let transport = connector.connect(&devices[0].device).await.unwrap();
        assert_eq!(transport.kind(), TransportKind::Notify);
        assert_eq!(radio.connect_count(), 1);
    }
}
