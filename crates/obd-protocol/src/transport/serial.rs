//! Serial-style link (RFCOMM or USB serial)
//!
//! Request/reply: every write arms a settle delay, and the following read
//! only starts once the adapter has had time to answer.

use super::{DeviceInfo, DeviceRef, LinkEvent, TransportKind};
use crate::error::TransportError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{sleep_until, timeout, Instant};
use tokio_serial::{SerialPortBuilderExt, SerialPortType};
use tracing::{debug, warn};

/// Quiet period that ends a drain
const DRAIN_WINDOW: Duration = Duration::from_millis(20);

const READ_CHUNK: usize = 256;

/// Serial link configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialSettings {
    /// Baud rate (ELM327 clones default to 38400)
    pub baud_rate: u32,
    /// Wait after each write before reading the reply
    pub settle_delay_ms: u64,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            baud_rate: 38400,
            settle_delay_ms: 500,
        }
    }
}

/// Byte stream a serial transport runs over
pub trait SerialIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialIo for T {}

/// Open serial-style link
pub struct SerialTransport {
    address: String,
    io: Box<dyn SerialIo>,
    settle_delay: Duration,
    settle_until: Option<Instant>,
}

impl SerialTransport {
    /// Open a serial port
    pub fn open(address: &str, settings: &SerialSettings) -> Result<Self, TransportError> {
        let stream = tokio_serial::new(address, settings.baud_rate)
            .open_native_async()
            .map_err(|e| TransportError::Connect {
                address: address.to_string(),
                reason: e.to_string(),
            })?;

        Ok(Self::from_io(
            address,
            stream,
            Duration::from_millis(settings.settle_delay_ms),
        ))
    }

    /// Wrap an already open byte stream
    pub fn from_io(address: impl Into<String>, io: impl SerialIo + 'static, settle_delay: Duration) -> Self {
        Self {
            address: address.into(),
            io: Box::new(io),
            settle_delay,
            settle_until: None,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub async fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.io
            .write_all(bytes)
            .await
            .map_err(|e| TransportError::Write(e.to_string()))?;
        self.io
            .flush()
            .await
            .map_err(|e| TransportError::Write(e.to_string()))?;
        self.settle_until = Some(Instant::now() + self.settle_delay);
        Ok(())
    }

    /// Settle, then read whatever the port has buffered
    pub async fn recv(&mut self) -> LinkEvent {
        if let Some(deadline) = self.settle_until {
            sleep_until(deadline).await;
            self.settle_until = None;
        }

        let mut buf = [0u8; READ_CHUNK];
        match self.io.read(&mut buf).await {
            Ok(0) => LinkEvent::Closed,
            Ok(n) => LinkEvent::Data(buf[..n].to_vec()),
            Err(e) => {
                warn!("Serial read on {} failed: {}", self.address, e);
                LinkEvent::Closed
            }
        }
    }

    /// Read and discard until the port stays quiet
    pub async fn drain(&mut self) -> usize {
        let mut buf = [0u8; READ_CHUNK];
        let mut drained = 0;
        while let Ok(Ok(n)) = timeout(DRAIN_WINDOW, self.io.read(&mut buf)).await {
            if n == 0 {
                break;
            }
            drained += n;
        }
        drained
    }

    pub async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.settle_until = None;
        self.io.shutdown().await?;
        Ok(())
    }
}

/// Enumerate serial ports (including bonded RFCOMM devices)
pub fn list_serial_ports() -> Result<Vec<DeviceInfo>, TransportError> {
    let ports = tokio_serial::available_ports()?;
    debug!("Found {} serial ports", ports.len());

    Ok(ports
        .into_iter()
        .map(|port| {
            let name = match port.port_type {
                SerialPortType::UsbPort(info) => info.product,
                SerialPortType::BluetoothPort => Some("Bluetooth serial".to_string()),
                _ => None,
            };
            DeviceInfo {
                device: DeviceRef::new(TransportKind::Serial, port.port_name),
                name,
            }
        })
        .collect())
}
