//! Notify-style radio link
//!
//! The radio backend pushes every notification into a channel; the
//! transport turns that channel into `recv()`.

use super::{DeviceInfo, LinkEvent};
use crate::error::TransportError;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Radio stack able to scan for and open notify-style links
#[async_trait]
pub trait NotifyRadio: Send + Sync {
    /// Scan for, or list bonded, adapters
    async fn discover(&self) -> Result<Vec<DeviceInfo>, TransportError>;

    /// Open a link and subscribe to its notifications
    async fn connect(&self, address: &str) -> Result<NotifyTransport, TransportError>;
}

/// Write side of an open radio link
#[async_trait]
pub trait NotifyPeripheral: Send {
    async fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    async fn disconnect(&mut self) -> Result<(), TransportError>;
}

/// Open notify-style link
pub struct NotifyTransport {
    address: String,
    peripheral: Box<dyn NotifyPeripheral>,
    events: mpsc::Receiver<LinkEvent>,
    closed: bool,
}

impl NotifyTransport {
    /// Assemble a transport from a peripheral and its notification channel
    pub fn new(
        address: impl Into<String>,
        peripheral: Box<dyn NotifyPeripheral>,
        events: mpsc::Receiver<LinkEvent>,
    ) -> Self {
        Self {
            address: address.into(),
            peripheral,
            events,
            closed: false,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub async fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        self.peripheral.write(bytes).await
    }

    pub async fn recv(&mut self) -> LinkEvent {
        if self.closed {
            return LinkEvent::Closed;
        }
        match self.events.recv().await {
            Some(LinkEvent::Data(bytes)) => LinkEvent::Data(bytes),
            Some(LinkEvent::Closed) | None => {
                self.closed = true;
                LinkEvent::Closed
            }
        }
    }

    /// Drop queued notifications. A queued close is remembered and
    /// reported by the next `recv`.
    pub fn drain(&mut self) -> usize {
        let mut drained = 0;
        while let Ok(event) = self.events.try_recv() {
            match event {
                LinkEvent::Data(bytes) => drained += bytes.len(),
                LinkEvent::Closed => {
                    self.closed = true;
                    break;
                }
            }
        }
        drained
    }

    pub async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.closed = true;
        self.events.close();
        self.peripheral.disconnect().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullPeripheral;

    #[async_trait]
    impl NotifyPeripheral for NullPeripheral {
        async fn write(&mut self, _bytes: &[u8]) -> Result<(), TransportError> {
            Ok(())
        }

        async fn disconnect(&mut self) -> Result<(), TransportError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_chunks_arrive_in_order() {
        let (tx, rx) = mpsc::channel(8);
        let mut transport = NotifyTransport::new("AA:BB", Box::new(NullPeripheral), rx);

        tx.send(LinkEvent::Data(b"41 0C".to_vec())).await.unwrap();
        tx.send(LinkEvent::Data(b" 1A F8\r>".to_vec())).await.unwrap();

        assert_eq!(transport.recv().await, LinkEvent::Data(b"41 0C".to_vec()));
        assert_eq!(transport.recv().await, LinkEvent::Data(b" 1A F8\r>".to_vec()));
    }

    #[tokio::test]
    async fn test_drain_remembers_close() {
        let (tx, rx) = mpsc::channel(8);
        let mut transport = NotifyTransport::new("AA:BB", Box::new(NullPeripheral), rx);

        tx.send(LinkEvent::Data(b"OK\r\r>".to_vec())).await.unwrap();
        tx.send(LinkEvent::Closed).await.unwrap();

        assert_eq!(transport.drain(), 5);
        assert_eq!(transport.recv().await, LinkEvent::Closed);
        assert!(matches!(transport.write(b"010C\r").await, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn test_dropped_sender_reads_as_closed() {
        let (tx, rx) = mpsc::channel(8);
        let mut transport = NotifyTransport::new("AA:BB", Box::new(NullPeripheral), rx);
        drop(tx);
        assert_eq!(transport.recv().await, LinkEvent::Closed);
    }
}
