//! Caller-facing handle to the driver task

use crate::error::DriverError;
use crate::observer::{SnapshotObservers, SubscriptionId};
use crate::session::{ConnectionState, ConnectionStatus};
use obd_protocol::{Connector, DeviceInfo, DeviceRef, TransportKind, VehicleSnapshot};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};

pub(crate) enum Command {
    Connect {
        device: DeviceRef,
        reply: oneshot::Sender<Result<(), DriverError>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    StartPolling,
    StopPolling {
        reply: oneshot::Sender<()>,
    },
    Shutdown,
}

/// Cloneable handle to a running driver. Every mutation goes through the
/// driver task; reads come from watch channels the task publishes to.
#[derive(Clone)]
pub struct DriverHandle {
    pub(crate) commands: mpsc::Sender<Command>,
    pub(crate) connector: Arc<dyn Connector>,
    pub(crate) snapshot: watch::Receiver<VehicleSnapshot>,
    pub(crate) status: watch::Receiver<ConnectionStatus>,
    pub(crate) state: watch::Receiver<ConnectionState>,
    pub(crate) observers: SnapshotObservers,
}

impl DriverHandle {
    async fn send(&self, command: Command) -> Result<(), DriverError> {
        self.commands.send(command).await.map_err(|_| DriverError::Stopped)
    }

    /// Open a session and run the adapter init sequence. Resolves once the
    /// session is ready or the attempt failed.
    pub async fn connect(&self, device: DeviceRef) -> Result<(), DriverError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Connect { device, reply }).await?;
        rx.await.map_err(|_| DriverError::Stopped)?
    }

    /// End the session. No reconnect follows and buffered telemetry is flushed.
    pub async fn disconnect(&self) -> Result<(), DriverError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Disconnect { reply }).await?;
        rx.await.map_err(|_| DriverError::Stopped)
    }

    pub async fn start_polling(&self) -> Result<(), DriverError> {
        self.send(Command::StartPolling).await
    }

    /// Stop polling, abandon the current cycle and flush buffered telemetry
    pub async fn stop_polling(&self) -> Result<(), DriverError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::StopPolling { reply }).await?;
        rx.await.map_err(|_| DriverError::Stopped)
    }

    /// Ask the driver task to close its session and exit
    pub async fn shutdown(&self) -> Result<(), DriverError> {
        self.send(Command::Shutdown).await
    }

    /// List candidate devices of one link kind
    pub async fn discover(&self, kind: TransportKind) -> Vec<DeviceInfo> {
        self.connector.discover(kind).await
    }

    pub fn snapshot(&self) -> VehicleSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    pub fn watch_snapshot(&self) -> watch::Receiver<VehicleSnapshot> {
        self.snapshot.clone()
    }

    /// Register a callback run on the driver task after each snapshot change.
    /// Callbacks must not block.
    pub fn subscribe(
        &self,
        callback: impl Fn(&VehicleSnapshot) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.observers.subscribe(callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.observers.unsubscribe(id)
    }
}
