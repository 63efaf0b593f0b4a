//! ELM327 Protocol Driver
//!
//! Owns one adapter session at a time: runs the init sequence, polls the
//! configured parameters with at most one request in flight, folds decoded
//! values into a shared [`VehicleSnapshot`](obd_protocol::VehicleSnapshot)
//! and reconnects after an unexpected link loss.

mod config;
mod driver;
mod error;
mod handle;
mod observer;
mod session;

pub use config::DriverConfig;
pub use driver::Driver;
pub use error::DriverError;
pub use handle::DriverHandle;
pub use observer::{SnapshotObservers, SubscriptionId};
pub use session::{ConnectionSession, ConnectionState, ConnectionStatus, PendingRequest};
