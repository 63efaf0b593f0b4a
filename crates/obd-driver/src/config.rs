//! Driver Configuration

use obd_protocol::{ObdProtocol, Parameter};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the protocol driver
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Parameters requested on every poll cycle, in order
    pub parameters: Vec<Parameter>,
    /// Time between poll cycles (default: 1000ms, 1 Hz)
    pub poll_interval_ms: u64,
    /// Pause after each adapter init command
    pub init_command_delay_ms: u64,
    /// Give up on a request after this long without a complete reply
    pub response_timeout_ms: u64,
    /// Reconnect attempts after an unexpected disconnect
    pub max_reconnect_attempts: u32,
    /// Delay before each reconnect attempt
    pub reconnect_delay_ms: u64,
    /// Bus protocol selected during init
    pub protocol: ObdProtocol,
    /// Start polling as soon as a session is ready
    pub poll_on_connect: bool,
    /// Command channel capacity
    pub command_buffer: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            parameters: Parameter::default_poll_set(),
            poll_interval_ms: 1000,
            init_command_delay_ms: 500,
            response_timeout_ms: 2000,
            max_reconnect_attempts: 5,
            reconnect_delay_ms: 3000,
            protocol: ObdProtocol::Auto,
            poll_on_connect: true,
            command_buffer: 32,
        }
    }
}

impl DriverConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn init_command_delay(&self) -> Duration {
        Duration::from_millis(self.init_command_delay_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}
