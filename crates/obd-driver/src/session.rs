//! Session and In-Flight Request State

use obd_protocol::{codec, DeviceRef, ParameterDefinition};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Driver state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    /// Link open, adapter init sequence running
    Initializing,
    /// Ready for the next poll cycle
    Idle,
    /// One request outstanding
    AwaitingResponse,
    /// Link lost, retrying
    Reconnecting,
}

/// Coarse connection status for the presentation layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

/// The device the driver is bound to, from connect until disconnect
#[derive(Debug, Clone)]
pub struct ConnectionSession {
    pub device: DeviceRef,
    pub state: ConnectionState,
    pub reconnect_attempts: u32,
}

impl ConnectionSession {
    pub fn new(device: DeviceRef) -> Self {
        Self {
            device,
            state: ConnectionState::Disconnected,
            reconnect_attempts: 0,
        }
    }
}

/// The single outstanding request and the reply collected so far
#[derive(Debug)]
pub struct PendingRequest {
    definition: &'static ParameterDefinition,
    response: String,
    /// Abandon the request at this instant
    pub deadline: Instant,
}

impl PendingRequest {
    pub fn new(definition: &'static ParameterDefinition, deadline: Instant) -> Self {
        Self {
            definition,
            response: String::new(),
            deadline,
        }
    }

    pub fn definition(&self) -> &'static ParameterDefinition {
        self.definition
    }

    pub fn response(&self) -> &str {
        &self.response
    }

    /// Append reply bytes. A prompt left over from the previous reply may
    /// lead the buffer; it is dropped so it cannot end this request early.
    pub fn append(&mut self, bytes: &[u8]) {
        self.response.push_str(&String::from_utf8_lossy(bytes));
        let stale = self
            .response
            .trim_start_matches(|c: char| c == codec::PROMPT || c.is_ascii_whitespace());
        if stale.len() != self.response.len() {
            self.response = stale.to_string();
        }
    }

    /// A terminator for this parameter's framing has arrived
    pub fn is_complete(&self) -> bool {
        codec::is_complete(&self.response, self.definition.frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use obd_protocol::Parameter;

    #[test]
    fn test_pending_reassembles_chunks() {
        let mut pending = PendingRequest::new(Parameter::EngineRpm.definition(), Instant::now());
        pending.append(b"41 0");
        pending.append(b"C 1A");
        assert!(!pending.is_complete());
        pending.append(b" F8\r");
        assert!(pending.is_complete());
        assert_eq!(pending.response(), "41 0C 1A F8\r");
    }

    #[test]
    fn test_leading_prompt_is_not_a_reply() {
        let mut pending = PendingRequest::new(Parameter::VehicleSpeed.definition(), Instant::now());
        pending.append(b"\r>");
        assert!(!pending.is_complete());
        pending.append(b"410D3C\r");
        assert!(pending.is_complete());
        assert_eq!(pending.response(), "410D3C\r");
    }

    #[test]
    fn test_multi_frame_waits_for_prompt() {
        let mut pending = PendingRequest::new(Parameter::Vin.definition(), Instant::now());
        pending.append(b"014\r0:4902013147314A\r");
        assert!(!pending.is_complete());
        pending.append(b"\r>");
        assert!(pending.is_complete());
    }
}
