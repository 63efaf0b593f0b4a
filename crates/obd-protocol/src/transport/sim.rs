//! Simulated ELM327 adapter
//!
//! In-process notify-style adapter that answers the init sequence and
//! mode 01/09 requests from configurable vehicle values. Replies are cut
//! into small notification chunks like a real radio link would deliver them.

use super::notify::{NotifyPeripheral, NotifyRadio, NotifyTransport};
use super::{DeviceInfo, DeviceRef, LinkEvent, TransportKind};
use crate::error::TransportError;
use crate::pid::{lookup, Parameter};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Address the simulator advertises
pub const SIMULATOR_ADDRESS: &str = "SIM-ELM327";

/// Simulated vehicle and link behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    /// Delay before the first chunk of every reply
    pub response_delay_ms: u64,
    /// Notification size in bytes
    pub chunk_size: usize,
    pub engine_rpm: f64,
    pub vehicle_speed: f64,
    pub engine_load: f64,
    pub coolant_temp: f64,
    pub intake_air_temp: f64,
    pub mass_air_flow: f64,
    pub throttle_position: f64,
    pub control_module_voltage: f64,
    pub short_fuel_trim: f64,
    pub long_fuel_trim: f64,
    pub vin: String,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            response_delay_ms: 20,
            chunk_size: 4,
            engine_rpm: 1726.0,
            vehicle_speed: 60.0,
            engine_load: 35.0,
            coolant_temp: 90.0,
            intake_air_temp: 25.0,
            mass_air_flow: 12.5,
            throttle_position: 18.0,
            control_module_voltage: 14.2,
            short_fuel_trim: 1.56,
            long_fuel_trim: -2.34,
            vin: "1G1JC5444R7252367".to_string(),
        }
    }
}

struct SimState {
    config: SimulatorConfig,
    silent: HashSet<Parameter>,
    scripted: HashMap<Parameter, String>,
    failing_connects: u32,
    link: Option<mpsc::Sender<LinkEvent>>,
    generation: u64,
    requests: Vec<String>,
    in_flight: bool,
    overlaps: usize,
    connects: usize,
}

/// Radio backend that talks to an emulated adapter
#[derive(Clone)]
pub struct SimulatedRadio {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedRadio {
    pub fn new(config: SimulatorConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                config,
                silent: HashSet::new(),
                scripted: HashMap::new(),
                failing_connects: 0,
                link: None,
                generation: 0,
                requests: Vec::new(),
                in_flight: false,
                overlaps: 0,
                connects: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        lock(&self.state)
    }

    /// Change vehicle values while running
    pub fn update(&self, f: impl FnOnce(&mut SimulatorConfig)) {
        f(&mut self.lock().config);
    }

    /// Never answer requests for this parameter
    pub fn silence(&self, parameter: Parameter) {
        self.lock().silent.insert(parameter);
    }

    /// Answer requests for this parameter with a fixed raw reply
    pub fn respond_with(&self, parameter: Parameter, raw: &str) {
        self.lock().scripted.insert(parameter, raw.to_string());
    }

    /// Reject the next `count` connection attempts
    pub fn fail_next_connects(&self, count: u32) {
        self.lock().failing_connects = count;
    }

    /// Drop the current link as if the adapter went out of range
    pub fn drop_link(&self) {
        let mut state = self.lock();
        state.generation += 1;
        state.in_flight = false;
        if let Some(link) = state.link.take() {
            info!("Simulator dropping link");
            let _ = link.try_send(LinkEvent::Closed);
        }
    }

    /// Every command received so far, in order
    pub fn requests(&self) -> Vec<String> {
        self.lock().requests.clone()
    }

    /// Number of parameter requests written while another was unanswered
    pub fn overlapping_requests(&self) -> usize {
        self.lock().overlaps
    }

    /// Connection attempts seen, including rejected ones
    pub fn connect_count(&self) -> usize {
        self.lock().connects
    }
}

fn lock(state: &Mutex<SimState>) -> MutexGuard<'_, SimState> {
    // A panicked test thread must not wedge the simulator
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl NotifyRadio for SimulatedRadio {
    async fn discover(&self) -> Result<Vec<DeviceInfo>, TransportError> {
        Ok(vec![DeviceInfo {
            device: DeviceRef::new(TransportKind::Notify, SIMULATOR_ADDRESS),
            name: Some("Simulated ELM327".to_string()),
        }])
    }

    async fn connect(&self, address: &str) -> Result<NotifyTransport, TransportError> {
        let mut state = self.lock();
        state.connects += 1;

        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(TransportError::Connect {
                address: address.to_string(),
                reason: "simulated connect failure".to_string(),
            });
        }

        let (tx, rx) = mpsc::channel(256);
        state.generation += 1;
        state.in_flight = false;
        state.link = Some(tx.clone());

        let peripheral = SimPeripheral {
            state: self.state.clone(),
            link: tx,
            generation: state.generation,
        };
        debug!("Simulator accepted connection to {}", address);
        Ok(NotifyTransport::new(address, Box::new(peripheral), rx))
    }
}

struct SimPeripheral {
    state: Arc<Mutex<SimState>>,
    link: mpsc::Sender<LinkEvent>,
    generation: u64,
}

#[async_trait]
impl NotifyPeripheral for SimPeripheral {
    async fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let command = String::from_utf8_lossy(bytes).trim().to_ascii_uppercase();

        let (reply, delay, chunk_size) = {
            let mut state = lock(&self.state);
            if state.generation != self.generation || state.link.is_none() {
                return Err(TransportError::Write("simulated link is down".to_string()));
            }
            state.requests.push(command.clone());

            let is_request = !command.starts_with("AT");
            if is_request && state.in_flight {
                state.overlaps += 1;
            }
            let reply = state.reply_for(&command);
            state.in_flight = is_request && reply.is_some();
            (
                reply,
                Duration::from_millis(state.config.response_delay_ms),
                state.config.chunk_size.max(1),
            )
        };

        if let Some(reply) = reply {
            let link = self.link.clone();
            let state = self.state.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let chunks: Vec<Vec<u8>> = reply.as_bytes().chunks(chunk_size).map(<[u8]>::to_vec).collect();
                let last = chunks.len().saturating_sub(1);
                for (i, chunk) in chunks.into_iter().enumerate() {
                    if i == last {
                        lock(&state).in_flight = false;
                    }
                    if link.send(LinkEvent::Data(chunk)).await.is_err() {
                        break;
                    }
                }
            });
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        if state.generation == self.generation {
            state.link = None;
            state.in_flight = false;
        }
        Ok(())
    }
}

impl SimState {
    fn reply_for(&self, command: &str) -> Option<String> {
        if command == "ATZ" {
            return Some("\r\rELM327 v1.5\r\r>".to_string());
        }
        if command.starts_with("AT") {
            return Some("OK\r\r>".to_string());
        }

        let (mode, pid) = match (command.get(0..2), command.get(2..4)) {
            (Some(m), Some(p)) if command.len() == 4 => (
                u8::from_str_radix(m, 16).ok()?,
                u8::from_str_radix(p, 16).ok()?,
            ),
            _ => return Some("?\r\r>".to_string()),
        };

        let Some(def) = lookup(mode, pid) else {
            return Some("NO DATA\r\r>".to_string());
        };
        if self.silent.contains(&def.parameter) {
            return None;
        }
        if let Some(raw) = self.scripted.get(&def.parameter) {
            return Some(raw.clone());
        }

        if def.parameter == Parameter::Vin {
            return Some(can_vin_reply(&self.config.vin));
        }
        Some(format!(
            "{}{}\r\r>",
            def.response_prefix(),
            hex(&self.payload(def.parameter))
        ))
    }

    fn payload(&self, parameter: Parameter) -> Vec<u8> {
        let c = &self.config;
        match parameter {
            Parameter::EngineRpm => word(c.engine_rpm * 4.0),
            Parameter::VehicleSpeed => vec![c.vehicle_speed.round() as u8],
            Parameter::EngineLoad => vec![(c.engine_load * 255.0 / 100.0).round() as u8],
            Parameter::ThrottlePosition => vec![(c.throttle_position * 255.0 / 100.0).round() as u8],
            Parameter::CoolantTemp => vec![(c.coolant_temp + 40.0).round() as u8],
            Parameter::IntakeAirTemp => vec![(c.intake_air_temp + 40.0).round() as u8],
            Parameter::ShortFuelTrim => vec![(c.short_fuel_trim * 128.0 / 100.0 + 128.0).round() as u8],
            Parameter::LongFuelTrim => vec![(c.long_fuel_trim * 128.0 / 100.0 + 128.0).round() as u8],
            Parameter::MassAirFlow => word(c.mass_air_flow * 100.0),
            Parameter::ControlModuleVoltage => word(c.control_module_voltage * 1000.0),
            Parameter::Vin => Vec::new(),
        }
    }
}

fn word(value: f64) -> Vec<u8> {
    let v = value.round() as u16;
    vec![(v >> 8) as u8, (v & 0xFF) as u8]
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02X}", b)).collect()
}

/// ISO-TP style multi-frame reply: byte count line, then indexed frames of
/// six (first) and seven (following) bytes, padded with zeros.
fn can_vin_reply(vin: &str) -> String {
    let mut data = vec![0x49, 0x02, 0x01];
    data.extend(vin.bytes().take(17));

    let mut reply = format!("{:03X}\r", data.len());
    let mut frames = vec![data[..6.min(data.len())].to_vec()];
    frames.extend(data.get(6..).unwrap_or_default().chunks(7).map(<[u8]>::to_vec));

    for (i, mut frame) in frames.into_iter().enumerate() {
        let width = if i == 0 { 6 } else { 7 };
        frame.resize(width, 0);
        reply.push_str(&format!("{:X}:{}\r", i % 16, hex(&frame)));
    }
    reply.push_str("\r>");
    reply
}
