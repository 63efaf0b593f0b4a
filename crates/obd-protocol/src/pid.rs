//! OBD-II PID Registry and Decoding
//!
//! Static table of the parameters the driver knows how to request, with
//! their declared payload length, unit, valid range and decoding formula.

use crate::error::ProtocolError;
use crate::mode;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Parameters known to the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Parameter {
    /// Calculated engine load (01 04)
    EngineLoad,
    /// Engine coolant temperature (01 05)
    CoolantTemp,
    /// Short-term fuel trim bank 1 (01 06)
    ShortFuelTrim,
    /// Long-term fuel trim bank 1 (01 07)
    LongFuelTrim,
    /// Engine RPM (01 0C)
    EngineRpm,
    /// Vehicle speed (01 0D)
    VehicleSpeed,
    /// Intake air temperature (01 0F)
    IntakeAirTemp,
    /// Mass air flow rate (01 10)
    MassAirFlow,
    /// Throttle position (01 11)
    ThrottlePosition,
    /// Control module voltage (01 42)
    ControlModuleVoltage,
    /// Vehicle identification number (09 02)
    Vin,
}

impl Parameter {
    /// Every parameter in the registry
    pub const ALL: [Parameter; 11] = [
        Parameter::EngineLoad,
        Parameter::CoolantTemp,
        Parameter::ShortFuelTrim,
        Parameter::LongFuelTrim,
        Parameter::EngineRpm,
        Parameter::VehicleSpeed,
        Parameter::IntakeAirTemp,
        Parameter::MassAirFlow,
        Parameter::ThrottlePosition,
        Parameter::ControlModuleVoltage,
        Parameter::Vin,
    ];

    /// Get the static definition for this parameter
    pub fn definition(self) -> &'static ParameterDefinition {
        match self {
            Parameter::EngineLoad => &ENGINE_LOAD,
            Parameter::CoolantTemp => &COOLANT_TEMP,
            Parameter::ShortFuelTrim => &SHORT_FUEL_TRIM,
            Parameter::LongFuelTrim => &LONG_FUEL_TRIM,
            Parameter::EngineRpm => &ENGINE_RPM,
            Parameter::VehicleSpeed => &VEHICLE_SPEED,
            Parameter::IntakeAirTemp => &INTAKE_AIR_TEMP,
            Parameter::MassAirFlow => &MASS_AIR_FLOW,
            Parameter::ThrottlePosition => &THROTTLE_POSITION,
            Parameter::ControlModuleVoltage => &CONTROL_MODULE_VOLTAGE,
            Parameter::Vin => &VIN,
        }
    }

    /// Default poll batch: the fields carried by the upload endpoint
    pub fn default_poll_set() -> Vec<Parameter> {
        vec![
            Parameter::EngineRpm,
            Parameter::VehicleSpeed,
            Parameter::EngineLoad,
            Parameter::CoolantTemp,
            Parameter::ControlModuleVoltage,
            Parameter::ShortFuelTrim,
            Parameter::LongFuelTrim,
        ]
    }
}

impl fmt::Display for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let def = self.definition();
        write!(f, "{:?} ({:02X}{:02X})", self, def.mode, def.pid)
    }
}

/// A decoded parameter value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PidValue {
    /// Physical measurement
    Number(f64),
    /// Text payload such as the VIN
    Text(String),
}

impl PidValue {
    /// Numeric value, if this is a measurement
    pub fn as_number(&self) -> Option<f64> {
        match self {
            PidValue::Number(v) => Some(*v),
            PidValue::Text(_) => None,
        }
    }
}

/// How a response is framed on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// One line, terminated by CR or the prompt
    Single,
    /// Several lines, complete only at the prompt
    Multi,
}

/// Immutable description of one parameter
#[derive(Clone, Copy)]
pub struct ParameterDefinition {
    pub parameter: Parameter,
    /// Request mode (01 current data, 09 vehicle info)
    pub mode: u8,
    /// Parameter code within the mode
    pub pid: u8,
    /// Declared payload length in bytes
    pub bytes: usize,
    pub unit: &'static str,
    /// Valid numeric range, inclusive. `None` for text parameters.
    pub range: Option<(f64, f64)>,
    pub frames: FrameKind,
    decoder: fn(&[u8]) -> PidValue,
}

impl fmt::Debug for ParameterDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParameterDefinition")
            .field("parameter", &self.parameter)
            .field("mode", &self.mode)
            .field("pid", &self.pid)
            .field("bytes", &self.bytes)
            .field("unit", &self.unit)
            .field("range", &self.range)
            .field("frames", &self.frames)
            .finish()
    }
}

impl ParameterDefinition {
    /// ASCII request body, without the trailing carriage return
    pub fn request(&self) -> String {
        format!("{:02X}{:02X}", self.mode, self.pid)
    }

    /// Expected start of a positive response: (mode + 0x40) then the PID
    pub fn response_prefix(&self) -> String {
        format!("{:02X}{:02X}", self.mode + 0x40, self.pid)
    }

    /// Apply the decoding formula after checking the payload length
    pub fn decode(&self, bytes: &[u8]) -> Result<PidValue, ProtocolError> {
        if bytes.len() < self.bytes {
            return Err(ProtocolError::InsufficientData {
                expected: self.bytes,
                actual: bytes.len(),
            });
        }
        Ok((self.decoder)(bytes))
    }
}

static ENGINE_LOAD: ParameterDefinition = ParameterDefinition {
    parameter: Parameter::EngineLoad,
    mode: mode::CURRENT_DATA,
    pid: 0x04,
    bytes: 1,
    unit: "%",
    range: Some((0.0, 100.0)),
    frames: FrameKind::Single,
    decoder: percent,
};

static COOLANT_TEMP: ParameterDefinition = ParameterDefinition {
    parameter: Parameter::CoolantTemp,
    mode: mode::CURRENT_DATA,
    pid: 0x05,
    bytes: 1,
    unit: "°C",
    range: Some((-40.0, 215.0)),
    frames: FrameKind::Single,
    decoder: temperature,
};

static SHORT_FUEL_TRIM: ParameterDefinition = ParameterDefinition {
    parameter: Parameter::ShortFuelTrim,
    mode: mode::CURRENT_DATA,
    pid: 0x06,
    bytes: 1,
    unit: "%",
    range: Some((-100.0, 99.22)),
    frames: FrameKind::Single,
    decoder: fuel_trim,
};

static LONG_FUEL_TRIM: ParameterDefinition = ParameterDefinition {
    parameter: Parameter::LongFuelTrim,
    mode: mode::CURRENT_DATA,
    pid: 0x07,
    bytes: 1,
    unit: "%",
    range: Some((-100.0, 99.22)),
    frames: FrameKind::Single,
    decoder: fuel_trim,
};

static ENGINE_RPM: ParameterDefinition = ParameterDefinition {
    parameter: Parameter::EngineRpm,
    mode: mode::CURRENT_DATA,
    pid: 0x0C,
    bytes: 2,
    unit: "rpm",
    range: Some((0.0, 16383.75)),
    frames: FrameKind::Single,
    decoder: rpm,
};

static VEHICLE_SPEED: ParameterDefinition = ParameterDefinition {
    parameter: Parameter::VehicleSpeed,
    mode: mode::CURRENT_DATA,
    pid: 0x0D,
    bytes: 1,
    unit: "km/h",
    range: Some((0.0, 255.0)),
    frames: FrameKind::Single,
    decoder: single_byte,
};

static INTAKE_AIR_TEMP: ParameterDefinition = ParameterDefinition {
    parameter: Parameter::IntakeAirTemp,
    mode: mode::CURRENT_DATA,
    pid: 0x0F,
    bytes: 1,
    unit: "°C",
    range: Some((-40.0, 215.0)),
    frames: FrameKind::Single,
    decoder: temperature,
};

static MASS_AIR_FLOW: ParameterDefinition = ParameterDefinition {
    parameter: Parameter::MassAirFlow,
    mode: mode::CURRENT_DATA,
    pid: 0x10,
    bytes: 2,
    unit: "g/s",
    range: Some((0.0, 655.35)),
    frames: FrameKind::Single,
    decoder: mass_air_flow,
};

static THROTTLE_POSITION: ParameterDefinition = ParameterDefinition {
    parameter: Parameter::ThrottlePosition,
    mode: mode::CURRENT_DATA,
    pid: 0x11,
    bytes: 1,
    unit: "%",
    range: Some((0.0, 100.0)),
    frames: FrameKind::Single,
    decoder: percent,
};

static CONTROL_MODULE_VOLTAGE: ParameterDefinition = ParameterDefinition {
    parameter: Parameter::ControlModuleVoltage,
    mode: mode::CURRENT_DATA,
    pid: 0x42,
    bytes: 2,
    unit: "V",
    range: Some((0.0, 65.535)),
    frames: FrameKind::Single,
    decoder: voltage,
};

// Frame counter byte plus 17 VIN characters
static VIN: ParameterDefinition = ParameterDefinition {
    parameter: Parameter::Vin,
    mode: mode::VEHICLE_INFO,
    pid: 0x02,
    bytes: 18,
    unit: "",
    range: None,
    frames: FrameKind::Multi,
    decoder: vin,
};

/// Look up a definition by its mode/PID pair
pub fn lookup(mode: u8, pid: u8) -> Option<&'static ParameterDefinition> {
    Parameter::ALL
        .iter()
        .map(|p| p.definition())
        .find(|def| def.mode == mode && def.pid == pid)
}

fn word(bytes: &[u8]) -> f64 {
    (bytes[0] as f64 * 256.0) + bytes[1] as f64
}

// A * 100 / 255 (%)
fn percent(bytes: &[u8]) -> PidValue {
    PidValue::Number(bytes[0] as f64 * 100.0 / 255.0)
}

// A - 40 (°C)
fn temperature(bytes: &[u8]) -> PidValue {
    PidValue::Number(bytes[0] as f64 - 40.0)
}

// (A - 128) * 100 / 128 (%)
fn fuel_trim(bytes: &[u8]) -> PidValue {
    PidValue::Number((bytes[0] as f64 - 128.0) * 100.0 / 128.0)
}

// ((A*256)+B)/4
fn rpm(bytes: &[u8]) -> PidValue {
    PidValue::Number(word(bytes) / 4.0)
}

fn single_byte(bytes: &[u8]) -> PidValue {
    PidValue::Number(bytes[0] as f64)
}

// ((A*256)+B) / 100 (g/s)
fn mass_air_flow(bytes: &[u8]) -> PidValue {
    PidValue::Number(word(bytes) / 100.0)
}

// ((A*256)+B) / 1000 (V)
fn voltage(bytes: &[u8]) -> PidValue {
    PidValue::Number(word(bytes) / 1000.0)
}

fn vin(bytes: &[u8]) -> PidValue {
    let text = bytes
        .iter()
        .skip(1)
        .filter(|b| (0x20..=0x7E).contains(*b))
        .map(|&b| b as char)
        .collect::<String>();
    PidValue::Text(text.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn number(parameter: Parameter, bytes: &[u8]) -> f64 {
        parameter
            .definition()
            .decode(bytes)
            .unwrap()
            .as_number()
            .unwrap()
    }

    #[test]
    fn test_rpm_decode() {
        // (0x1A * 256 + 0xF8) / 4 = 6904 / 4 = 1726
        assert!((number(Parameter::EngineRpm, &[0x1A, 0xF8]) - 1726.0).abs() < 0.01);
    }

    #[test]
    fn test_coolant_temp_decode() {
        assert!((number(Parameter::CoolantTemp, &[0x5A]) - 50.0).abs() < 0.01);
    }

    #[test]
    fn test_voltage_decode() {
        // 0x3A98 = 15000 mV
        assert!((number(Parameter::ControlModuleVoltage, &[0x3A, 0x98]) - 15.0).abs() < 0.001);
    }

    #[test]
    fn test_fuel_trim_decode() {
        assert!((number(Parameter::ShortFuelTrim, &[0x80]) - 0.0).abs() < 0.01);
        assert!((number(Parameter::LongFuelTrim, &[0x90]) - 12.5).abs() < 0.01);
        assert!((number(Parameter::LongFuelTrim, &[0x00]) + 100.0).abs() < 0.01);
    }

    #[test]
    fn test_vin_decode_drops_counter_and_non_printable() {
        let mut bytes = vec![0x01];
        bytes.extend_from_slice(b"1G1JC5444R7252367");
        bytes.push(0x00);
        let value = Parameter::Vin.definition().decode(&bytes).unwrap();
        assert_eq!(value, PidValue::Text("1G1JC5444R7252367".to_string()));
    }

    #[test]
    fn test_insufficient_data() {
        let err = Parameter::EngineRpm.definition().decode(&[0x1A]).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::InsufficientData {
                expected: 2,
                actual: 1
            }
        );
    }

    #[test]
    fn test_lookup_and_prefix() {
        let def = lookup(0x01, 0x0C).unwrap();
        assert_eq!(def.parameter, Parameter::EngineRpm);
        assert_eq!(def.request(), "010C");
        assert_eq!(def.response_prefix(), "410C");
        assert_eq!(Parameter::Vin.definition().response_prefix(), "4902");
        assert!(lookup(0x01, 0xFF).is_none());
    }

    #[test]
    fn test_definitions_are_consistent() {
        for parameter in Parameter::ALL {
            assert_eq!(parameter.definition().parameter, parameter);
        }
    }

    proptest! {
        #[test]
        fn decoded_numbers_stay_in_range(
            index in 0usize..Parameter::ALL.len(),
            bytes in proptest::collection::vec(any::<u8>(), 2..8),
        ) {
            let def = Parameter::ALL[index].definition();
            if let Some((min, max)) = def.range {
                let value = def.decode(&bytes).unwrap().as_number().unwrap();
                prop_assert!(value >= min && value <= max, "{} out of range: {}", def.parameter, value);
            }
        }
    }
}
