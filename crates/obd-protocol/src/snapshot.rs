//! Decoded Vehicle State
//!
//! `VehicleSnapshot` holds the last known value of every parameter;
//! `TelemetrySample` freezes it once per completed poll cycle.

use crate::pid::{Parameter, PidValue};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Last known decoded values. Fields stay `None` until first decoded and
/// keep their previous value when a later request fails.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VehicleSnapshot {
    /// Time of the most recent successful decode
    pub updated_at: Option<DateTime<Utc>>,
    /// Engine RPM
    pub engine_rpm: Option<f64>,
    /// Vehicle speed (km/h)
    pub vehicle_speed: Option<f64>,
    /// Engine load (0-100%)
    pub engine_load: Option<f64>,
    /// Coolant temperature (°C)
    pub coolant_temp: Option<f64>,
    /// Intake air temperature (°C)
    pub intake_air_temp: Option<f64>,
    /// Mass air flow rate (g/s)
    pub mass_air_flow: Option<f64>,
    /// Throttle position (0-100%)
    pub throttle_position: Option<f64>,
    /// Control module voltage (V)
    pub control_module_voltage: Option<f64>,
    /// Short-term fuel trim (%)
    pub short_fuel_trim: Option<f64>,
    /// Long-term fuel trim (%)
    pub long_fuel_trim: Option<f64>,
    /// Vehicle identification number
    pub vin: Option<String>,
}

impl VehicleSnapshot {
    /// Store a decoded value. Returns false if the value kind does not fit
    /// the parameter.
    pub fn apply(&mut self, parameter: Parameter, value: PidValue, at: DateTime<Utc>) -> bool {
        let applied = match (parameter, value) {
            (Parameter::Vin, PidValue::Text(vin)) => {
                self.vin = Some(vin);
                true
            }
            (_, PidValue::Text(_)) => false,
            (parameter, PidValue::Number(v)) => match self.slot(parameter) {
                Some(slot) => {
                    *slot = Some(v);
                    true
                }
                None => false,
            },
        };
        if applied {
            self.updated_at = Some(at);
        }
        applied
    }

    /// Read the current value of a parameter
    pub fn get(&self, parameter: Parameter) -> Option<PidValue> {
        match parameter {
            Parameter::Vin => self.vin.clone().map(PidValue::Text),
            Parameter::EngineRpm => self.engine_rpm.map(PidValue::Number),
            Parameter::VehicleSpeed => self.vehicle_speed.map(PidValue::Number),
            Parameter::EngineLoad => self.engine_load.map(PidValue::Number),
            Parameter::CoolantTemp => self.coolant_temp.map(PidValue::Number),
            Parameter::IntakeAirTemp => self.intake_air_temp.map(PidValue::Number),
            Parameter::MassAirFlow => self.mass_air_flow.map(PidValue::Number),
            Parameter::ThrottlePosition => self.throttle_position.map(PidValue::Number),
            Parameter::ControlModuleVoltage => self.control_module_voltage.map(PidValue::Number),
            Parameter::ShortFuelTrim => self.short_fuel_trim.map(PidValue::Number),
            Parameter::LongFuelTrim => self.long_fuel_trim.map(PidValue::Number),
        }
    }

    fn slot(&mut self, parameter: Parameter) -> Option<&mut Option<f64>> {
        let slot = match parameter {
            Parameter::EngineRpm => &mut self.engine_rpm,
            Parameter::VehicleSpeed => &mut self.vehicle_speed,
            Parameter::EngineLoad => &mut self.engine_load,
            Parameter::CoolantTemp => &mut self.coolant_temp,
            Parameter::IntakeAirTemp => &mut self.intake_air_temp,
            Parameter::MassAirFlow => &mut self.mass_air_flow,
            Parameter::ThrottlePosition => &mut self.throttle_position,
            Parameter::ControlModuleVoltage => &mut self.control_module_voltage,
            Parameter::ShortFuelTrim => &mut self.short_fuel_trim,
            Parameter::LongFuelTrim => &mut self.long_fuel_trim,
            Parameter::Vin => return None,
        };
        Some(slot)
    }
}

/// One completed poll cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub timestamp: DateTime<Utc>,
    pub values: VehicleSnapshot,
}

impl TelemetrySample {
    /// Create a sample from the snapshot as of the end of a cycle
    pub fn new(timestamp: DateTime<Utc>, values: VehicleSnapshot) -> Self {
        Self { timestamp, values }
    }
}

/// Messages from the driver to the telemetry buffer
#[derive(Debug, Clone)]
pub enum TelemetryEvent {
    /// A poll cycle finished
    Sample(TelemetrySample),
    /// Upload whatever is buffered now
    Flush,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_keeps_other_fields() {
        let now = Utc::now();
        let mut snapshot = VehicleSnapshot::default();
        assert!(snapshot.apply(Parameter::EngineRpm, PidValue::Number(1726.0), now));
        assert!(snapshot.apply(Parameter::CoolantTemp, PidValue::Number(50.0), now));
        assert!(snapshot.apply(Parameter::EngineRpm, PidValue::Number(800.0), now));

        assert_eq!(snapshot.engine_rpm, Some(800.0));
        assert_eq!(snapshot.coolant_temp, Some(50.0));
        assert_eq!(snapshot.vehicle_speed, None);
        assert_eq!(snapshot.updated_at, Some(now));
    }

    #[test]
    fn test_apply_rejects_mismatched_kind() {
        let mut snapshot = VehicleSnapshot::default();
        assert!(!snapshot.apply(Parameter::Vin, PidValue::Number(1.0), Utc::now()));
        assert!(!snapshot.apply(Parameter::LongFuelTrim, PidValue::Text("x".into()), Utc::now()));
        assert_eq!(snapshot, VehicleSnapshot::default());

        assert!(snapshot.apply(Parameter::Vin, PidValue::Text("WVW123".into()), Utc::now()));
        assert_eq!(snapshot.get(Parameter::Vin), Some(PidValue::Text("WVW123".into())));
    }
}
