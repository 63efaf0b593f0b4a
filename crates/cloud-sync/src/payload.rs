//! Upload payload

use crate::UploadError;
use chrono::{DateTime, Utc};
use obd_protocol::TelemetrySample;
use serde::{Deserialize, Serialize};
use storage::UploadRequest;
use uuid::Uuid;

/// One sample as the collector sees it. Unknown values are omitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryItem {
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rpm: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voltage: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coolant_temp: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine_load: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub short_fuel_trim: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub long_fuel_trim: Option<f64>,
}

impl From<&TelemetrySample> for TelemetryItem {
    fn from(sample: &TelemetrySample) -> Self {
        let v = &sample.values;
        Self {
            timestamp: sample.timestamp,
            rpm: v.engine_rpm,
            speed: v.vehicle_speed,
            voltage: v.control_module_voltage,
            coolant_temp: v.coolant_temp,
            engine_load: v.engine_load,
            short_fuel_trim: v.short_fuel_trim,
            long_fuel_trim: v.long_fuel_trim,
        }
    }
}

/// Batch upload body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryBatch {
    pub batch_id: Uuid,
    pub vehicle_id: String,
    pub items: Vec<TelemetryItem>,
}

impl TelemetryBatch {
    pub fn new(vehicle_id: &str, samples: &[TelemetrySample]) -> Self {
        Self {
            batch_id: Uuid::new_v4(),
            vehicle_id: vehicle_id.to_string(),
            items: samples.iter().map(TelemetryItem::from).collect(),
        }
    }

    /// Collector path for this vehicle's telemetry
    pub fn endpoint(&self) -> String {
        format!("/vehicles/{}/telemetry", self.vehicle_id)
    }

    pub fn to_request(&self) -> Result<UploadRequest, UploadError> {
        let body = serde_json::to_string(self).map_err(|e| UploadError::Serialization(e.to_string()))?;
        Ok(UploadRequest {
            endpoint: self.endpoint(),
            method: "POST".to_string(),
            body,
            submitted_at: Utc::now(),
        })
    }
}
