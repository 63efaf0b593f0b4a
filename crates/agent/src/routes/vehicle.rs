//! Vehicle Data Routes

use axum::{extract::State, Json};
use obd_driver::{ConnectionState, ConnectionStatus};
use obd_protocol::VehicleSnapshot;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::AppState;

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: ConnectionStatus,
    pub state: ConnectionState,
    pub online: bool,
    pub vehicle_id: Option<String>,
    pub buffered_samples: usize,
    pub queued_batches: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BindVehicleRequest {
    pub vehicle_id: Option<String>,
}

/// Latest decoded values
pub async fn get_snapshot(State(state): State<Arc<AppState>>) -> Json<VehicleSnapshot> {
    Json(state.driver.snapshot())
}

pub async fn get_status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        status: state.driver.status(),
        state: state.driver.state(),
        online: state.network.is_online(),
        vehicle_id: state.uploader.vehicle_id(),
        buffered_samples: state.uploader.buffered().await,
        queued_batches: state.uploader.queued().await,
    })
}

/// Bind (or with `null`, unbind) the vehicle uploads belong to
pub async fn put_vehicle(
    State(state): State<Arc<AppState>>,
    Json(request): Json<BindVehicleRequest>,
) -> Json<BindVehicleRequest> {
    let vehicle_id = request.vehicle_id.filter(|id| !id.trim().is_empty());
    state.uploader.bind_vehicle(vehicle_id.clone());
    Json(BindVehicleRequest { vehicle_id })
}
