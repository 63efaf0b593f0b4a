//! Adapter Routes

use axum::{
    extract::{Query, State},
    Json,
};
use obd_protocol::{DeviceInfo, DeviceRef, TransportKind};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::ApiError;
use crate::AppState;

/// Query parameters for device discovery
#[derive(Debug, Deserialize)]
pub struct DeviceQuery {
    /// Limit discovery to one link kind
    pub kind: Option<TransportKind>,
}

#[derive(Debug, Serialize)]
pub struct DeviceList {
    pub devices: Vec<DeviceInfo>,
}

#[derive(Debug, Deserialize)]
pub struct ConnectRequest {
    pub kind: TransportKind,
    pub address: String,
    pub name: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CommandResponse {
    pub ok: bool,
}

pub async fn list_devices(
    State(state): State<Arc<AppState>>,
    Query(params): Query<DeviceQuery>,
) -> Json<DeviceList> {
    let kinds = match params.kind {
        Some(kind) => vec![kind],
        None => vec![TransportKind::Notify, TransportKind::Serial],
    };

    let mut devices = Vec::new();
    for kind in kinds {
        devices.extend(state.driver.discover(kind).await);
    }
    Json(DeviceList { devices })
}

pub async fn connect(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ConnectRequest>,
) -> Result<Json<CommandResponse>, ApiError> {
    let device = DeviceRef::new(request.kind, request.address);
    state.connect_device(device, request.name).await?;
    Ok(Json(CommandResponse { ok: true }))
}

pub async fn disconnect(
    State(state): State<Arc<AppState>>,
) -> Result<Json<CommandResponse>, ApiError> {
    state.disconnect_device().await?;
    Ok(Json(CommandResponse { ok: true }))
}

pub async fn start_polling(
    State(state): State<Arc<AppState>>,
) -> Result<Json<CommandResponse>, ApiError> {
    state.driver.start_polling().await?;
    Ok(Json(CommandResponse { ok: true }))
}

pub async fn stop_polling(
    State(state): State<Arc<AppState>>,
) -> Result<Json<CommandResponse>, ApiError> {
    state.driver.stop_polling().await?;
    Ok(Json(CommandResponse { ok: true }))
}
