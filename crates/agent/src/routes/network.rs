//! Connectivity and Upload Routes

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use cloud_sync::UploadOutcome;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::ApiError;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct NetworkReport {
    pub online: bool,
}

#[derive(Debug, Serialize)]
pub struct FlushResponse {
    pub outcome: UploadOutcome,
}

/// Connectivity change reported by the host
pub async fn report(
    State(state): State<Arc<AppState>>,
    Json(report): Json<NetworkReport>,
) -> StatusCode {
    state.network.report(report.online).await;
    StatusCode::ACCEPTED
}

/// Upload whatever is buffered without waiting for a full batch
pub async fn flush(State(state): State<Arc<AppState>>) -> Json<FlushResponse> {
    Json(FlushResponse {
        outcome: state.uploader.flush().await,
    })
}

/// Prometheus text exposition
pub async fn metrics(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    let handle = state
        .metrics
        .as_ref()
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "metrics are disabled"))?;
    Ok((
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        handle.render(),
    ))
}
