//! HTTP API handlers

use axum::{extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::control::{CascadeMetrics, ControlParameters, Gains};
use crate::network::ConnectionQuality;
use crate::playback::PlaybackMetrics;
use crate::protocol::{Coordinates, NetworkNode};
use crate::sync::SessionStatus;
use crate::ui::server::AppState;

/// API response wrapper
#[derive(Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

type Reply<T> = (StatusCode, Json<ApiResponse<T>>);

fn closed<T>() -> Reply<T> {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(ApiResponse::error("session is closed")),
    )
}

/// Session status plus uptime
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemStatus {
    #[serde(flatten)]
    pub session: SessionStatus,
    pub uptime_seconds: u64,
}

pub async fn get_status(State(state): State<Arc<AppState>>) -> Json<ApiResponse<SystemStatus>> {
    Json(ApiResponse::ok(SystemStatus {
        session: state.session.status(),
        uptime_seconds: state.started.elapsed().as_secs(),
    }))
}

/// Controller, playback and link metrics in one document
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub cascade: CascadeMetrics,
    pub playback: PlaybackMetrics,
    pub connection: ConnectionQuality,
    pub applied_rate: f64,
}

pub async fn get_metrics(State(state): State<Arc<AppState>>) -> Json<ApiResponse<MetricsSnapshot>> {
    let status = state.session.status();
    Json(ApiResponse::ok(MetricsSnapshot {
        cascade: *state.session.cascade_metrics(),
        playback: status.playback,
        connection: status.connection,
        applied_rate: status.applied_rate,
    }))
}

pub async fn get_nodes(State(state): State<Arc<AppState>>) -> Json<ApiResponse<Vec<NetworkNode>>> {
    Json(ApiResponse::ok(state.session.nodes().as_ref().clone()))
}

/// Flip sync; returns the new setting
pub async fn toggle_sync(State(state): State<Arc<AppState>>) -> Reply<bool> {
    match state.session.toggle_sync().await {
        Ok(enabled) => (StatusCode::OK, Json(ApiResponse::ok(enabled))),
        Err(_) => closed(),
    }
}

fn gains_are_finite(gains: &Gains) -> bool {
    gains.kp.is_finite() && gains.ki.is_finite() && gains.kd.is_finite()
}

/// Replace the cascade gains
pub async fn update_control(
    State(state): State<Arc<AppState>>,
    Json(params): Json<ControlParameters>,
) -> Reply<ControlParameters> {
    if !gains_are_finite(&params.inner_loop) || !gains_are_finite(&params.outer_loop) {
        return (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::error("gains must be finite")),
        );
    }
    match state.session.update_control_parameters(params).await {
        Ok(()) => (StatusCode::OK, Json(ApiResponse::ok(params))),
        Err(_) => closed(),
    }
}

/// Try the proximity transport; `false` means the relay stays in use
pub async fn switch_to_proximity(State(state): State<Arc<AppState>>) -> Reply<bool> {
    match state.session.switch_to_proximity_transport().await {
        Ok(switched) => (StatusCode::OK, Json(ApiResponse::ok(switched))),
        Err(_) => closed(),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackRequest {
    pub song_id: u64,
}

pub async fn select_track(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TrackRequest>,
) -> Reply<u64> {
    match state.session.select_track(req.song_id).await {
        Ok(()) => (StatusCode::OK, Json(ApiResponse::ok(req.song_id))),
        Err(crate::Error::Session(_)) => closed(),
        Err(e) => (StatusCode::BAD_REQUEST, Json(ApiResponse::error(e.to_string()))),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationRequest {
    pub coordinates: Coordinates,
    pub country_code: String,
}

pub async fn report_location(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LocationRequest>,
) -> Reply<()> {
    match state.session.report_location(req.coordinates, req.country_code).await {
        Ok(()) => (StatusCode::OK, Json(ApiResponse::ok(()))),
        Err(_) => closed(),
    }
}

/// Start a fresh round of connection attempts
pub async fn reconnect(State(state): State<Arc<AppState>>) -> Reply<()> {
    match state.session.reconnect().await {
        Ok(()) => (StatusCode::ACCEPTED, Json(ApiResponse::ok(()))),
        Err(_) => closed(),
    }
}
