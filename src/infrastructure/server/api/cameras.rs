//! Camera Endpoints

use std::sync::Arc;

use axum::{extract::State, Json};
use serde::Serialize;

use crate::domain::{CameraId, RoomId};
use crate::infrastructure::server::AppState;

#[derive(Debug, Serialize)]
pub struct CameraResponse {
    pub camera_id: CameraId,
    pub room_id: RoomId,
    pub state: String,
    pub frames_captured: u64,
}

#[derive(Debug, Serialize)]
pub struct CameraListResponse {
    pub cameras: Vec<CameraResponse>,
}

/// GET /api/v1/cameras
pub async fn list_cameras(State(state): State<Arc<AppState>>) -> Json<CameraListResponse> {
    let statuses = match &state.camera_service {
        Some(service) => service.statuses().await,
        None => Vec::new(),
    };

    let cameras = state
        .config
        .cameras
        .iter()
        .map(|spec| {
            let status = statuses.iter().find(|s| s.camera_id == spec.id);
            CameraResponse {
                camera_id: spec.id,
                room_id: spec.room_id,
                state: status.map(|s| s.state.to_string()).unwrap_or_else(|| "disabled".to_string()),
                frames_captured: status.map(|s| s.frames_captured).unwrap_or(0),
            }
        })
        .collect();

    Json(CameraListResponse { cameras })
}
