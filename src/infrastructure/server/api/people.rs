//! Person Endpoints

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};

use crate::domain::entities::GlobalPerson;
use crate::domain::{CameraId, PersonId};
use crate::infrastructure::server::AppState;

#[derive(Debug, Serialize)]
pub struct PersonResponse {
    pub global_id: PersonId,
    pub name: Option<String>,
    pub display_name: String,
    pub cameras_visited: Vec<CameraId>,
    pub current_positions: HashMap<CameraId, PositionResponse>,
    pub avg_height_px: f32,
    pub avg_width_px: f32,
    pub embedding_quality: f32,
    pub first_seen_at: String,
    pub last_seen_at: String,
    pub total_appearances: u64,
    pub is_active: bool,
}

#[derive(Debug, Serialize)]
pub struct PositionResponse {
    pub bbox: [i32; 4],
    pub seen_at: String,
}

impl From<GlobalPerson> for PersonResponse {
    fn from(person: GlobalPerson) -> Self {
        let current_positions = person
            .current_positions()
            .iter()
            .map(|(camera_id, position)| {
                (
                    *camera_id,
                    PositionResponse {
                        bbox: position.bbox.to_corners(),
                        seen_at: position.seen_at.to_rfc3339(),
                    },
                )
            })
            .collect();

        Self {
            global_id: person.id(),
            name: person.assigned_name().map(String::from),
            display_name: person.display_name(),
            cameras_visited: person.cameras_visited().iter().copied().collect(),
            current_positions,
            avg_height_px: person.avg_height_px(),
            avg_width_px: person.avg_width_px(),
            embedding_quality: person.embedding_quality(),
            first_seen_at: person.first_seen_at().to_rfc3339(),
            last_seen_at: person.last_seen_at().to_rfc3339(),
            total_appearances: person.total_appearances(),
            is_active: person.is_active(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RenameBody {
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct RenameResponse {
    pub ok: bool,
}

/// GET /api/v1/people/:id
pub async fn get_person(
    State(state): State<Arc<AppState>>,
    Path(id): Path<PersonId>,
) -> Result<Json<PersonResponse>, StatusCode> {
    let person = state
        .query_rooms
        .get_person(id)
        .await
        .ok_or(StatusCode::NOT_FOUND)?;

    Ok(Json(person.into()))
}

/// POST /api/v1/people/:id/rename
pub async fn rename_person(
    State(state): State<Arc<AppState>>,
    Path(id): Path<PersonId>,
    Json(body): Json<RenameBody>,
) -> Result<Json<RenameResponse>, StatusCode> {
    state
        .query_rooms
        .rename_person(id, body.name)
        .await
        .map_err(|_| StatusCode::NOT_FOUND)?;

    Ok(Json(RenameResponse { ok: true }))
}
