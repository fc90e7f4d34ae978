//! Room Occupancy Endpoints

use axum::{
    extract::{Path, State},
    Json,
};
use serde::Serialize;
use std::sync::Arc;

use crate::domain::{CameraId, PersonId, RoomId};
use crate::infrastructure::server::AppState;

#[derive(Debug, Serialize)]
pub struct RoomPeopleResponse {
    pub room_id: RoomId,
    pub count: usize,
    pub people: Vec<RoomPersonResponse>,
}

#[derive(Debug, Serialize)]
pub struct RoomPersonResponse {
    pub global_id: PersonId,
    pub name: Option<String>,
    pub camera_id: CameraId,
    pub bbox: [i32; 4],
    pub quality: f32,
}

/// GET /api/v1/rooms/:room_id/people
pub async fn room_people(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<RoomId>,
) -> Json<RoomPeopleResponse> {
    let presence = state.query_rooms.list_in_room(room_id).await;

    let people = presence
        .occupants
        .into_iter()
        .map(|occupant| RoomPersonResponse {
            global_id: occupant.person_id,
            name: occupant.name,
            camera_id: occupant.camera_id,
            bbox: occupant.bounding_box.to_corners(),
            quality: occupant.quality,
        })
        .collect();

    Json(RoomPeopleResponse {
        room_id: presence.room_id,
        count: presence.count,
        people,
    })
}
