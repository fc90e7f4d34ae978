//! API Routes
//!
//! REST API endpoint definitions.

pub mod cameras;
pub mod health;
pub mod people;
pub mod rooms;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use crate::infrastructure::server::AppState;

/// Creates all API routes.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        // Rooms
        .route("/rooms/:room_id/people", get(rooms::room_people))
        // People
        .route("/people/:id", get(people::get_person))
        .route("/people/:id/rename", post(people::rename_person))
        // Cameras
        .route("/cameras", get(cameras::list_cameras))
}
