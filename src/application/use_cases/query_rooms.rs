//! Query Rooms Use Case
//!
//! Read-only facade over the active gallery: deduplicated room counts,
//! per-person snapshots, and renames. Performs no matching.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;

use crate::application::services::{EngineError, IdentityEngine};
use crate::domain::entities::{GlobalPerson, RoomLayout};
use crate::domain::value_objects::BoundingBox;
use crate::domain::{CameraId, PersonId, RoomId};

/// One `(person, camera)` observation inside a room. The same person may
/// appear once per camera but counts as a single occupant.
#[derive(Debug, Clone, Serialize)]
pub struct RoomOccupant {
    pub person_id: PersonId,
    pub name: Option<String>,
    pub camera_id: CameraId,
    pub bounding_box: BoundingBox,
    pub quality: f32,
}

/// Current occupancy of one room.
#[derive(Debug, Clone, Serialize)]
pub struct RoomPresence {
    pub room_id: RoomId,
    pub count: usize,
    pub occupants: Vec<RoomOccupant>,
}

/// Use case for room occupancy and person queries.
pub struct QueryRoomsUseCase {
    engine: Arc<IdentityEngine>,
    layout: RoomLayout,
}

impl QueryRoomsUseCase {
    pub fn new(engine: Arc<IdentityEngine>, layout: RoomLayout) -> Self {
        Self { engine, layout }
    }

    /// Lists everyone currently observed in a room, one entry per
    /// `(person, camera)` pair, with the deduplicated person count.
    pub async fn list_in_room(&self, room_id: RoomId) -> RoomPresence {
        let cameras: HashSet<CameraId> =
            self.layout.cameras_in_room(room_id).iter().copied().collect();

        let mut occupants = Vec::new();
        let mut distinct: HashSet<PersonId> = HashSet::new();

        for person in self.engine.active_snapshot().await {
            for (camera_id, position) in person.current_positions() {
                if !cameras.contains(camera_id) {
                    continue;
                }
                distinct.insert(person.id());
                occupants.push(RoomOccupant {
                    person_id: person.id(),
                    name: person.assigned_name().map(String::from),
                    camera_id: *camera_id,
                    bounding_box: position.bbox.clone(),
                    quality: person.embedding_quality(),
                });
            }
        }

        occupants.sort_by_key(|occupant| (occupant.person_id, occupant.camera_id));

        RoomPresence {
            room_id,
            count: distinct.len(),
            occupants,
        }
    }

    /// Number of distinct persons currently observed in a room.
    pub async fn count_in_room(&self, room_id: RoomId) -> usize {
        self.list_in_room(room_id).await.count
    }

    /// Full snapshot of one person.
    pub async fn get_person(&self, person_id: PersonId) -> Option<GlobalPerson> {
        self.engine.snapshot_person(person_id).await
    }

    /// Renames a person; `NotFound` when the id is unknown.
    pub async fn rename_person(&self, person_id: PersonId, name: String) -> Result<(), EngineError> {
        self.engine.rename(person_id, name).await
    }
}
