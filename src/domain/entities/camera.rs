//! Camera Entity and Room Layout
//!
//! Cameras are identified by small facility-wide integers and grouped into
//! rooms. The layout also declares which camera pairs have overlapping
//! fields of view; the spatial matching stage is a no-op without it.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::domain::{CameraId, RoomId};

/// A configured camera.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Camera {
    id: CameraId,
    name: String,
    device_index: u32,
    room_id: RoomId,
    is_enabled: bool,
}

impl Camera {
    pub fn new(id: CameraId, name: String, device_index: u32, room_id: RoomId) -> Self {
        Self {
            id,
            name,
            device_index,
            room_id,
            is_enabled: true,
        }
    }

    pub fn id(&self) -> CameraId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn device_index(&self) -> u32 {
        self.device_index
    }

    pub fn room_id(&self) -> RoomId {
        self.room_id
    }

    pub fn is_enabled(&self) -> bool {
        self.is_enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.is_enabled = enabled;
    }
}

/// Room membership and camera overlap topology.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoomLayout {
    rooms: HashMap<RoomId, Vec<CameraId>>,
    overlaps: HashSet<(CameraId, CameraId)>,
}

impl RoomLayout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assigns a camera to a room.
    pub fn add_camera(&mut self, room_id: RoomId, camera_id: CameraId) {
        let cameras = self.rooms.entry(room_id).or_default();
        if !cameras.contains(&camera_id) {
            cameras.push(camera_id);
        }
    }

    /// Declares two cameras as having overlapping fields of view.
    pub fn add_overlap(&mut self, a: CameraId, b: CameraId) {
        if a != b {
            self.overlaps.insert(Self::normalized(a, b));
        }
    }

    /// Cameras belonging to a room, empty if the room is unknown.
    pub fn cameras_in_room(&self, room_id: RoomId) -> &[CameraId] {
        self.rooms.get(&room_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// The room a camera belongs to, if any.
    pub fn room_of(&self, camera_id: CameraId) -> Option<RoomId> {
        self.rooms
            .iter()
            .find(|(_, cameras)| cameras.contains(&camera_id))
            .map(|(room_id, _)| *room_id)
    }

    /// Whether two distinct cameras are declared overlapping.
    pub fn overlapping(&self, a: CameraId, b: CameraId) -> bool {
        a != b && self.overlaps.contains(&Self::normalized(a, b))
    }

    /// True when any overlap information was supplied.
    pub fn has_overlaps(&self) -> bool {
        !self.overlaps.is_empty()
    }

    pub fn room_ids(&self) -> impl Iterator<Item = RoomId> + '_ {
        self.rooms.keys().copied()
    }

    fn normalized(a: CameraId, b: CameraId) -> (CameraId, CameraId) {
        (a.min(b), a.max(b))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlap_is_symmetric() {
        let mut layout = RoomLayout::new();
        layout.add_overlap(1, 2);
        assert!(layout.overlapping(1, 2));
        assert!(layout.overlapping(2, 1));
    }

    #[test]
    fn camera_never_overlaps_itself() {
        let mut layout = RoomLayout::new();
        layout.add_overlap(1, 1);
        assert!(!layout.overlapping(1, 1));
        assert!(!layout.has_overlaps());
    }

    #[test]
    fn room_membership_is_looked_up_both_ways() {
        let mut layout = RoomLayout::new();
        layout.add_camera(10, 1);
        layout.add_camera(10, 2);

        assert_eq!(layout.cameras_in_room(10), &[1, 2]);
        assert_eq!(layout.room_of(2), Some(10));
        assert_eq!(layout.room_of(99), None);
    }

    #[test]
    fn adding_camera_twice_keeps_one_entry() {
        let mut layout = RoomLayout::new();
        layout.add_camera(10, 1);
        layout.add_camera(10, 1);
        assert_eq!(layout.cameras_in_room(10).len(), 1);
    }
}
