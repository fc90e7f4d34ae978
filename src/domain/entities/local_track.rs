//! Local Track Entity
//!
//! A per-camera track of one person across consecutive frames. Track ids
//! are unique within a camera and carry no meaning across cameras.

use serde::{Deserialize, Serialize};

use crate::domain::value_objects::BoundingBox;
use crate::domain::LocalTrackId;

/// The live state of a local track after an update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalTrack {
    local_track_id: LocalTrackId,
    bounding_box: BoundingBox,
    confidence: f32,
    consecutive_frames: u32,
}

impl LocalTrack {
    pub fn new(
        local_track_id: LocalTrackId,
        bounding_box: BoundingBox,
        confidence: f32,
        consecutive_frames: u32,
    ) -> Self {
        Self {
            local_track_id,
            bounding_box,
            confidence,
            consecutive_frames,
        }
    }

    pub fn local_track_id(&self) -> LocalTrackId {
        self.local_track_id
    }

    pub fn bounding_box(&self) -> &BoundingBox {
        &self.bounding_box
    }

    pub fn confidence(&self) -> f32 {
        self.confidence
    }

    pub fn consecutive_frames(&self) -> u32 {
        self.consecutive_frames
    }

    /// Whether this track has been associated for enough consecutive frames
    /// to take part in global matching.
    pub fn is_stable(&self, stable_threshold: u32) -> bool {
        self.consecutive_frames >= stable_threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stability_respects_threshold() {
        let track = LocalTrack::new(1, BoundingBox::new(0, 0, 50, 120), 0.9, 2);
        assert!(!track.is_stable(3));
        assert!(track.is_stable(2));
    }
}
