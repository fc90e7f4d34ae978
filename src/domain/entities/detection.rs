//! Detection Entity
//!
//! A single person detection in one video frame.

use serde::{Deserialize, Serialize};

use crate::domain::value_objects::BoundingBox;

/// A person detected in a frame, before any track association.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonDetection {
    bounding_box: BoundingBox,
    confidence: f32,
}

impl PersonDetection {
    /// Creates a new detection result.
    pub fn new(bounding_box: BoundingBox, confidence: f32) -> Self {
        Self {
            bounding_box,
            confidence,
        }
    }

    pub fn bounding_box(&self) -> &BoundingBox {
        &self.bounding_box
    }

    pub fn confidence(&self) -> f32 {
        self.confidence
    }
}
