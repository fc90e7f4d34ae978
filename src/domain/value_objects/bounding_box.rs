//! Bounding Box Value Object
//!
//! Represents a rectangular region in an image.

use serde::{Deserialize, Serialize};

/// A bounding box defining a rectangular region in pixel coordinates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    x: i32,
    y: i32,
    width: i32,
    height: i32,
}

impl BoundingBox {
    /// Creates a new bounding box.
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self { x, y, width, height }
    }

    /// Creates a bounding box from corner coordinates.
    pub fn from_corners(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self {
            x: x1.min(x2),
            y: y1.min(y2),
            width: (x2 - x1).abs(),
            height: (y2 - y1).abs(),
        }
    }

    pub fn x(&self) -> i32 {
        self.x
    }

    pub fn y(&self) -> i32 {
        self.y
    }

    pub fn width(&self) -> i32 {
        self.width
    }

    pub fn height(&self) -> i32 {
        self.height
    }

    /// Returns the center point of the bounding box.
    pub fn center(&self) -> (i32, i32) {
        (self.x + self.width / 2, self.y + self.height / 2)
    }

    /// Euclidean distance between the centers of two boxes, in pixels.
    pub fn center_distance(&self, other: &BoundingBox) -> f32 {
        let (cx1, cy1) = self.center();
        let (cx2, cy2) = other.center();
        let dx = (cx1 - cx2) as f32;
        let dy = (cy1 - cy2) as f32;
        (dx * dx + dy * dy).sqrt()
    }

    /// Returns the area of the bounding box.
    pub fn area(&self) -> i32 {
        self.width * self.height
    }

    /// Returns the right edge x coordinate.
    pub fn right(&self) -> i32 {
        self.x + self.width
    }

    /// Returns the bottom edge y coordinate.
    pub fn bottom(&self) -> i32 {
        self.y + self.height
    }

    /// Calculates the intersection over union (IoU) with another bounding box.
    /// Used for frame-to-frame track association.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = self.right().min(other.right());
        let y2 = self.bottom().min(other.bottom());

        if x2 <= x1 || y2 <= y1 {
            return 0.0;
        }

        let intersection = (x2 - x1) * (y2 - y1);
        let union = self.area() + other.area() - intersection;

        if union == 0 {
            return 0.0;
        }

        intersection as f32 / union as f32
    }

    /// Converts to corner format [x1, y1, x2, y2].
    pub fn to_corners(&self) -> [i32; 4] {
        [self.x, self.y, self.right(), self.bottom()]
    }

    /// Clips the box to frame bounds, returning None if nothing remains.
    pub fn clipped_to(&self, frame_width: u32, frame_height: u32) -> Option<BoundingBox> {
        let x1 = self.x.max(0);
        let y1 = self.y.max(0);
        let x2 = self.right().min(frame_width as i32);
        let y2 = self.bottom().min(frame_height as i32);

        if x2 <= x1 || y2 <= y1 {
            return None;
        }

        Some(BoundingBox::from_corners(x1, y1, x2, y2))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn center_is_calculated_correctly() {
        let bbox = BoundingBox::new(10, 20, 100, 100);
        assert_eq!(bbox.center(), (60, 70));
    }

    #[test]
    fn area_is_calculated_correctly() {
        let bbox = BoundingBox::new(0, 0, 10, 20);
        assert_eq!(bbox.area(), 200);
    }

    #[test]
    fn iou_of_identical_boxes_is_one() {
        let b1 = BoundingBox::new(0, 0, 100, 100);
        let b2 = BoundingBox::new(0, 0, 100, 100);
        assert!((b1.iou(&b2) - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn iou_of_non_overlapping_is_zero() {
        let b1 = BoundingBox::new(0, 0, 100, 100);
        let b2 = BoundingBox::new(200, 200, 100, 100);
        assert!((b1.iou(&b2) - 0.0).abs() < f32::EPSILON);
    }

    #[test]
    fn corners_roundtrip_preserves_box() {
        let original = BoundingBox::new(10, 20, 30, 40);
        let [x1, y1, x2, y2] = original.to_corners();
        let restored = BoundingBox::from_corners(x1, y1, x2, y2);
        assert_eq!(original, restored);
    }

    #[test]
    fn center_distance_of_identical_boxes_is_zero() {
        let bbox = BoundingBox::new(50, 50, 80, 200);
        assert!(bbox.center_distance(&bbox) < f32::EPSILON);
    }

    #[test]
    fn clipping_outside_frame_returns_none() {
        let bbox = BoundingBox::new(700, 500, 100, 100);
        assert!(bbox.clipped_to(640, 480).is_none());
    }

    #[test]
    fn clipping_partial_overlap_shrinks_box() {
        let bbox = BoundingBox::new(600, 400, 100, 100);
        let clipped = bbox.clipped_to(640, 480).unwrap();
        assert_eq!(clipped.width(), 40);
        assert_eq!(clipped.height(), 80);
    }
}
