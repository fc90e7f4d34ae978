//! Local Tracker
//!
//! Greedy IoU association of detections to per-camera tracks. Track ids are
//! camera-scoped and never reused within a tracker. Association tie-breaks
//! are deterministic: IoU descending, then track id ascending, then
//! detection order.

use tracing::debug;

use crate::domain::entities::{LocalTrack, PersonDetection};
use crate::domain::value_objects::BoundingBox;
use crate::domain::{CameraId, LocalTrackId};

/// Local tracker configuration.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Minimum IoU for a detection to associate with a track.
    pub iou_threshold: f32,
    /// Updates without association before a track dies.
    pub track_timeout_frames: u32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            iou_threshold: 0.3,
            track_timeout_frames: 30,
        }
    }
}

/// Result of one tracker update.
#[derive(Debug, Default)]
pub struct TrackerOutput {
    /// Tracks associated in this update, ready for identity resolution.
    pub tracks: Vec<LocalTrack>,
    /// Ids of tracks that aged out in this update.
    pub lost: Vec<LocalTrackId>,
}

struct TrackState {
    id: LocalTrackId,
    bbox: BoundingBox,
    confidence: f32,
    consecutive_frames: u32,
    frames_since_seen: u32,
}

/// IoU tracker for one camera.
pub struct LocalTracker {
    camera_id: CameraId,
    config: TrackerConfig,
    tracks: Vec<TrackState>,
    next_track_id: LocalTrackId,
}

impl LocalTracker {
    pub fn new(camera_id: CameraId, config: TrackerConfig) -> Self {
        Self {
            camera_id,
            config,
            tracks: Vec::new(),
            next_track_id: 1,
        }
    }

    pub fn camera_id(&self) -> CameraId {
        self.camera_id
    }

    /// Number of live tracks, matched or coasting.
    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }

    /// Advances tracker state with this frame's detections. Unassociated
    /// tracks coast without aging their `consecutive_frames`; they die after
    /// `track_timeout_frames` updates without a match.
    pub fn update(&mut self, detections: &[PersonDetection]) -> TrackerOutput {
        // Candidate pairs above the IoU floor, in deterministic order.
        let mut pairs: Vec<(f32, usize, usize)> = Vec::new();
        for (t, track) in self.tracks.iter().enumerate() {
            for (d, detection) in detections.iter().enumerate() {
                let iou = track.bbox.iou(detection.bounding_box());
                if iou >= self.config.iou_threshold {
                    pairs.push((iou, t, d));
                }
            }
        }
        pairs.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| self.tracks[a.1].id.cmp(&self.tracks[b.1].id))
                .then_with(|| a.2.cmp(&b.2))
        });

        let mut track_taken = vec![false; self.tracks.len()];
        let mut detection_taken = vec![false; detections.len()];
        let mut assignments: Vec<(usize, usize)> = Vec::new();

        for (_, t, d) in pairs {
            if track_taken[t] || detection_taken[d] {
                continue;
            }
            track_taken[t] = true;
            detection_taken[d] = true;
            assignments.push((t, d));
        }

        // Apply matches.
        let mut output_tracks = Vec::with_capacity(assignments.len());
        for (t, d) in assignments {
            let track = &mut self.tracks[t];
            let detection = &detections[d];
            track.bbox = detection.bounding_box().clone();
            track.confidence = detection.confidence();
            track.consecutive_frames += 1;
            track.frames_since_seen = 0;
            output_tracks.push(LocalTrack::new(
                track.id,
                track.bbox.clone(),
                track.confidence,
                track.consecutive_frames,
            ));
        }

        // Age unmatched tracks and collect the dead.
        let mut lost = Vec::new();
        let timeout = self.config.track_timeout_frames;
        for (t, track) in self.tracks.iter_mut().enumerate() {
            if !track_taken[t] {
                track.frames_since_seen += 1;
            }
        }
        self.tracks.retain(|track| {
            if track.frames_since_seen > timeout {
                lost.push(track.id);
                false
            } else {
                true
            }
        });

        // Mint tracks for unmatched detections.
        for (d, detection) in detections.iter().enumerate() {
            if detection_taken[d] {
                continue;
            }
            let id = self.next_track_id;
            self.next_track_id += 1;
            self.tracks.push(TrackState {
                id,
                bbox: detection.bounding_box().clone(),
                confidence: detection.confidence(),
                consecutive_frames: 1,
                frames_since_seen: 0,
            });
            output_tracks.push(LocalTrack::new(
                id,
                detection.bounding_box().clone(),
                detection.confidence(),
                1,
            ));
        }

        if !lost.is_empty() {
            debug!(
                "Camera {} lost {} track(s): {:?}",
                self.camera_id,
                lost.len(),
                lost
            );
        }

        output_tracks.sort_by_key(LocalTrack::local_track_id);
        TrackerOutput {
            tracks: output_tracks,
            lost,
        }
    }
}
