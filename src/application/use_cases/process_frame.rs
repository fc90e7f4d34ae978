//! Process Frame Use Case
//!
//! Drives one camera frame's tracker output through the identity engine:
//! lost tracks release their bindings, live tracks resolve to identities.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::application::services::{
    IdentityEngine, ObservationFeatures, TrackIdentity, TrackObservation,
};
use crate::domain::entities::LocalTrack;
use crate::domain::{CameraId, LocalTrackId};

/// Tracker output of one camera frame, paired with per-track feature
/// providers.
pub struct TrackBatch<'a> {
    pub camera_id: CameraId,
    pub observed_at: DateTime<Utc>,
    pub tracks: Vec<(LocalTrack, &'a dyn ObservationFeatures)>,
    pub lost_tracks: Vec<LocalTrackId>,
}

/// Result of processing a frame.
#[derive(Debug, Default)]
pub struct ProcessFrameResult {
    /// Identity resolved for each live track, in input order.
    pub identities: Vec<(LocalTrackId, TrackIdentity)>,
    /// Number of bindings released for lost tracks.
    pub released: usize,
}

/// Use case for feeding tracker output into the identity engine.
pub struct ProcessFrameUseCase {
    engine: Arc<IdentityEngine>,
}

impl ProcessFrameUseCase {
    pub fn new(engine: Arc<IdentityEngine>) -> Self {
        Self { engine }
    }

    /// Processes one frame's tracks. Lost tracks are released first so a
    /// person re-entering on a new track id can rebind immediately.
    pub async fn execute(&self, batch: TrackBatch<'_>) -> ProcessFrameResult {
        let released = batch.lost_tracks.len();
        for track_id in &batch.lost_tracks {
            self.engine.release_track(batch.camera_id, *track_id).await;
        }

        let mut identities = Vec::with_capacity(batch.tracks.len());
        for (track, features) in &batch.tracks {
            let observation = TrackObservation {
                camera_id: batch.camera_id,
                local_track_id: track.local_track_id(),
                bounding_box: track.bounding_box().clone(),
                confidence: track.confidence(),
                consecutive_frames: track.consecutive_frames(),
                observed_at: batch.observed_at,
            };
            let identity = self.engine.resolve(observation, *features).await;
            identities.push((track.local_track_id(), identity));
        }

        ProcessFrameResult {
            identities,
            released,
        }
    }
}

impl TrackBatch<'_> {
    /// A batch with no tracks, used when the detector yields nothing.
    pub fn empty(camera_id: CameraId, lost_tracks: Vec<LocalTrackId>) -> Self {
        TrackBatch {
            camera_id,
            observed_at: Utc::now(),
            tracks: Vec::new(),
            lost_tracks,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::services::{EngineConfig, EventBus, NoFeatures};
    use crate::domain::entities::RoomLayout;
    use crate::domain::value_objects::BoundingBox;
    use crate::infrastructure::database::InMemoryPersonRepository;

    fn use_case() -> ProcessFrameUseCase {
        let mut config = EngineConfig::default();
        config.auto_naming = false;
        let engine = Arc::new(IdentityEngine::new(
            Arc::new(InMemoryPersonRepository::new()),
            RoomLayout::new(),
            Arc::new(EventBus::new()),
            config,
        ));
        ProcessFrameUseCase::new(engine)
    }

    fn track(id: LocalTrackId, age: u32) -> LocalTrack {
        LocalTrack::new(id, BoundingBox::new(100, 100, 100, 300), 0.9, age)
    }

    #[tokio::test]
    async fn stable_tracks_resolve_to_persons() {
        let use_case = use_case();
        let batch = TrackBatch {
            camera_id: 1,
            observed_at: Utc::now(),
            tracks: vec![(track(1, 3), &NoFeatures as &dyn ObservationFeatures)],
            lost_tracks: vec![],
        };

        let result = use_case.execute(batch).await;

        assert_eq!(result.identities.len(), 1);
        assert_eq!(result.identities[0].1.person_id(), Some(1));
    }

    #[tokio::test]
    async fn unstable_tracks_stay_provisional() {
        let use_case = use_case();
        let batch = TrackBatch {
            camera_id: 1,
            observed_at: Utc::now(),
            tracks: vec![(track(1, 1), &NoFeatures as &dyn ObservationFeatures)],
            lost_tracks: vec![],
        };

        let result = use_case.execute(batch).await;

        assert_eq!(result.identities[0].1.person_id(), None);
    }

    #[tokio::test]
    async fn lost_tracks_are_released() {
        let use_case = use_case();

        let first = TrackBatch {
            camera_id: 1,
            observed_at: Utc::now(),
            tracks: vec![(track(1, 3), &NoFeatures as &dyn ObservationFeatures)],
            lost_tracks: vec![],
        };
        use_case.execute(first).await;

        let second = TrackBatch::empty(1, vec![1]);
        let result = use_case.execute(second).await;
        assert_eq!(result.released, 1);
    }
}
