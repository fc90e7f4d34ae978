//! Global Person Entity
//!
//! Represents a physical person with a facility-wide identity, aggregated
//! across every camera that has observed them.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::value_objects::{
    AppearanceEmbedding, BoundingBox, ClothingHistogram, ColorFeatures, SkinTone,
};
use crate::domain::{CameraId, PersonId};

/// The most recent observation of a person on one camera.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedPosition {
    pub bbox: BoundingBox,
    pub seen_at: DateTime<Utc>,
}

/// A person with a stable global identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalPerson {
    id: PersonId,
    assigned_name: Option<String>,
    embedding: Option<AppearanceEmbedding>,
    embedding_quality: f32,
    clothing_hist: Option<ClothingHistogram>,
    skin_tone: Option<SkinTone>,
    color_samples: u32,
    avg_height_px: f32,
    avg_width_px: f32,
    dimension_samples: u32,
    cameras_visited: BTreeSet<CameraId>,
    current_positions: HashMap<CameraId, TrackedPosition>,
    first_seen_at: DateTime<Utc>,
    last_seen_at: DateTime<Utc>,
    total_appearances: u64,
    is_active: bool,
}

impl GlobalPerson {
    /// Creates a new person from their first observation.
    pub fn new(id: PersonId, camera_id: CameraId, bbox: BoundingBox, now: DateTime<Utc>) -> Self {
        let mut cameras_visited = BTreeSet::new();
        cameras_visited.insert(camera_id);

        let mut current_positions = HashMap::new();
        current_positions.insert(
            camera_id,
            TrackedPosition {
                bbox: bbox.clone(),
                seen_at: now,
            },
        );

        Self {
            id,
            assigned_name: None,
            embedding: None,
            embedding_quality: 0.0,
            clothing_hist: None,
            skin_tone: None,
            color_samples: 0,
            avg_height_px: bbox.height() as f32,
            avg_width_px: bbox.width() as f32,
            dimension_samples: 1,
            cameras_visited,
            current_positions,
            first_seen_at: now,
            last_seen_at: now,
            total_appearances: 1,
            is_active: true,
        }
    }

    /// Reconstructs a person from persisted fields.
    #[allow(clippy::too_many_arguments)]
    pub fn from_store(
        id: PersonId,
        assigned_name: Option<String>,
        embedding: Option<AppearanceEmbedding>,
        embedding_quality: f32,
        clothing_hist: Option<ClothingHistogram>,
        skin_tone: Option<SkinTone>,
        color_samples: u32,
        avg_height_px: f32,
        avg_width_px: f32,
        dimension_samples: u32,
        cameras_visited: BTreeSet<CameraId>,
        current_positions: HashMap<CameraId, TrackedPosition>,
        first_seen_at: DateTime<Utc>,
        last_seen_at: DateTime<Utc>,
        total_appearances: u64,
        is_active: bool,
    ) -> Self {
        Self {
            id,
            assigned_name,
            embedding,
            embedding_quality,
            clothing_hist,
            skin_tone,
            color_samples,
            avg_height_px,
            avg_width_px,
            dimension_samples,
            cameras_visited,
            current_positions,
            first_seen_at,
            last_seen_at,
            total_appearances,
            is_active,
        }
    }

    pub fn id(&self) -> PersonId {
        self.id
    }

    pub fn assigned_name(&self) -> Option<&str> {
        self.assigned_name.as_deref()
    }

    pub fn display_name(&self) -> String {
        self.assigned_name
            .clone()
            .unwrap_or_else(|| format!("Person #{}", self.id))
    }

    pub fn embedding(&self) -> Option<&AppearanceEmbedding> {
        self.embedding.as_ref()
    }

    pub fn embedding_quality(&self) -> f32 {
        self.embedding_quality
    }

    pub fn clothing_hist(&self) -> Option<&ClothingHistogram> {
        self.clothing_hist.as_ref()
    }

    pub fn skin_tone(&self) -> Option<&SkinTone> {
        self.skin_tone.as_ref()
    }

    pub fn color_samples(&self) -> u32 {
        self.color_samples
    }

    pub fn avg_height_px(&self) -> f32 {
        self.avg_height_px
    }

    pub fn avg_width_px(&self) -> f32 {
        self.avg_width_px
    }

    pub fn dimension_samples(&self) -> u32 {
        self.dimension_samples
    }

    pub fn cameras_visited(&self) -> &BTreeSet<CameraId> {
        &self.cameras_visited
    }

    pub fn current_positions(&self) -> &HashMap<CameraId, TrackedPosition> {
        &self.current_positions
    }

    pub fn first_seen_at(&self) -> DateTime<Utc> {
        self.first_seen_at
    }

    pub fn last_seen_at(&self) -> DateTime<Utc> {
        self.last_seen_at
    }

    pub fn total_appearances(&self) -> u64 {
        self.total_appearances
    }

    pub fn is_active(&self) -> bool {
        self.is_active
    }

    /// Records a new observation of this person on a camera: refreshes the
    /// live position, bumps the appearance counter, and folds the bbox size
    /// into the dimension running means.
    pub fn record_observation(
        &mut self,
        camera_id: CameraId,
        bbox: &BoundingBox,
        now: DateTime<Utc>,
    ) {
        self.current_positions.insert(
            camera_id,
            TrackedPosition {
                bbox: bbox.clone(),
                seen_at: now,
            },
        );
        self.cameras_visited.insert(camera_id);
        self.last_seen_at = now;
        self.total_appearances += 1;

        self.dimension_samples += 1;
        let n = self.dimension_samples as f32;
        self.avg_height_px += (bbox.height() as f32 - self.avg_height_px) / n;
        self.avg_width_px += (bbox.width() as f32 - self.avg_width_px) / n;
    }

    /// Folds observed color features into the stored ones with EMA weight
    /// `alpha`. First observation is taken verbatim.
    pub fn observe_color(&mut self, features: &ColorFeatures, alpha: f32) {
        if features.is_empty() {
            return;
        }

        if let Some(observed) = &features.clothing {
            match &mut self.clothing_hist {
                Some(stored) => stored.blend(observed, alpha),
                None => self.clothing_hist = Some(observed.clone()),
            }
        }

        if let Some(observed) = &features.skin {
            match &mut self.skin_tone {
                Some(stored) => stored.blend(observed, alpha),
                None => self.skin_tone = Some(*observed),
            }
        }

        self.color_samples += 1;
    }

    /// Stores a new appearance embedding if it improves on the current one
    /// by at least `quality_margin`. Returns true if the embedding changed.
    pub fn observe_embedding(
        &mut self,
        embedding: AppearanceEmbedding,
        quality: f32,
        quality_margin: f32,
    ) -> bool {
        let improves = match self.embedding {
            None => true,
            Some(_) => quality > self.embedding_quality + quality_margin,
        };

        if improves {
            self.embedding = Some(embedding);
            self.embedding_quality = quality;
        }

        improves
    }

    /// Combined color features for match scoring.
    pub fn color_features(&self) -> ColorFeatures {
        ColorFeatures::new(self.clothing_hist.clone(), self.skin_tone)
    }

    /// Similarity of the query bbox to the running-mean dimensions, in [0, 1].
    /// None until at least one dimension sample exists.
    pub fn dimension_similarity(&self, bbox: &BoundingBox) -> Option<f32> {
        if self.dimension_samples == 0 || self.avg_height_px <= 0.0 || self.avg_width_px <= 0.0 {
            return None;
        }

        let rel_h = (bbox.height() as f32 - self.avg_height_px).abs() / self.avg_height_px;
        let rel_w = (bbox.width() as f32 - self.avg_width_px).abs() / self.avg_width_px;
        Some((1.0 - rel_h.max(rel_w)).max(0.0))
    }

    /// Drops positions older than `ttl_seconds`.
    pub fn prune_stale_positions(&mut self, now: DateTime<Utc>, ttl_seconds: f64) {
        self.current_positions.retain(|_, position| {
            (now - position.seen_at).num_milliseconds() as f64 / 1000.0 <= ttl_seconds
        });
    }

    /// Positions observed within `ttl_seconds` of `now`, without mutating.
    pub fn fresh_positions(
        &self,
        now: DateTime<Utc>,
        ttl_seconds: f64,
    ) -> impl Iterator<Item = (CameraId, &TrackedPosition)> + '_ {
        self.current_positions.iter().filter_map(move |(camera_id, position)| {
            let age = (now - position.seen_at).num_milliseconds() as f64 / 1000.0;
            (age <= ttl_seconds).then_some((*camera_id, position))
        })
    }

    /// Clears live positions. Positions are not restored across restarts;
    /// they rebuild from fresh observations.
    pub fn clear_positions(&mut self) {
        self.current_positions.clear();
    }

    /// Marks the person inactive and clears live positions.
    pub fn mark_inactive(&mut self) {
        self.is_active = false;
        self.current_positions.clear();
    }

    /// Reactivates a previously timed-out person on a fresh observation.
    pub fn reactivate(&mut self, now: DateTime<Utc>) {
        self.is_active = true;
        self.last_seen_at = now;
    }

    /// Sets the assigned name. Used both for mint-time auto-naming and for
    /// explicit renames; callers enforce when each is allowed.
    pub fn set_name(&mut self, name: String) {
        self.assigned_name = Some(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bbox(w: i32, h: i32) -> BoundingBox {
        BoundingBox::new(0, 0, w, h)
    }

    fn person() -> GlobalPerson {
        GlobalPerson::new(1, 7, bbox(100, 300), Utc::now())
    }

    #[test]
    fn new_person_starts_active_with_one_appearance() {
        let p = person();
        assert!(p.is_active());
        assert_eq!(p.total_appearances(), 1);
        assert_eq!(p.cameras_visited().len(), 1);
        assert_eq!(p.dimension_samples(), 1);
    }

    #[test]
    fn record_observation_updates_running_means() {
        let mut p = person();
        p.record_observation(7, &bbox(200, 400), Utc::now());

        assert_eq!(p.dimension_samples(), 2);
        assert!((p.avg_width_px() - 150.0).abs() < 0.001);
        assert!((p.avg_height_px() - 350.0).abs() < 0.001);
        assert_eq!(p.total_appearances(), 2);
    }

    #[test]
    fn record_observation_tracks_new_cameras() {
        let mut p = person();
        p.record_observation(9, &bbox(100, 300), Utc::now());

        assert!(p.cameras_visited().contains(&7));
        assert!(p.cameras_visited().contains(&9));
        assert_eq!(p.current_positions().len(), 2);
    }

    #[test]
    fn observe_embedding_requires_quality_margin_to_replace() {
        let mut p = person();
        let e1 = AppearanceEmbedding::from_raw(vec![1.0; 512]).unwrap();
        let e2 = AppearanceEmbedding::from_raw(vec![2.0; 512]).unwrap();

        assert!(p.observe_embedding(e1, 0.5, 0.1));
        assert!(!p.observe_embedding(e2.clone(), 0.55, 0.1));
        assert!(p.observe_embedding(e2, 0.7, 0.1));
        assert!((p.embedding_quality() - 0.7).abs() < f32::EPSILON);
    }

    #[test]
    fn observe_color_counts_samples() {
        let mut p = person();
        let features = ColorFeatures::new(None, Some(SkinTone::new(10.0, 0.5, 0.5)));

        p.observe_color(&features, 0.3);
        p.observe_color(&features, 0.3);

        assert_eq!(p.color_samples(), 2);
        assert!(p.skin_tone().is_some());
    }

    #[test]
    fn observe_color_ignores_empty_features() {
        let mut p = person();
        p.observe_color(&ColorFeatures::default(), 0.3);
        assert_eq!(p.color_samples(), 0);
    }

    #[test]
    fn dimension_similarity_is_one_for_exact_match() {
        let p = person();
        let similarity = p.dimension_similarity(&bbox(100, 300)).unwrap();
        assert!((similarity - 1.0).abs() < 0.001);
    }

    #[test]
    fn dimension_similarity_drops_with_size_difference() {
        let p = person();
        let similarity = p.dimension_similarity(&bbox(150, 300)).unwrap();
        assert!((similarity - 0.5).abs() < 0.001);
    }

    #[test]
    fn prune_stale_positions_drops_old_entries() {
        let now = Utc::now();
        let mut p = GlobalPerson::new(1, 7, bbox(100, 300), now - chrono::Duration::seconds(60));
        p.record_observation(9, &bbox(100, 300), now);

        p.prune_stale_positions(now, 10.0);

        assert_eq!(p.current_positions().len(), 1);
        assert!(p.current_positions().contains_key(&9));
    }

    #[test]
    fn mark_inactive_clears_positions() {
        let mut p = person();
        p.mark_inactive();
        assert!(!p.is_active());
        assert!(p.current_positions().is_empty());
    }

    #[test]
    fn display_name_falls_back_to_id() {
        let mut p = person();
        assert_eq!(p.display_name(), "Person #1");
        p.set_name("Alex".to_string());
        assert_eq!(p.display_name(), "Alex");
    }
}
