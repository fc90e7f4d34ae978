//! Global Identity Engine
//!
//! The cross-camera matcher and active gallery. Ingests stable local tracks,
//! matches them against known persons through staged spatial, dimension,
//! color, and appearance matching, and mints new global identities when no
//! stage matches. All gallery mutations happen behind one exclusive lock.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::application::services::{EventBus, IndexHit, NamePool, VectorIndex};
use crate::domain::entities::{GlobalPerson, RoomLayout};
use crate::domain::events::{
    DomainEvent, MatchStage, PersonCreatedEvent, PersonDeactivatedEvent, PersonIdentifiedEvent,
    PersonRenamedEvent,
};
use crate::domain::repositories::{EngineCheckpoint, PersonRepository, RepoResult};
use crate::domain::value_objects::{
    color_match_score, AppearanceEmbedding, BoundingBox, ColorFeatures,
};
use crate::domain::{CameraId, LocalTrackId, PersonId};

/// How many candidates the appearance stages consider.
const APPEARANCE_TOP_K: usize = 5;

/// Matcher thresholds and lifecycle timings for the identity engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Minimum consecutive frames before a track takes part in matching.
    pub stable_threshold: u32,
    /// Appearance-match acceptance threshold on cosine similarity.
    pub appearance_threshold: f32,
    /// Relative size tolerance for dimension candidates.
    pub dimension_tolerance: f32,
    /// Dimension-only acceptance score.
    pub dimension_threshold: f32,
    /// Combined color score acceptance threshold.
    pub color_threshold: f32,
    pub clothing_weight: f32,
    pub skin_weight: f32,
    /// EMA weight for folding new color observations into stored features.
    pub color_ema_alpha: f32,
    /// Scale of the skin tone Gaussian in HSV distance units.
    pub skin_sigma: f32,
    /// A replacement embedding must beat the stored quality by this margin.
    pub embedding_quality_margin: f32,
    /// Seconds without a sighting before a person leaves the active gallery.
    pub person_timeout_s: f64,
    pub cleanup_interval_s: f64,
    pub db_sync_interval_s: f64,
    /// Bound on individual persistent-store operations.
    pub db_op_timeout_s: f64,
    /// Seconds before a per-camera position is considered stale.
    pub position_ttl_s: f64,
    /// Color features refresh at most every K sightings of a bound track.
    pub color_refresh_every_k_frames: u64,
    /// Center distance tolerance for the spatial co-observation stage.
    pub spatial_tolerance_px: f32,
    /// Assign pool names to newly minted persons.
    pub auto_naming: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            stable_threshold: 3,
            appearance_threshold: 0.5,
            dimension_tolerance: 0.10,
            dimension_threshold: 0.9,
            color_threshold: 0.7,
            clothing_weight: 0.6,
            skin_weight: 0.4,
            color_ema_alpha: 0.3,
            skin_sigma: 30.0,
            embedding_quality_margin: 0.05,
            person_timeout_s: 30.0,
            cleanup_interval_s: 60.0,
            db_sync_interval_s: 5.0,
            db_op_timeout_s: 2.0,
            position_ttl_s: 10.0,
            color_refresh_every_k_frames: 10,
            spatial_tolerance_px: 120.0,
            auto_naming: true,
        }
    }
}

/// Engine error types.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Person not found: {0}")]
    NotFound(PersonId),
}

/// One stable-track observation handed to the engine.
#[derive(Debug, Clone)]
pub struct TrackObservation {
    pub camera_id: CameraId,
    pub local_track_id: LocalTrackId,
    pub bounding_box: BoundingBox,
    pub confidence: f32,
    pub consecutive_frames: u32,
    pub observed_at: DateTime<Utc>,
}

/// Lazy feature provider for one observation. The engine pulls appearance
/// and color features only when its trigger policy calls for them, so GPU
/// work is skipped for already-bound or unstable tracks.
#[async_trait]
pub trait ObservationFeatures: Send + Sync {
    /// Appearance embedding and its quality proxy, if extraction succeeds.
    async fn appearance(&self) -> Option<(AppearanceEmbedding, f32)>;

    /// Clothing histogram and skin tone, if extraction succeeds.
    async fn color(&self) -> Option<ColorFeatures>;
}

/// Feature provider for observations where extraction is unavailable.
pub struct NoFeatures;

#[async_trait]
impl ObservationFeatures for NoFeatures {
    async fn appearance(&self) -> Option<(AppearanceEmbedding, f32)> {
        None
    }

    async fn color(&self) -> Option<ColorFeatures> {
        None
    }
}

/// The identity a track resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackIdentity {
    /// A stable global identity.
    Person(PersonId),
    /// Placeholder for a track below the stability gate. Never persisted.
    Provisional {
        camera_id: CameraId,
        local_track_id: LocalTrackId,
    },
}

impl TrackIdentity {
    pub fn person_id(&self) -> Option<PersonId> {
        match self {
            TrackIdentity::Person(id) => Some(*id),
            TrackIdentity::Provisional { .. } => None,
        }
    }
}

#[derive(Default)]
struct EngineState {
    persons: HashMap<PersonId, GlobalPerson>,
    bindings: HashMap<(CameraId, LocalTrackId), PersonId>,
    next_global_id: PersonId,
    next_name_index: u32,
    dirty: HashSet<PersonId>,
}

impl EngineState {
    /// Persons currently bound to a live track on the given camera, except
    /// through the given track. A person cannot be two simultaneous tracks
    /// on one camera, so these are excluded from same-camera matching.
    fn bound_elsewhere_on_camera(
        &self,
        camera_id: CameraId,
        local_track_id: LocalTrackId,
    ) -> HashSet<PersonId> {
        self.bindings
            .iter()
            .filter(|((camera, track), _)| *camera == camera_id && *track != local_track_id)
            .map(|(_, person_id)| *person_id)
            .collect()
    }
}

/// The outcome of the staged matcher.
struct StageMatch {
    person_id: PersonId,
    stage: MatchStage,
    similarity: Option<f32>,
}

/// The global person identity engine.
pub struct IdentityEngine {
    state: RwLock<EngineState>,
    index: VectorIndex,
    repo: Arc<dyn PersonRepository>,
    layout: RoomLayout,
    names: NamePool,
    event_bus: Arc<EventBus>,
    config: EngineConfig,
}

impl IdentityEngine {
    /// Creates an engine with an empty gallery. Call [`Self::bootstrap`] to
    /// backfill from the persistent store.
    pub fn new(
        repo: Arc<dyn PersonRepository>,
        layout: RoomLayout,
        event_bus: Arc<EventBus>,
        config: EngineConfig,
    ) -> Self {
        Self {
            state: RwLock::new(EngineState {
                next_global_id: 1,
                ..Default::default()
            }),
            index: VectorIndex::new(),
            repo,
            layout,
            names: NamePool::default(),
            event_bus,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Loads active persons and the engine checkpoint from the store.
    /// Live positions are not restored. Returns the gallery size.
    pub async fn bootstrap(&self) -> RepoResult<usize> {
        let checkpoint = self.repo.load_checkpoint().await?.unwrap_or_default();
        let max_id = self.repo.max_person_id().await?.unwrap_or(0);
        let persons = self.repo.load_active_gallery().await?;

        let mut state = self.state.write().await;
        state.next_global_id = checkpoint.next_global_id.max(max_id + 1);
        state.next_name_index = checkpoint.next_name_index;

        let count = persons.len();
        for mut person in persons {
            person.clear_positions();
            if let Some(embedding) = person.embedding() {
                self.index.add(person.id(), embedding.clone()).await;
            }
            state.persons.insert(person.id(), person);
        }

        info!("Gallery backfill loaded {} active persons", count);
        Ok(count)
    }

    /// Resolves one track observation to an identity. Never fails: errors in
    /// feature extraction or the store degrade to the remaining stages, and
    /// an unmatched stable track always mints a new identity.
    pub async fn resolve(
        &self,
        observation: TrackObservation,
        features: &dyn ObservationFeatures,
    ) -> TrackIdentity {
        let now = observation.observed_at;

        // Binding fast path: the track already has an identity.
        if let Some(identity) = self.resolve_bound(&observation, features).await {
            return identity;
        }

        // Stability gate: too young to match globally.
        if observation.consecutive_frames < self.config.stable_threshold {
            return TrackIdentity::Provisional {
                camera_id: observation.camera_id,
                local_track_id: observation.local_track_id,
            };
        }

        // Candidate extraction, outside the gallery lock.
        let appearance = features.appearance().await;
        let color = features.color().await;

        let appearance_hits = match &appearance {
            Some((embedding, _)) => {
                self.index
                    .search(embedding, APPEARANCE_TOP_K, self.config.appearance_threshold)
                    .await
            }
            None => Vec::new(),
        };

        // Staged matching against the active gallery.
        {
            let mut state = self.state.write().await;
            if let Some(matched) = self.match_active(
                &state,
                &observation,
                appearance.as_ref(),
                color.as_ref(),
                &appearance_hits,
                now,
            ) {
                let person_id = matched.person_id;
                self.apply_match(&mut state, matched, &observation, &appearance, &color, now)
                    .await;
                return TrackIdentity::Person(person_id);
            }

            if appearance.is_none() {
                let person_id = self
                    .mint_person(&mut state, &observation, appearance, color, now)
                    .await;
                return TrackIdentity::Person(person_id);
            }
        }

        // No active match but an embedding exists: the person may be in the
        // store from a prior run. The gallery lock is released around the
        // store round-trip.
        let recalled = self.cold_read(appearance.as_ref()).await;

        let mut state = self.state.write().await;

        // A concurrent resolve may have minted or hydrated a matching person
        // while the lock was released.
        if let Some((embedding, _)) = &appearance {
            let hits = self
                .index
                .search(embedding, APPEARANCE_TOP_K, self.config.appearance_threshold)
                .await;
            if let Some(hit) = first_active_hit(&state, &hits) {
                let matched = StageMatch {
                    person_id: hit.person_id,
                    stage: MatchStage::Appearance,
                    similarity: Some(hit.similarity),
                };
                let person_id = matched.person_id;
                self.apply_match(&mut state, matched, &observation, &appearance, &color, now)
                    .await;
                return TrackIdentity::Person(person_id);
            }
        }

        if let Some((person, similarity)) = recalled {
            let person_id = person.id();
            if !state.persons.contains_key(&person_id) {
                state.persons.insert(person_id, person);
            }
            if let Some(person) = state.persons.get_mut(&person_id) {
                person.reactivate(now);
            }
            let matched = StageMatch {
                person_id,
                stage: MatchStage::StoreRecall,
                similarity: Some(similarity),
            };
            self.apply_match(&mut state, matched, &observation, &appearance, &color, now)
                .await;
            debug!("Recalled person {} from store (sim {:.3})", person_id, similarity);
            return TrackIdentity::Person(person_id);
        }

        let person_id = self
            .mint_person(&mut state, &observation, appearance, color, now)
            .await;
        TrackIdentity::Person(person_id)
    }

    /// Fast path for tracks that already carry a binding. Refreshes live
    /// state and, on the configured cadence, color features and a missing
    /// embedding.
    async fn resolve_bound(
        &self,
        observation: &TrackObservation,
        features: &dyn ObservationFeatures,
    ) -> Option<TrackIdentity> {
        let key = (observation.camera_id, observation.local_track_id);
        let now = observation.observed_at;

        let (person_id, refresh_color, backfill_embedding) = {
            let mut state = self.state.write().await;
            let person_id = match state.bindings.get(&key) {
                Some(person_id) => *person_id,
                None => return None,
            };

            match state.persons.get_mut(&person_id) {
                Some(person) => {
                    person.record_observation(observation.camera_id, &observation.bounding_box, now);
                    let on_cadence = person.total_appearances()
                        % self.config.color_refresh_every_k_frames
                        == 0;
                    let backfill = on_cadence && person.embedding().is_none();
                    state.dirty.insert(person_id);
                    (person_id, on_cadence, backfill)
                }
                None => {
                    // Inconsistent binding: fatal for this track only.
                    warn!(
                        "Binding for camera {} track {} points at missing person {}; dropping",
                        observation.camera_id, observation.local_track_id, person_id
                    );
                    state.bindings.remove(&key);
                    return None;
                }
            }
        };

        if refresh_color || backfill_embedding {
            let color = if refresh_color {
                features.color().await
            } else {
                None
            };
            let appearance = if backfill_embedding {
                features.appearance().await
            } else {
                None
            };

            let mut state = self.state.write().await;
            let mut indexed = None;
            if let Some(person) = state.persons.get_mut(&person_id) {
                if let Some(color) = color {
                    person.observe_color(&color, self.config.color_ema_alpha);
                }
                if let Some((embedding, quality)) = appearance {
                    if person.observe_embedding(
                        embedding.clone(),
                        quality,
                        self.config.embedding_quality_margin,
                    ) && person.is_active()
                    {
                        indexed = Some(embedding);
                    }
                }
                state.dirty.insert(person_id);
            }
            if let Some(embedding) = indexed {
                self.index.add(person_id, embedding).await;
            }
        }

        Some(TrackIdentity::Person(person_id))
    }

    /// Runs the fixed-priority matching stages against the active gallery.
    /// The first stage that produces a match wins.
    fn match_active(
        &self,
        state: &EngineState,
        observation: &TrackObservation,
        appearance: Option<&(AppearanceEmbedding, f32)>,
        color: Option<&ColorFeatures>,
        appearance_hits: &[IndexHit],
        now: DateTime<Utc>,
    ) -> Option<StageMatch> {
        let excluded =
            state.bound_elsewhere_on_camera(observation.camera_id, observation.local_track_id);

        // a. Spatial co-observation on an overlapping camera.
        if self.layout.has_overlaps() {
            let mut best: Option<(f32, PersonId)> = None;
            for (id, person) in state.persons.iter() {
                if !person.is_active() || excluded.contains(id) {
                    continue;
                }
                for (camera, position) in person.fresh_positions(now, self.config.position_ttl_s) {
                    if camera == observation.camera_id
                        || !self.layout.overlapping(camera, observation.camera_id)
                    {
                        continue;
                    }
                    let distance = position.bbox.center_distance(&observation.bounding_box);
                    if distance > self.config.spatial_tolerance_px {
                        continue;
                    }
                    let better = match best {
                        None => true,
                        Some((best_distance, best_id)) => {
                            distance < best_distance
                                || (distance == best_distance && *id < best_id)
                        }
                    };
                    if better {
                        best = Some((distance, *id));
                    }
                }
            }
            if let Some((_, person_id)) = best {
                return Some(StageMatch {
                    person_id,
                    stage: MatchStage::Spatial,
                    similarity: None,
                });
            }
        }

        // b. Dimension match, decisive only while no embedding is available.
        if appearance.is_none() {
            let floor = self
                .config
                .dimension_threshold
                .max(1.0 - self.config.dimension_tolerance);
            let mut best: Option<(f32, PersonId)> = None;
            for (id, person) in state.persons.iter() {
                if !person.is_active() || excluded.contains(id) {
                    continue;
                }
                let Some(score) = person.dimension_similarity(&observation.bounding_box) else {
                    continue;
                };
                if score < floor {
                    continue;
                }
                let better = match best {
                    None => true,
                    Some((best_score, best_id)) => {
                        score > best_score || (score == best_score && *id < best_id)
                    }
                };
                if better {
                    best = Some((score, *id));
                }
            }
            if let Some((score, person_id)) = best {
                return Some(StageMatch {
                    person_id,
                    stage: MatchStage::Dimension,
                    similarity: Some(score),
                });
            }
        }

        // c. Color match.
        if let Some(color) = color {
            if !color.is_empty() {
                let mut best: Option<(f32, PersonId)> = None;
                for (id, person) in state.persons.iter() {
                    if !person.is_active() || excluded.contains(id) {
                        continue;
                    }
                    let Some(score) = color_match_score(
                        color,
                        &person.color_features(),
                        self.config.clothing_weight,
                        self.config.skin_weight,
                        self.config.skin_sigma,
                    ) else {
                        continue;
                    };
                    if score < self.config.color_threshold {
                        continue;
                    }
                    let better = match best {
                        None => true,
                        Some((best_score, best_id)) => {
                            score > best_score || (score == best_score && *id < best_id)
                        }
                    };
                    if better {
                        best = Some((score, *id));
                    }
                }
                if let Some((score, person_id)) = best {
                    return Some(StageMatch {
                        person_id,
                        stage: MatchStage::Color,
                        similarity: Some(score),
                    });
                }
            }
        }

        // d. Deep appearance match.
        if let Some(hit) = appearance_hits
            .iter()
            .find(|hit| {
                !excluded.contains(&hit.person_id)
                    && state
                        .persons
                        .get(&hit.person_id)
                        .is_some_and(GlobalPerson::is_active)
            })
        {
            return Some(StageMatch {
                person_id: hit.person_id,
                stage: MatchStage::Appearance,
                similarity: Some(hit.similarity),
            });
        }

        None
    }

    /// Applies a successful match: binds the track, folds the observation
    /// into the person, and publishes the identification event.
    async fn apply_match(
        &self,
        state: &mut EngineState,
        matched: StageMatch,
        observation: &TrackObservation,
        appearance: &Option<(AppearanceEmbedding, f32)>,
        color: &Option<ColorFeatures>,
        now: DateTime<Utc>,
    ) {
        let person_id = matched.person_id;
        let mut indexed = None;
        let mut assigned_name = None;

        if let Some(person) = state.persons.get_mut(&person_id) {
            if !person.is_active() {
                person.reactivate(now);
            }
            person.record_observation(observation.camera_id, &observation.bounding_box, now);

            if let Some(color) = color {
                person.observe_color(color, self.config.color_ema_alpha);
            }
            if let Some((embedding, quality)) = appearance {
                if person.observe_embedding(
                    embedding.clone(),
                    *quality,
                    self.config.embedding_quality_margin,
                ) {
                    indexed = Some(embedding.clone());
                }
            }

            // A reactivated person's embedding re-enters the index even when
            // this observation did not improve it.
            if indexed.is_none() {
                if let Some(embedding) = person.embedding() {
                    indexed = Some(embedding.clone());
                }
            }

            assigned_name = person.assigned_name().map(String::from);
        }

        if let Some(embedding) = indexed {
            self.index.add(person_id, embedding).await;
        }

        state
            .bindings
            .insert((observation.camera_id, observation.local_track_id), person_id);
        state.dirty.insert(person_id);

        debug!(
            "Camera {} track {} identified as person {} via {:?} (conf {:.2})",
            observation.camera_id,
            observation.local_track_id,
            person_id,
            matched.stage,
            observation.confidence
        );

        self.event_bus
            .publish(DomainEvent::PersonIdentified(PersonIdentifiedEvent {
                person_id,
                assigned_name,
                camera_id: observation.camera_id,
                bounding_box: observation.bounding_box.clone(),
                stage: matched.stage,
                similarity: matched.similarity,
                timestamp: now,
            }));
    }

    /// Mints a new global identity from the current observation.
    async fn mint_person(
        &self,
        state: &mut EngineState,
        observation: &TrackObservation,
        appearance: Option<(AppearanceEmbedding, f32)>,
        color: Option<ColorFeatures>,
        now: DateTime<Utc>,
    ) -> PersonId {
        let person_id = state.next_global_id;
        state.next_global_id += 1;

        let mut person = GlobalPerson::new(
            person_id,
            observation.camera_id,
            observation.bounding_box.clone(),
            now,
        );

        if let Some((embedding, quality)) = appearance {
            person.observe_embedding(embedding.clone(), quality, 0.0);
            self.index.add(person_id, embedding).await;
        }
        if let Some(color) = color {
            person.observe_color(&color, self.config.color_ema_alpha);
        }

        if self.config.auto_naming {
            let name = self.names.name_at(state.next_name_index);
            state.next_name_index += 1;
            person.set_name(name);
        }

        let assigned_name = person.assigned_name().map(String::from);
        state.persons.insert(person_id, person);
        state
            .bindings
            .insert((observation.camera_id, observation.local_track_id), person_id);
        state.dirty.insert(person_id);

        info!(
            "Minted person {} for camera {} track {}",
            person_id, observation.camera_id, observation.local_track_id
        );

        self.event_bus
            .publish(DomainEvent::PersonCreated(PersonCreatedEvent {
                person_id,
                assigned_name,
                camera_id: observation.camera_id,
                bounding_box: observation.bounding_box.clone(),
                timestamp: now,
            }));

        person_id
    }

    /// Ranks stored persons against the query embedding with a bounded
    /// timeout. Store failures degrade to no recall.
    async fn cold_read(
        &self,
        appearance: Option<&(AppearanceEmbedding, f32)>,
    ) -> Option<(GlobalPerson, f32)> {
        let (embedding, _) = appearance?;
        let timeout = Duration::from_secs_f64(self.config.db_op_timeout_s);

        let hits = match tokio::time::timeout(
            timeout,
            self.repo.search_by_embedding(embedding, APPEARANCE_TOP_K),
        )
        .await
        {
            Ok(Ok(hits)) => hits,
            Ok(Err(e)) => {
                warn!("Cold-read query failed: {}", e);
                return None;
            }
            Err(_) => {
                warn!("Cold-read query timed out");
                return None;
            }
        };

        hits.into_iter()
            .next()
            .filter(|(_, similarity)| *similarity >= self.config.appearance_threshold)
    }

    /// Removes the binding of a lost local track.
    pub async fn release_track(&self, camera_id: CameraId, local_track_id: LocalTrackId) {
        let mut state = self.state.write().await;
        if state.bindings.remove(&(camera_id, local_track_id)).is_some() {
            debug!("Released binding of camera {} track {}", camera_id, local_track_id);
        }
    }

    /// Renames a person. Reaches into the store for persons not currently in
    /// the active gallery; the change is durable at the next sync.
    pub async fn rename(&self, person_id: PersonId, name: String) -> Result<(), EngineError> {
        {
            let mut state = self.state.write().await;
            if let Some(person) = state.persons.get_mut(&person_id) {
                person.set_name(name.clone());
                state.dirty.insert(person_id);
                self.publish_renamed(person_id, name);
                return Ok(());
            }
        }

        let stored = match self.repo.find_by_id(person_id).await {
            Ok(found) => found,
            Err(e) => {
                warn!("Rename lookup for person {} failed: {}", person_id, e);
                None
            }
        };

        match stored {
            Some(mut person) => {
                person.set_name(name.clone());
                let mut state = self.state.write().await;
                state.persons.insert(person_id, person);
                state.dirty.insert(person_id);
                self.publish_renamed(person_id, name);
                Ok(())
            }
            None => Err(EngineError::NotFound(person_id)),
        }
    }

    fn publish_renamed(&self, person_id: PersonId, name: String) {
        self.event_bus
            .publish(DomainEvent::PersonRenamed(PersonRenamedEvent {
                person_id,
                name,
                timestamp: Utc::now(),
            }));
    }

    /// Deactivates persons not seen within `person_timeout`. Inactive
    /// persons already synced to the store are dropped from memory; the
    /// cold-read path re-hydrates them on a later match. Returns the number
    /// of persons deactivated.
    pub async fn cleanup_at(&self, now: DateTime<Utc>) -> usize {
        let mut state = self.state.write().await;

        let timed_out: Vec<PersonId> = state
            .persons
            .values()
            .filter(|person| {
                person.is_active()
                    && (now - person.last_seen_at()).num_milliseconds() as f64 / 1000.0
                        > self.config.person_timeout_s
            })
            .map(GlobalPerson::id)
            .collect();

        for person_id in &timed_out {
            if let Some(person) = state.persons.get_mut(person_id) {
                let last_seen_at = person.last_seen_at();
                person.mark_inactive();
                self.index.remove(*person_id).await;
                state.dirty.insert(*person_id);
                self.event_bus
                    .publish(DomainEvent::PersonDeactivated(PersonDeactivatedEvent {
                        person_id: *person_id,
                        last_seen_at,
                        timestamp: now,
                    }));
            }
        }

        let bound: HashSet<PersonId> = state.bindings.values().copied().collect();
        let dirty = state.dirty.clone();
        state
            .persons
            .retain(|id, person| person.is_active() || dirty.contains(id) || bound.contains(id));

        if !timed_out.is_empty() {
            info!("Cleanup deactivated {} persons", timed_out.len());
        }
        timed_out.len()
    }

    /// Periodic cleanup entry point.
    pub async fn cleanup_tick(&self) -> usize {
        self.cleanup_at(Utc::now()).await
    }

    /// Takes the persons mutated since the last drain, together with the
    /// checkpoint to persist with them. Returns None when nothing changed.
    pub async fn drain_dirty(&self) -> Option<(Vec<GlobalPerson>, EngineCheckpoint)> {
        let mut state = self.state.write().await;
        if state.dirty.is_empty() {
            return None;
        }

        let persons: Vec<GlobalPerson> = state
            .dirty
            .iter()
            .filter_map(|id| state.persons.get(id).cloned())
            .collect();
        state.dirty.clear();

        Some((
            persons,
            EngineCheckpoint {
                next_global_id: state.next_global_id,
                next_name_index: state.next_name_index,
            },
        ))
    }

    /// Re-marks persons dirty after a failed sync so the next tick retries.
    pub async fn remark_dirty(&self, ids: impl IntoIterator<Item = PersonId>) {
        let mut state = self.state.write().await;
        state.dirty.extend(ids);
    }

    /// Clones the requested person, with stale positions pruned.
    pub async fn snapshot_person(&self, person_id: PersonId) -> Option<GlobalPerson> {
        let state = self.state.read().await;
        let mut person = state.persons.get(&person_id)?.clone();
        person.prune_stale_positions(Utc::now(), self.config.position_ttl_s);
        Some(person)
    }

    /// Clones all active persons, with stale positions pruned.
    pub async fn active_snapshot(&self) -> Vec<GlobalPerson> {
        let now = Utc::now();
        let state = self.state.read().await;
        state
            .persons
            .values()
            .filter(|person| person.is_active())
            .map(|person| {
                let mut person = person.clone();
                person.prune_stale_positions(now, self.config.position_ttl_s);
                person
            })
            .collect()
    }

    /// Number of persons in the active gallery.
    pub async fn active_count(&self) -> usize {
        let state = self.state.read().await;
        state
            .persons
            .values()
            .filter(|person| person.is_active())
            .count()
    }
}

fn first_active_hit<'a>(state: &EngineState, hits: &'a [IndexHit]) -> Option<&'a IndexHit> {
    hits.iter().find(|hit| {
        state
            .persons
            .get(&hit.person_id)
            .is_some_and(GlobalPerson::is_active)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::value_objects::{ClothingHistogram, SkinTone, EMBEDDING_DIMENSION, HIST_BINS};
    use crate::infrastructure::database::InMemoryPersonRepository;

    struct FakeFeatures {
        appearance: Option<(AppearanceEmbedding, f32)>,
        color: Option<ColorFeatures>,
    }

    impl FakeFeatures {
        fn none() -> Self {
            Self {
                appearance: None,
                color: None,
            }
        }

        fn embedding(embedding: AppearanceEmbedding) -> Self {
            Self {
                appearance: Some((embedding, 0.8)),
                color: None,
            }
        }

        fn color(color: ColorFeatures) -> Self {
            Self {
                appearance: None,
                color: Some(color),
            }
        }
    }

    #[async_trait]
    impl ObservationFeatures for FakeFeatures {
        async fn appearance(&self) -> Option<(AppearanceEmbedding, f32)> {
            self.appearance.clone()
        }

        async fn color(&self) -> Option<ColorFeatures> {
            self.color.clone()
        }
    }

    /// Unit vector along `axis`, rotated toward `axis + 1` so that its
    /// cosine similarity to the pure axis vector equals `cos`.
    fn embedding_with_cosine(axis: usize, cos: f32) -> AppearanceEmbedding {
        let mut values = vec![0.0; EMBEDDING_DIMENSION];
        values[axis] = cos;
        values[axis + 1] = (1.0 - cos * cos).sqrt();
        AppearanceEmbedding::new(values)
    }

    fn axis_embedding(axis: usize) -> AppearanceEmbedding {
        embedding_with_cosine(axis, 1.0)
    }

    fn observation(
        camera_id: CameraId,
        local_track_id: LocalTrackId,
        age: u32,
    ) -> TrackObservation {
        TrackObservation {
            camera_id,
            local_track_id,
            bounding_box: BoundingBox::new(100, 100, 100, 300),
            confidence: 0.9,
            consecutive_frames: age,
            observed_at: Utc::now(),
        }
    }

    fn engine_with(repo: Arc<InMemoryPersonRepository>, layout: RoomLayout) -> IdentityEngine {
        let mut config = EngineConfig::default();
        config.auto_naming = false;
        IdentityEngine::new(repo, layout, Arc::new(EventBus::new()), config)
    }

    fn engine() -> IdentityEngine {
        engine_with(Arc::new(InMemoryPersonRepository::new()), RoomLayout::new())
    }

    #[tokio::test]
    async fn unstable_track_gets_provisional_identity() {
        let engine = engine();
        let identity = engine
            .resolve(observation(1, 1, 1), &FakeFeatures::none())
            .await;

        assert_eq!(
            identity,
            TrackIdentity::Provisional {
                camera_id: 1,
                local_track_id: 1
            }
        );
        assert_eq!(engine.active_count().await, 0);
    }

    #[tokio::test]
    async fn provisional_identity_is_never_persisted() {
        let engine = engine();
        engine
            .resolve(observation(1, 1, 1), &FakeFeatures::none())
            .await;

        assert!(engine.drain_dirty().await.is_none());
    }

    #[tokio::test]
    async fn stable_track_mints_first_person() {
        let engine = engine();
        let identity = engine
            .resolve(observation(1, 1, 3), &FakeFeatures::none())
            .await;

        assert_eq!(identity, TrackIdentity::Person(1));
        let person = engine.snapshot_person(1).await.unwrap();
        assert!(person.is_active());
        assert_eq!(person.total_appearances(), 1);
    }

    #[tokio::test]
    async fn track_identity_is_stable_across_frames() {
        let engine = engine();
        let mut ids = Vec::new();

        for frame in 0..10u32 {
            let identity = engine
                .resolve(observation(7, 1, frame + 1), &FakeFeatures::none())
                .await;
            ids.push(identity);
        }

        // Frames below the stability gate are provisional; all later frames
        // resolve to the same person.
        assert_eq!(ids[0].person_id(), None);
        assert_eq!(ids[1].person_id(), None);
        for identity in &ids[2..] {
            assert_eq!(identity.person_id(), Some(1));
        }

        let person = engine.snapshot_person(1).await.unwrap();
        assert!(person.total_appearances() >= 8);
        assert_eq!(person.cameras_visited().len(), 1);
        assert!(person.cameras_visited().contains(&7));
    }

    #[tokio::test]
    async fn minted_ids_increase_monotonically() {
        let engine = engine();
        let mut previous = 0;

        for track in 0..5 {
            let identity = engine
                .resolve(
                    observation(1, track, 3),
                    &FakeFeatures::embedding(axis_embedding((track as usize) * 10)),
                )
                .await;
            let id = identity.person_id().unwrap();
            assert!(id > previous);
            previous = id;
        }
    }

    #[tokio::test]
    async fn similar_embeddings_on_two_cameras_share_identity() {
        let engine = engine();

        let first = engine
            .resolve(
                observation(1, 1, 3),
                &FakeFeatures::embedding(axis_embedding(0)),
            )
            .await;
        let second = engine
            .resolve(
                observation(2, 8, 3),
                &FakeFeatures::embedding(embedding_with_cosine(0, 0.9)),
            )
            .await;

        assert_eq!(first, second);
        let person = engine.snapshot_person(first.person_id().unwrap()).await.unwrap();
        assert_eq!(person.cameras_visited().len(), 2);
        assert_eq!(person.current_positions().len(), 2);
    }

    #[tokio::test]
    async fn dissimilar_embeddings_mint_distinct_persons() {
        let engine = engine();

        let first = engine
            .resolve(
                observation(1, 1, 3),
                &FakeFeatures::embedding(axis_embedding(0)),
            )
            .await;
        // Cosine 0.45 is below the 0.5 threshold; bbox dimensions are
        // identical, but the dimension stage is not decisive when an
        // embedding is available.
        let second = engine
            .resolve(
                observation(2, 9, 3),
                &FakeFeatures::embedding(embedding_with_cosine(0, 0.45)),
            )
            .await;

        assert_ne!(first.person_id(), second.person_id());
        assert_eq!(engine.active_count().await, 2);
    }

    #[tokio::test]
    async fn dimension_match_applies_without_embedding() {
        let engine = engine();

        let first = engine
            .resolve(observation(1, 1, 3), &FakeFeatures::none())
            .await;
        engine.release_track(1, 1).await;

        // Same camera, new track, nearly identical size, no embedding.
        let mut obs = observation(1, 2, 3);
        obs.bounding_box = BoundingBox::new(400, 120, 102, 300);
        let second = engine.resolve(obs, &FakeFeatures::none()).await;

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn dimension_stage_rejects_size_mismatch() {
        let engine = engine();

        engine
            .resolve(observation(1, 1, 3), &FakeFeatures::none())
            .await;
        engine.release_track(1, 1).await;

        let mut obs = observation(1, 2, 3);
        obs.bounding_box = BoundingBox::new(400, 120, 150, 300);
        let second = engine.resolve(obs, &FakeFeatures::none()).await;

        assert_eq!(second.person_id(), Some(2));
    }

    fn red_shirt_color() -> ColorFeatures {
        let mut counts = [[0.0; HIST_BINS]; 3];
        counts[0][0] = 10.0;
        counts[1][15] = 10.0;
        counts[2][12] = 10.0;
        ColorFeatures::new(
            ClothingHistogram::from_counts(counts),
            Some(SkinTone::new(18.0, 0.4, 0.7)),
        )
    }

    fn blue_shirt_color() -> ColorFeatures {
        let mut counts = [[0.0; HIST_BINS]; 3];
        counts[0][9] = 10.0;
        counts[1][14] = 10.0;
        counts[2][6] = 10.0;
        ColorFeatures::new(
            ClothingHistogram::from_counts(counts),
            Some(SkinTone::new(95.0, 0.2, 0.3)),
        )
    }

    #[tokio::test]
    async fn color_match_identifies_person_without_embedding() {
        let engine = engine();

        let first = engine
            .resolve(observation(1, 1, 3), &FakeFeatures::color(red_shirt_color()))
            .await;
        engine.release_track(1, 1).await;

        // Different size (defeats the dimension stage), same clothing.
        let mut obs = observation(1, 2, 3);
        obs.bounding_box = BoundingBox::new(300, 100, 140, 380);
        let second = engine
            .resolve(obs, &FakeFeatures::color(red_shirt_color()))
            .await;

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn different_colors_mint_distinct_persons() {
        let engine = engine();

        let first = engine
            .resolve(observation(1, 1, 3), &FakeFeatures::color(red_shirt_color()))
            .await;
        engine.release_track(1, 1).await;

        let mut obs = observation(1, 2, 3);
        obs.bounding_box = BoundingBox::new(300, 100, 140, 380);
        let second = engine
            .resolve(obs, &FakeFeatures::color(blue_shirt_color()))
            .await;

        assert_ne!(first.person_id(), second.person_id());
    }

    #[tokio::test]
    async fn spatial_overlap_identifies_person_across_cameras() {
        let mut layout = RoomLayout::new();
        layout.add_camera(1, 1);
        layout.add_camera(1, 2);
        layout.add_overlap(1, 2);
        let engine = engine_with(Arc::new(InMemoryPersonRepository::new()), layout);

        let first = engine
            .resolve(observation(1, 1, 3), &FakeFeatures::none())
            .await;

        // Same projected position on the overlapping camera; wildly
        // different bbox size defeats the dimension stage.
        let mut obs = observation(2, 5, 3);
        obs.bounding_box = BoundingBox::new(120, 80, 60, 340);
        let second = engine.resolve(obs, &FakeFeatures::none()).await;

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn spatial_stage_is_noop_without_overlap_config() {
        let engine = engine();

        engine
            .resolve(observation(1, 1, 3), &FakeFeatures::none())
            .await;

        let mut obs = observation(2, 5, 3);
        obs.bounding_box = BoundingBox::new(120, 80, 60, 340);
        let second = engine.resolve(obs, &FakeFeatures::none()).await;

        assert_eq!(second.person_id(), Some(2));
    }

    #[tokio::test]
    async fn same_camera_concurrent_tracks_stay_distinct() {
        let engine = engine();

        let first = engine
            .resolve(observation(1, 1, 3), &FakeFeatures::none())
            .await;
        // Track 1 is still live on camera 1, so its person is excluded from
        // dimension matching of the second track.
        let mut obs = observation(1, 2, 3);
        obs.bounding_box = BoundingBox::new(400, 100, 100, 300);
        let second = engine.resolve(obs, &FakeFeatures::none()).await;

        assert_ne!(first.person_id(), second.person_id());
    }

    #[tokio::test]
    async fn released_binding_is_forgotten() {
        let engine = engine();

        engine
            .resolve(
                observation(1, 1, 3),
                &FakeFeatures::embedding(axis_embedding(0)),
            )
            .await;
        engine.release_track(1, 1).await;

        // Rebinding through appearance still converges to the same person.
        let identity = engine
            .resolve(
                observation(1, 9, 3),
                &FakeFeatures::embedding(embedding_with_cosine(0, 0.95)),
            )
            .await;
        assert_eq!(identity.person_id(), Some(1));
    }

    #[tokio::test]
    async fn cleanup_deactivates_timed_out_persons() {
        let engine = engine();

        engine
            .resolve(
                observation(1, 1, 3),
                &FakeFeatures::embedding(axis_embedding(0)),
            )
            .await;

        let later = Utc::now() + chrono::Duration::seconds(45);
        let deactivated = engine.cleanup_at(later).await;

        assert_eq!(deactivated, 1);
        assert_eq!(engine.active_count().await, 0);
    }

    #[tokio::test]
    async fn timed_out_person_is_recalled_from_store() {
        let repo = Arc::new(InMemoryPersonRepository::new());
        let engine = engine_with(repo.clone(), RoomLayout::new());

        let first = engine
            .resolve(
                observation(1, 1, 3),
                &FakeFeatures::embedding(axis_embedding(0)),
            )
            .await;
        engine.release_track(1, 1).await;

        // Sync to the store, then time the person out of the gallery.
        let (persons, checkpoint) = engine.drain_dirty().await.unwrap();
        repo.upsert_all(&persons).await.unwrap();
        repo.save_checkpoint(&checkpoint).await.unwrap();
        let later = Utc::now() + chrono::Duration::seconds(45);
        engine.cleanup_at(later).await;
        // A second drain clears the deactivation so cleanup can purge.
        if let Some((persons, _)) = engine.drain_dirty().await {
            repo.upsert_all(&persons).await.unwrap();
        }
        engine.cleanup_at(later).await;

        // A new track with a similar embedding restores the identity.
        let identity = engine
            .resolve(
                observation(1, 7, 3),
                &FakeFeatures::embedding(embedding_with_cosine(0, 0.85)),
            )
            .await;

        assert_eq!(identity, first);
        assert_eq!(engine.active_count().await, 1);
    }

    #[tokio::test]
    async fn restart_recovers_identity_from_store() {
        let repo = Arc::new(InMemoryPersonRepository::new());

        let engine1 = engine_with(repo.clone(), RoomLayout::new());
        let first = engine1
            .resolve(
                observation(1, 1, 3),
                &FakeFeatures::embedding(axis_embedding(0)),
            )
            .await;
        let (persons, checkpoint) = engine1.drain_dirty().await.unwrap();
        repo.upsert_all(&persons).await.unwrap();
        repo.save_checkpoint(&checkpoint).await.unwrap();
        drop(engine1);

        let engine2 = engine_with(repo.clone(), RoomLayout::new());
        let loaded = engine2.bootstrap().await.unwrap();
        assert_eq!(loaded, 1);

        let identity = engine2
            .resolve(
                observation(3, 2, 3),
                &FakeFeatures::embedding(embedding_with_cosine(0, 0.85)),
            )
            .await;
        assert_eq!(identity, first);
    }

    #[tokio::test]
    async fn restart_never_reuses_minted_ids() {
        let repo = Arc::new(InMemoryPersonRepository::new());

        let engine1 = engine_with(repo.clone(), RoomLayout::new());
        engine1
            .resolve(
                observation(1, 1, 3),
                &FakeFeatures::embedding(axis_embedding(0)),
            )
            .await;
        let (persons, checkpoint) = engine1.drain_dirty().await.unwrap();
        repo.upsert_all(&persons).await.unwrap();
        repo.save_checkpoint(&checkpoint).await.unwrap();
        drop(engine1);

        let engine2 = engine_with(repo.clone(), RoomLayout::new());
        engine2.bootstrap().await.unwrap();

        // A clearly different person must receive a fresh, larger id.
        let identity = engine2
            .resolve(
                observation(1, 5, 3),
                &FakeFeatures::embedding(axis_embedding(100)),
            )
            .await;
        assert_eq!(identity.person_id(), Some(2));
    }

    #[tokio::test]
    async fn rename_updates_name_and_is_idempotent() {
        let engine = engine();
        engine
            .resolve(observation(1, 1, 3), &FakeFeatures::none())
            .await;

        engine.rename(1, "Alex".to_string()).await.unwrap();
        engine.rename(1, "Alex".to_string()).await.unwrap();

        let person = engine.snapshot_person(1).await.unwrap();
        assert_eq!(person.assigned_name(), Some("Alex"));
    }

    #[tokio::test]
    async fn rename_unknown_person_fails() {
        let engine = engine();
        let result = engine.rename(42, "Nobody".to_string()).await;
        assert!(matches!(result, Err(EngineError::NotFound(42))));
    }

    #[tokio::test]
    async fn auto_naming_draws_names_in_deterministic_order() {
        let repo = Arc::new(InMemoryPersonRepository::new());
        let config = EngineConfig::default();
        assert!(config.auto_naming);
        let engine = IdentityEngine::new(
            repo,
            RoomLayout::new(),
            Arc::new(EventBus::new()),
            config,
        );

        engine
            .resolve(
                observation(1, 1, 3),
                &FakeFeatures::embedding(axis_embedding(0)),
            )
            .await;
        engine
            .resolve(
                observation(1, 2, 3),
                &FakeFeatures::embedding(axis_embedding(50)),
            )
            .await;

        let first = engine.snapshot_person(1).await.unwrap();
        let second = engine.snapshot_person(2).await.unwrap();
        assert_eq!(first.assigned_name(), Some("Alex"));
        assert_eq!(second.assigned_name(), Some("Blake"));
    }

    #[tokio::test]
    async fn inconsistent_binding_is_dropped_and_rebound() {
        let engine = engine();

        engine
            .resolve(
                observation(1, 1, 3),
                &FakeFeatures::embedding(axis_embedding(0)),
            )
            .await;

        // Force the person out of memory while the binding survives.
        {
            let mut state = engine.state.write().await;
            state.persons.clear();
            state.dirty.clear();
        }
        engine.index.remove(1).await;

        let identity = engine
            .resolve(
                observation(1, 1, 3),
                &FakeFeatures::embedding(axis_embedding(0)),
            )
            .await;

        // The stale binding is dropped and the track re-resolves to a fresh
        // identity.
        assert_eq!(identity.person_id(), Some(2));
    }

    #[tokio::test]
    async fn drain_dirty_is_empty_after_drain_without_mutations() {
        let engine = engine();
        engine
            .resolve(observation(1, 1, 3), &FakeFeatures::none())
            .await;

        assert!(engine.drain_dirty().await.is_some());
        assert!(engine.drain_dirty().await.is_none());
    }

    #[tokio::test]
    async fn remark_dirty_restores_pending_sync() {
        let engine = engine();
        engine
            .resolve(observation(1, 1, 3), &FakeFeatures::none())
            .await;

        let (persons, _) = engine.drain_dirty().await.unwrap();
        engine.remark_dirty(persons.iter().map(|p| p.id())).await;

        let (again, _) = engine.drain_dirty().await.unwrap();
        assert_eq!(again.len(), persons.len());
    }
}
