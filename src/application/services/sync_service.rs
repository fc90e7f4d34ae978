//! Store Sync Service
//!
//! Periodically flushes dirty gallery state to the persistent store. Sync is
//! dirty-only: a tick with no intervening mutations writes nothing. Failed
//! ticks re-mark their persons dirty so the next tick retries; sync never
//! blocks the resolve path.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::application::services::IdentityEngine;
use crate::domain::repositories::PersonRepository;

/// Outcome of one sync tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Nothing was dirty.
    Clean,
    /// Dirty persons were written.
    Synced(usize),
    /// The write failed; state was re-marked dirty for retry.
    Failed,
}

/// Periodic gallery-to-store synchronizer.
pub struct SyncService {
    engine: Arc<IdentityEngine>,
    repo: Arc<dyn PersonRepository>,
}

impl SyncService {
    pub fn new(engine: Arc<IdentityEngine>, repo: Arc<dyn PersonRepository>) -> Self {
        Self { engine, repo }
    }

    /// Performs one sync tick: drains the dirty set, upserts the snapshot
    /// and the engine checkpoint within the operation timeout.
    pub async fn tick(&self) -> SyncOutcome {
        let Some((persons, checkpoint)) = self.engine.drain_dirty().await else {
            return SyncOutcome::Clean;
        };

        let timeout = Duration::from_secs_f64(self.engine.config().db_op_timeout_s);
        let count = persons.len();

        let write = async {
            self.repo.upsert_all(&persons).await?;
            self.repo.save_checkpoint(&checkpoint).await
        };

        match tokio::time::timeout(timeout, write).await {
            Ok(Ok(())) => {
                debug!("Synced {} persons to store", count);
                SyncOutcome::Synced(count)
            }
            Ok(Err(e)) => {
                warn!("Sync tick failed, will retry: {}", e);
                self.engine
                    .remark_dirty(persons.iter().map(|p| p.id()))
                    .await;
                SyncOutcome::Failed
            }
            Err(_) => {
                warn!("Sync tick timed out, will retry");
                self.engine
                    .remark_dirty(persons.iter().map(|p| p.id()))
                    .await;
                SyncOutcome::Failed
            }
        }
    }

    /// Runs the sync loop until the task is aborted.
    pub async fn run(self: Arc<Self>) {
        let interval = Duration::from_secs_f64(self.engine.config().db_sync_interval_s);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!("Store sync running every {:.1}s", interval.as_secs_f64());
        loop {
            ticker.tick().await;
            self.tick().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::services::{
        EngineConfig, EventBus, NoFeatures, ObservationFeatures, TrackObservation,
    };
    use crate::domain::entities::RoomLayout;
    use crate::domain::value_objects::{
        AppearanceEmbedding, BoundingBox, ColorFeatures, EMBEDDING_DIMENSION,
    };
    use crate::infrastructure::database::InMemoryPersonRepository;
    use async_trait::async_trait;
    use chrono::Utc;

    struct EmbeddingFeatures(AppearanceEmbedding);

    #[async_trait]
    impl ObservationFeatures for EmbeddingFeatures {
        async fn appearance(&self) -> Option<(AppearanceEmbedding, f32)> {
            Some((self.0.clone(), 0.8))
        }

        async fn color(&self) -> Option<ColorFeatures> {
            None
        }
    }

    fn unit_embedding() -> AppearanceEmbedding {
        let mut values = vec![0.0; EMBEDDING_DIMENSION];
        values[0] = 1.0;
        AppearanceEmbedding::new(values)
    }

    fn observation(track: u64) -> TrackObservation {
        TrackObservation {
            camera_id: 1,
            local_track_id: track,
            bounding_box: BoundingBox::new(0, 0, 100, 300),
            confidence: 0.9,
            consecutive_frames: 3,
            observed_at: Utc::now(),
        }
    }

    fn setup() -> (Arc<IdentityEngine>, Arc<InMemoryPersonRepository>, SyncService) {
        let repo = Arc::new(InMemoryPersonRepository::new());
        let mut config = EngineConfig::default();
        config.auto_naming = false;
        let engine = Arc::new(IdentityEngine::new(
            repo.clone(),
            RoomLayout::new(),
            Arc::new(EventBus::new()),
            config,
        ));
        let service = SyncService::new(engine.clone(), repo.clone());
        (engine, repo, service)
    }

    #[tokio::test]
    async fn tick_writes_dirty_persons() {
        let (engine, repo, service) = setup();
        engine.resolve(observation(1), &NoFeatures).await;

        assert_eq!(service.tick().await, SyncOutcome::Synced(1));
        assert!(repo.find_by_id(1).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn idle_tick_writes_nothing() {
        let (engine, repo, service) = setup();
        engine.resolve(observation(1), &NoFeatures).await;

        assert_eq!(service.tick().await, SyncOutcome::Synced(1));
        let writes_after_first = repo.write_count();

        // Two ticks with no intervening mutations leave the store untouched.
        assert_eq!(service.tick().await, SyncOutcome::Clean);
        assert_eq!(service.tick().await, SyncOutcome::Clean);
        assert_eq!(repo.write_count(), writes_after_first);
    }

    #[tokio::test]
    async fn failed_tick_remarks_dirty_for_retry() {
        let (engine, repo, service) = setup();
        engine.resolve(observation(1), &NoFeatures).await;

        repo.fail_writes(true);
        assert_eq!(service.tick().await, SyncOutcome::Failed);

        repo.fail_writes(false);
        assert_eq!(service.tick().await, SyncOutcome::Synced(1));
        assert!(repo.find_by_id(1).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn rename_survives_sync_and_restart() {
        let (engine, repo, service) = setup();
        engine
            .resolve(observation(1), &EmbeddingFeatures(unit_embedding()))
            .await;
        engine.rename(1, "Alex".to_string()).await.unwrap();
        service.tick().await;

        let restarted = IdentityEngine::new(
            repo.clone(),
            RoomLayout::new(),
            Arc::new(EventBus::new()),
            EngineConfig::default(),
        );
        restarted.bootstrap().await.unwrap();

        let person = restarted.snapshot_person(1).await.unwrap();
        assert_eq!(person.assigned_name(), Some("Alex"));
    }
}
