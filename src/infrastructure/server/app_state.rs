//! Application State
//!
//! Shared state for the HTTP server: wires the store, identity engine,
//! periodic jobs, and camera pipeline together at startup.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{error, info, warn};

use crate::application::services::{EventBus, IdentityEngine, SyncService};
use crate::application::use_cases::{ProcessFrameUseCase, QueryRoomsUseCase};
use crate::domain::entities::Camera;
use crate::domain::repositories::PersonRepository;
use crate::infrastructure::camera::{
    AppearanceEncoder, CameraService, CaptureConfig, DetectorConfig, EncoderConfig,
    NullAppearanceEncoder, OnnxAppearanceEncoder, OnnxPersonDetector, TrackerConfig,
};
use crate::infrastructure::config::AppConfig;
use crate::infrastructure::database::{
    create_pool, run_migrations, InMemoryPersonRepository, PgPersonRepository,
};

/// Application state shared across handlers.
pub struct AppState {
    pub config: AppConfig,
    pub event_bus: Arc<EventBus>,
    pub query_rooms: Arc<QueryRoomsUseCase>,
    pub camera_service: Option<Arc<CameraService>>,
}

impl AppState {
    /// Creates new application state and starts the background jobs.
    pub async fn new(config: &AppConfig) -> Result<Self> {
        // Store: PostgreSQL when configured, otherwise in-memory.
        let repo: Arc<dyn PersonRepository> = match &config.database_url {
            Some(url) => {
                let pool = create_pool(url).await?;
                run_migrations(&pool).await?;
                Arc::new(PgPersonRepository::new(pool))
            }
            None => {
                warn!("No DATABASE_URL configured; identities will not survive restarts");
                Arc::new(InMemoryPersonRepository::new())
            }
        };

        let event_bus = Arc::new(EventBus::new());
        let layout = config.room_layout();

        let engine = Arc::new(IdentityEngine::new(
            repo.clone(),
            layout.clone(),
            event_bus.clone(),
            config.engine.clone(),
        ));

        // Gallery backfill; a failing store is survivable, the engine then
        // serves from memory until sync recovers.
        match engine.bootstrap().await {
            Ok(count) => info!("Identity engine ready with {} known persons", count),
            Err(e) => warn!("Gallery backfill failed, starting empty: {}", e),
        }

        // Periodic jobs: store sync and gallery cleanup.
        let sync = Arc::new(SyncService::new(engine.clone(), repo.clone()));
        tokio::spawn(sync.run());

        let cleanup_engine = engine.clone();
        let cleanup_interval = Duration::from_secs_f64(config.engine.cleanup_interval_s);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cleanup_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                cleanup_engine.cleanup_tick().await;
            }
        });

        let process_frame = Arc::new(ProcessFrameUseCase::new(engine.clone()));
        let query_rooms = Arc::new(QueryRoomsUseCase::new(engine.clone(), layout));

        // Camera pipeline. A missing detector model disables capture but the
        // engine and query surface stay up.
        let camera_service = match OnnxPersonDetector::new(DetectorConfig {
            model_path: config.detector_model_path.clone(),
            max_concurrent: config.detector_concurrency,
            ..Default::default()
        }) {
            Ok(detector) => {
                let encoder: Arc<dyn AppearanceEncoder> =
                    match OnnxAppearanceEncoder::new(EncoderConfig {
                        model_path: config.encoder_model_path.clone(),
                        max_concurrent: config.embedder_concurrency,
                        ..Default::default()
                    }) {
                        Ok(encoder) => Arc::new(encoder),
                        Err(e) => {
                            warn!(
                                "Appearance encoder unavailable, matching falls back to \
                                 color and dimensions: {}",
                                e
                            );
                            Arc::new(NullAppearanceEncoder)
                        }
                    };

                let service = Arc::new(CameraService::new(
                    Arc::new(detector),
                    encoder,
                    process_frame.clone(),
                    event_bus.clone(),
                    TrackerConfig {
                        track_timeout_frames: config.track_timeout_frames,
                        ..Default::default()
                    },
                    CaptureConfig {
                        device_index: 0,
                        width: config.capture_width,
                        height: config.capture_height,
                        fps: config.capture_fps,
                    },
                ));

                for spec in &config.cameras {
                    let camera = Camera::new(
                        spec.id,
                        format!("camera-{}", spec.id),
                        spec.device_index,
                        spec.room_id,
                    );
                    if let Err(e) = service.start_camera(&camera).await {
                        error!("Failed to start camera {}: {}", spec.id, e);
                    }
                }

                Some(service)
            }
            Err(e) => {
                warn!("Person detector unavailable, camera pipeline disabled: {}", e);
                None
            }
        };

        Ok(Self {
            config: config.clone(),
            event_bus,
            query_rooms,
            camera_service,
        })
    }
}
