//! Camera Service
//!
//! Owns one worker per camera: capture frames, detect persons, advance the
//! local tracker, and hand stable tracks to the identity engine through the
//! process-frame use case.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::TimeZone;
use chrono::Utc;
use tokio::sync::{broadcast, RwLock};
use tracing::{info, warn};

use super::capture::{CameraCapture, CaptureConfig, CaptureState, CapturedFrame};
use super::detector::PersonDetector;
use super::extractor::{AppearanceEncoder, FrameFeatures};
use super::tracker::{LocalTracker, TrackerConfig};
use crate::application::services::{EventBus, ObservationFeatures};
use crate::application::use_cases::{ProcessFrameUseCase, TrackBatch};
use crate::domain::entities::Camera;
use crate::domain::events::{CameraStatusChangedEvent, DomainEvent};
use crate::domain::CameraId;

/// Live status of one camera worker.
#[derive(Debug, Clone)]
pub struct CameraStatus {
    pub camera_id: CameraId,
    pub name: String,
    pub state: &'static str,
    pub frames_captured: u64,
}

struct CameraWorker {
    name: String,
    capture: Arc<CameraCapture>,
    handle: tokio::task::JoinHandle<()>,
}

/// Manages capture and the per-camera processing pipeline.
pub struct CameraService {
    workers: RwLock<HashMap<CameraId, CameraWorker>>,
    detector: Arc<dyn PersonDetector>,
    encoder: Arc<dyn AppearanceEncoder>,
    process_frame: Arc<ProcessFrameUseCase>,
    event_bus: Arc<EventBus>,
    tracker_config: TrackerConfig,
    capture_template: CaptureConfig,
}

impl CameraService {
    pub fn new(
        detector: Arc<dyn PersonDetector>,
        encoder: Arc<dyn AppearanceEncoder>,
        process_frame: Arc<ProcessFrameUseCase>,
        event_bus: Arc<EventBus>,
        tracker_config: TrackerConfig,
        capture_template: CaptureConfig,
    ) -> Self {
        Self {
            workers: RwLock::new(HashMap::new()),
            detector,
            encoder,
            process_frame,
            event_bus,
            tracker_config,
            capture_template,
        }
    }

    /// Starts capture and processing for a camera.
    pub async fn start_camera(&self, camera: &Camera) -> anyhow::Result<()> {
        let camera_id = camera.id();

        {
            let workers = self.workers.read().await;
            if workers.contains_key(&camera_id) {
                return Ok(());
            }
        }

        info!("Starting worker for camera {} ({})", camera_id, camera.name());

        let config = CaptureConfig {
            device_index: camera.device_index(),
            ..self.capture_template.clone()
        };
        let capture = Arc::new(CameraCapture::new(camera_id, config));
        capture.start().await?;

        let frame_rx = capture.subscribe();
        let handle = tokio::spawn(Self::worker_loop(
            camera_id,
            frame_rx,
            self.detector.clone(),
            self.encoder.clone(),
            self.process_frame.clone(),
            LocalTracker::new(camera_id, self.tracker_config.clone()),
        ));

        self.workers.write().await.insert(
            camera_id,
            CameraWorker {
                name: camera.name().to_string(),
                capture,
                handle,
            },
        );

        self.publish_status(camera_id, camera.name(), "running");
        Ok(())
    }

    async fn worker_loop(
        camera_id: CameraId,
        mut frame_rx: broadcast::Receiver<CapturedFrame>,
        detector: Arc<dyn PersonDetector>,
        encoder: Arc<dyn AppearanceEncoder>,
        process_frame: Arc<ProcessFrameUseCase>,
        mut tracker: LocalTracker,
    ) {
        info!("Frame processing started for camera {}", camera_id);

        loop {
            let frame = match frame_rx.recv().await {
                Ok(frame) => frame,
                Err(broadcast::error::RecvError::Lagged(count)) => {
                    warn!("Camera {} worker lagged by {} frames", camera_id, count);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };

            if frame.data.is_empty() {
                continue;
            }

            let detections = detector.detect(&frame).await;
            let output = tracker.update(&detections);
            if output.tracks.is_empty() && output.lost.is_empty() {
                continue;
            }

            let observed_at = Utc
                .timestamp_millis_opt(frame.timestamp_ms)
                .single()
                .unwrap_or_else(Utc::now);

            let features: Vec<FrameFeatures> = output
                .tracks
                .iter()
                .map(|track| {
                    FrameFeatures::new(&frame, track.bounding_box().clone(), encoder.as_ref())
                })
                .collect();

            let batch = TrackBatch {
                camera_id,
                observed_at,
                tracks: output
                    .tracks
                    .iter()
                    .cloned()
                    .zip(features.iter().map(|f| f as &dyn ObservationFeatures))
                    .collect(),
                lost_tracks: output.lost,
            };

            process_frame.execute(batch).await;
        }

        info!("Frame processing stopped for camera {}", camera_id);
    }

    /// Stops one camera's capture and worker.
    pub async fn stop_camera(&self, camera_id: CameraId) {
        let mut workers = self.workers.write().await;
        if let Some(worker) = workers.remove(&camera_id) {
            worker.capture.stop().await;
            worker.handle.abort();
            self.publish_status(camera_id, &worker.name, "stopped");
            info!("Stopped camera {}", camera_id);
        }
    }

    /// Stops every camera.
    pub async fn stop_all(&self) {
        let mut workers = self.workers.write().await;
        for (camera_id, worker) in workers.drain() {
            worker.capture.stop().await;
            worker.handle.abort();
            self.publish_status(camera_id, &worker.name, "stopped");
            info!("Stopped camera {}", camera_id);
        }
    }

    /// Current status of every worker.
    pub async fn statuses(&self) -> Vec<CameraStatus> {
        let workers = self.workers.read().await;
        let mut statuses = Vec::with_capacity(workers.len());
        for (camera_id, worker) in workers.iter() {
            let state = worker.capture.state().await;
            statuses.push(CameraStatus {
                camera_id: *camera_id,
                name: worker.name.clone(),
                state: state.as_str(),
                frames_captured: worker.capture.frame_count().await,
            });
        }
        statuses.sort_by_key(|status| status.camera_id);
        statuses
    }

    /// Capture state for one camera, None when it has no worker.
    pub async fn camera_state(&self, camera_id: CameraId) -> Option<CaptureState> {
        let workers = self.workers.read().await;
        match workers.get(&camera_id) {
            Some(worker) => Some(worker.capture.state().await),
            None => None,
        }
    }

    fn publish_status(&self, camera_id: CameraId, name: &str, status: &str) {
        self.event_bus
            .publish(DomainEvent::CameraStatusChanged(CameraStatusChangedEvent {
                camera_id,
                camera_name: name.to_string(),
                status: status.to_string(),
                timestamp: Utc::now(),
            }));
    }
}
