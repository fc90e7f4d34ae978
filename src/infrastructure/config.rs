//! Application Configuration
//!
//! Loads configuration from environment variables. Camera placement and
//! overlap topology use compact string encodings:
//! `CAMERAS="1:0:10,2:1:10"` (camera_id:device_index:room_id) and
//! `CAMERA_OVERLAPS="1-2,2-3"`.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::application::services::EngineConfig;
use crate::domain::entities::RoomLayout;
use crate::domain::{CameraId, RoomId};

/// One configured camera: identity, capture device, and room.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraSpec {
    pub id: CameraId,
    pub device_index: u32,
    pub room_id: RoomId,
}

/// Application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Server host.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Database URL; None runs the engine on the in-memory store.
    pub database_url: Option<String>,
    /// Enable CORS for the frontend.
    pub cors_origin: String,
    /// Log level.
    pub log_level: String,
    /// Path to the ONNX person detection model.
    pub detector_model_path: PathBuf,
    /// Path to the ONNX appearance encoder model.
    pub encoder_model_path: PathBuf,
    /// Capture and detection rate per camera, in Hz.
    pub capture_fps: u32,
    pub capture_width: u32,
    pub capture_height: u32,
    /// Frames without association before a local track dies.
    pub track_timeout_frames: u32,
    /// Concurrency caps for the GPU-bound stages.
    pub detector_concurrency: usize,
    pub embedder_concurrency: usize,
    /// Configured cameras.
    pub cameras: Vec<CameraSpec>,
    /// Overlapping camera pairs.
    pub overlaps: Vec<(CameraId, CameraId)>,
    /// Identity engine tuning.
    pub engine: EngineConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 7961,
            database_url: None,
            cors_origin: "http://localhost:7970".to_string(),
            log_level: "info".to_string(),
            detector_model_path: PathBuf::from("models/yolov8n.onnx"),
            encoder_model_path: PathBuf::from("models/osnet_x1_0.onnx"),
            capture_fps: 15,
            capture_width: 1280,
            capture_height: 720,
            track_timeout_frames: 30,
            detector_concurrency: 2,
            embedder_concurrency: 2,
            cameras: vec![CameraSpec {
                id: 1,
                device_index: 0,
                room_id: 1,
            }],
            overlaps: Vec::new(),
            engine: EngineConfig::default(),
        }
    }
}

impl AppConfig {
    /// Loads configuration from environment variables.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut config = Self::default();

        if let Ok(host) = std::env::var("HOST") {
            config.host = host;
        }
        if let Some(port) = env_parse("PORT") {
            config.port = port;
        }
        if let Ok(database_url) = std::env::var("DATABASE_URL") {
            if !database_url.is_empty() {
                config.database_url = Some(database_url);
            }
        }
        if let Ok(cors_origin) = std::env::var("CORS_ORIGIN") {
            config.cors_origin = cors_origin;
        }
        if let Ok(log_level) = std::env::var("RUST_LOG") {
            config.log_level = log_level;
        }
        if let Ok(path) = std::env::var("DETECTOR_MODEL_PATH") {
            config.detector_model_path = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("ENCODER_MODEL_PATH") {
            config.encoder_model_path = PathBuf::from(path);
        }
        if let Some(fps) = env_parse("CAPTURE_FPS") {
            config.capture_fps = fps;
        }
        if let Some(width) = env_parse("CAPTURE_WIDTH") {
            config.capture_width = width;
        }
        if let Some(height) = env_parse("CAPTURE_HEIGHT") {
            config.capture_height = height;
        }
        if let Some(frames) = env_parse("TRACK_TIMEOUT_FRAMES") {
            config.track_timeout_frames = frames;
        }
        if let Some(cap) = env_parse("DETECTOR_CONCURRENCY") {
            config.detector_concurrency = cap;
        }
        if let Some(cap) = env_parse("EMBEDDER_CONCURRENCY") {
            config.embedder_concurrency = cap;
        }
        if let Ok(cameras) = std::env::var("CAMERAS") {
            config.cameras = parse_cameras(&cameras);
        }
        if let Ok(overlaps) = std::env::var("CAMERA_OVERLAPS") {
            config.overlaps = parse_overlaps(&overlaps);
        }

        config.engine = Self::load_engine(config.engine);

        Ok(config)
    }

    fn load_engine(mut engine: EngineConfig) -> EngineConfig {
        if let Some(v) = env_parse("STABLE_THRESHOLD") {
            engine.stable_threshold = v;
        }
        if let Some(v) = env_parse("FACE_SIMILARITY_THRESHOLD") {
            engine.appearance_threshold = v;
        }
        if let Some(v) = env_parse("DIMENSION_TOLERANCE") {
            engine.dimension_tolerance = v;
        }
        if let Some(v) = env_parse("DIMENSION_THRESHOLD") {
            engine.dimension_threshold = v;
        }
        if let Some(v) = env_parse("COLOR_THRESHOLD") {
            engine.color_threshold = v;
        }
        if let Some(v) = env_parse("COLOR_EMA_ALPHA") {
            engine.color_ema_alpha = v;
        }
        if let Some(v) = env_parse("PERSON_TIMEOUT_S") {
            engine.person_timeout_s = v;
        }
        if let Some(v) = env_parse("CLEANUP_INTERVAL_S") {
            engine.cleanup_interval_s = v;
        }
        if let Some(v) = env_parse("DB_SYNC_INTERVAL_S") {
            engine.db_sync_interval_s = v;
        }
        if let Some(v) = env_parse("DB_OP_TIMEOUT_S") {
            engine.db_op_timeout_s = v;
        }
        if let Some(v) = env_parse("POSITION_TTL_S") {
            engine.position_ttl_s = v;
        }
        if let Some(v) = env_parse("COLOR_REFRESH_EVERY_K_FRAMES") {
            engine.color_refresh_every_k_frames = v;
        }
        if let Some(v) = env_parse("SPATIAL_TOLERANCE_PX") {
            engine.spatial_tolerance_px = v;
        }
        if let Some(v) = env_parse("AUTO_NAMING") {
            engine.auto_naming = v;
        }
        engine
    }

    /// Builds the room layout from camera specs and overlap pairs.
    pub fn room_layout(&self) -> RoomLayout {
        let mut layout = RoomLayout::new();
        for camera in &self.cameras {
            layout.add_camera(camera.room_id, camera.id);
        }
        for (a, b) in &self.overlaps {
            layout.add_overlap(*a, *b);
        }
        layout
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

/// Parses `id:device:room` triples separated by commas. Malformed entries
/// are skipped.
fn parse_cameras(value: &str) -> Vec<CameraSpec> {
    value
        .split(',')
        .filter_map(|entry| {
            let mut parts = entry.trim().split(':');
            let id = parts.next()?.parse().ok()?;
            let device_index = parts.next()?.parse().ok()?;
            let room_id = parts.next()?.parse().ok()?;
            Some(CameraSpec {
                id,
                device_index,
                room_id,
            })
        })
        .collect()
}

/// Parses `a-b` camera pairs separated by commas.
fn parse_overlaps(value: &str) -> Vec<(CameraId, CameraId)> {
    value
        .split(',')
        .filter_map(|entry| {
            let (a, b) = entry.trim().split_once('-')?;
            Some((a.parse().ok()?, b.parse().ok()?))
        })
        .collect()
}
