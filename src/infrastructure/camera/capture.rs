//! Frame Source
//!
//! Per-camera video capture using nokhwa. Each camera runs an independent
//! producer loop that broadcasts timestamped RGB frames at the configured
//! rate; downstream stages subscribe and keep their own pace.

use std::sync::Arc;

use nokhwa::pixel_format::RgbFormat;
use nokhwa::utils::{CameraIndex, RequestedFormat, RequestedFormatType};
use nokhwa::Camera;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error, info, warn};

use crate::domain::CameraId;

/// Captured frame data in packed RGB.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pub camera_id: CameraId,
    pub frame_number: u64,
    pub timestamp_ms: i64,
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

/// Camera capture configuration.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub device_index: u32,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device_index: 0,
            width: 1280,
            height: 720,
            fps: 15,
        }
    }
}

/// Camera capture state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Stopped,
    Starting,
    Running,
    Error,
}

impl CaptureState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaptureState::Stopped => "stopped",
            CaptureState::Starting => "starting",
            CaptureState::Running => "running",
            CaptureState::Error => "error",
        }
    }
}

/// Capture manager for one camera device.
pub struct CameraCapture {
    camera_id: CameraId,
    config: CaptureConfig,
    state: Arc<RwLock<CaptureState>>,
    frame_sender: broadcast::Sender<CapturedFrame>,
    frame_count: Arc<RwLock<u64>>,
}

impl CameraCapture {
    /// Creates a new camera capture.
    pub fn new(camera_id: CameraId, config: CaptureConfig) -> Self {
        let (frame_sender, _) = broadcast::channel(32);
        Self {
            camera_id,
            config,
            state: Arc::new(RwLock::new(CaptureState::Stopped)),
            frame_sender,
            frame_count: Arc::new(RwLock::new(0)),
        }
    }

    /// Subscribes to frame updates.
    pub fn subscribe(&self) -> broadcast::Receiver<CapturedFrame> {
        self.frame_sender.subscribe()
    }

    /// Returns the current capture state.
    pub async fn state(&self) -> CaptureState {
        *self.state.read().await
    }

    /// Starts the capture loop in a background task.
    pub async fn start(&self) -> anyhow::Result<()> {
        let mut state = self.state.write().await;
        if *state == CaptureState::Running {
            return Ok(());
        }
        *state = CaptureState::Starting;
        drop(state);

        info!(
            "Starting capture for camera {} on device {}",
            self.camera_id, self.config.device_index
        );

        let camera_id = self.camera_id;
        let config = self.config.clone();
        let state = self.state.clone();
        let frame_sender = self.frame_sender.clone();
        let frame_count = self.frame_count.clone();

        tokio::spawn(async move {
            match Self::capture_loop(camera_id, config, state.clone(), frame_sender, frame_count)
                .await
            {
                Ok(_) => info!("Capture stopped for camera {}", camera_id),
                Err(e) => {
                    error!("Capture error for camera {}: {}", camera_id, e);
                    *state.write().await = CaptureState::Error;
                }
            }
        });

        Ok(())
    }

    /// Stops the capture loop.
    pub async fn stop(&self) {
        info!("Stopping capture for camera {}", self.camera_id);
        *self.state.write().await = CaptureState::Stopped;
    }

    async fn capture_loop(
        camera_id: CameraId,
        config: CaptureConfig,
        state: Arc<RwLock<CaptureState>>,
        frame_sender: broadcast::Sender<CapturedFrame>,
        frame_count: Arc<RwLock<u64>>,
    ) -> anyhow::Result<()> {
        // Device access is blocking; initialization runs off the runtime.
        let device_index = config.device_index;
        let init_result = tokio::task::spawn_blocking(move || {
            let index = CameraIndex::Index(device_index);
            let requested =
                RequestedFormat::new::<RgbFormat>(RequestedFormatType::AbsoluteHighestResolution);

            let mut cam = Camera::new(index, requested)?;
            let resolution = cam.resolution();
            cam.open_stream()?;

            Ok::<_, nokhwa::NokhwaError>((cam, resolution.width(), resolution.height()))
        })
        .await?;

        let (camera, actual_width, actual_height) = match init_result {
            Ok(result) => result,
            Err(e) => {
                error!("Failed to initialize camera {}: {}", camera_id, e);
                *state.write().await = CaptureState::Error;
                return Err(anyhow::anyhow!("Camera initialization failed: {}", e));
            }
        };

        *state.write().await = CaptureState::Running;
        info!(
            "Camera {} capturing at {}x{}",
            camera_id, actual_width, actual_height
        );

        let camera = Arc::new(std::sync::Mutex::new(camera));
        let frame_interval = std::time::Duration::from_millis(1000 / config.fps.max(1) as u64);
        let mut interval = tokio::time::interval(frame_interval);

        loop {
            interval.tick().await;

            if *state.read().await != CaptureState::Running {
                break;
            }

            let camera_clone = camera.clone();
            let frame_result = tokio::task::spawn_blocking(move || {
                let mut cam = camera_clone
                    .lock()
                    .map_err(|_| nokhwa::NokhwaError::GeneralError("poisoned lock".into()))?;
                cam.frame()
            })
            .await;

            match frame_result {
                Ok(Ok(buffer)) => {
                    let mut count = frame_count.write().await;
                    *count += 1;
                    let frame_number = *count;
                    drop(count);

                    let frame = CapturedFrame {
                        camera_id,
                        frame_number,
                        timestamp_ms: chrono::Utc::now().timestamp_millis(),
                        width: actual_width,
                        height: actual_height,
                        data: buffer.buffer().to_vec(),
                    };

                    if frame_number % 100 == 0 {
                        debug!(
                            "Camera {} frame {} ({}x{})",
                            camera_id, frame_number, actual_width, actual_height
                        );
                    }

                    // No subscribers yet is fine; frames are simply dropped.
                    let _ = frame_sender.send(frame);
                }
                Ok(Err(e)) => {
                    // Transient capture hiccup: skip the frame.
                    warn!("Camera {} frame capture error: {}", camera_id, e);
                }
                Err(e) => {
                    error!("Camera {} capture task error: {}", camera_id, e);
                }
            }
        }

        drop(camera);
        *state.write().await = CaptureState::Stopped;

        Ok(())
    }

    /// Returns the number of frames captured so far.
    pub async fn frame_count(&self) -> u64 {
        *self.frame_count.read().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_720p_at_detect_rate() {
        let config = CaptureConfig::default();
        assert_eq!(config.width, 1280);
        assert_eq!(config.height, 720);
        assert_eq!(config.fps, 15);
    }

    #[test]
    fn new_capture_is_stopped() {
        tokio_test::block_on(async {
            let capture = CameraCapture::new(1, CaptureConfig::default());
            assert_eq!(capture.state().await, CaptureState::Stopped);
            assert_eq!(capture.frame_count().await, 0);
        });
    }
}
