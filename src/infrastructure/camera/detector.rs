//! Person Detector
//!
//! ONNX-based person detection. Inference runs on a dedicated thread behind
//! a bounded request channel, with a semaphore capping concurrent GPU use
//! across camera workers.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use async_trait::async_trait;
use crossbeam_channel::{bounded, Receiver, Sender};
use image::{DynamicImage, ImageBuffer, Rgb};
use ndarray::Array;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::{Tensor, Value};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::domain::entities::PersonDetection;
use crate::domain::value_objects::BoundingBox;
use crate::infrastructure::camera::CapturedFrame;

/// YOLO output geometry: 4 bbox values + 80 COCO classes over 8400 anchors.
const NUM_FEATURES: usize = 84;
const NUM_BOXES: usize = 8400;
/// COCO class id for "person".
const PERSON_CLASS: usize = 0;

/// Detector boundary: a frame in, person boxes out. Stateless; transient
/// failures yield an empty list and are logged by the implementation.
#[async_trait]
pub trait PersonDetector: Send + Sync {
    async fn detect(&self, frame: &CapturedFrame) -> Vec<PersonDetection>;
}

/// Person detector configuration.
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// Path to the YOLO ONNX model file.
    pub model_path: PathBuf,
    /// Detection confidence threshold.
    pub confidence_threshold: f32,
    /// IoU threshold for non-maximum suppression.
    pub nms_threshold: f32,
    /// Square model input size.
    pub input_size: u32,
    /// Concurrent inference cap.
    pub max_concurrent: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("models/yolov8n.onnx"),
            confidence_threshold: 0.5,
            nms_threshold: 0.45,
            input_size: 640,
            max_concurrent: 2,
        }
    }
}

struct DetectionRequest {
    frame: CapturedFrame,
    response_tx: tokio::sync::oneshot::Sender<Vec<PersonDetection>>,
}

/// ONNX person detector running on a dedicated inference thread.
pub struct OnnxPersonDetector {
    request_tx: Sender<DetectionRequest>,
    semaphore: Arc<Semaphore>,
    detection_count: Arc<AtomicU64>,
}

impl OnnxPersonDetector {
    /// Creates the detector and spawns its inference thread.
    pub fn new(config: DetectorConfig) -> anyhow::Result<Self> {
        if !config.model_path.exists() {
            return Err(anyhow::anyhow!(
                "Person detection model not found at {:?}",
                config.model_path
            ));
        }

        let (request_tx, request_rx): (Sender<DetectionRequest>, Receiver<DetectionRequest>) =
            bounded(32);
        let detection_count = Arc::new(AtomicU64::new(0));
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent.max(1)));

        let thread_count = detection_count.clone();
        let thread_config = config.clone();
        thread::Builder::new()
            .name("person-detector".to_string())
            .spawn(move || Self::detector_thread(request_rx, thread_config, thread_count))?;

        info!(
            "Person detector initialized from {:?}",
            config.model_path
        );

        Ok(Self {
            request_tx,
            semaphore,
            detection_count,
        })
    }

    /// Total detections produced since startup.
    pub fn detection_count(&self) -> u64 {
        self.detection_count.load(Ordering::Relaxed)
    }

    fn detector_thread(
        request_rx: Receiver<DetectionRequest>,
        config: DetectorConfig,
        detection_count: Arc<AtomicU64>,
    ) {
        let mut session = match create_session(&config.model_path) {
            Ok(session) => session,
            Err(e) => {
                error!("Failed to create detector session: {}", e);
                return;
            }
        };

        info!("Person detector thread running");

        while let Ok(request) = request_rx.recv() {
            let detections = match Self::run_detection(&mut session, &config, &request.frame) {
                Ok(detections) => detections,
                Err(e) => {
                    warn!("Detection failed, skipping frame: {}", e);
                    Vec::new()
                }
            };

            detection_count.fetch_add(detections.len() as u64, Ordering::Relaxed);

            // The requester may have timed out; a dropped receiver is fine.
            let _ = request.response_tx.send(detections);
        }

        info!("Person detector thread exiting");
    }

    fn run_detection(
        session: &mut Session,
        config: &DetectorConfig,
        frame: &CapturedFrame,
    ) -> anyhow::Result<Vec<PersonDetection>> {
        let expected = (frame.width * frame.height * 3) as usize;
        if frame.data.len() != expected {
            return Err(anyhow::anyhow!(
                "Frame data length {} does not match {}x{} RGB",
                frame.data.len(),
                frame.width,
                frame.height
            ));
        }

        let buffer: ImageBuffer<Rgb<u8>, Vec<u8>> =
            ImageBuffer::from_raw(frame.width, frame.height, frame.data.clone())
                .ok_or_else(|| anyhow::anyhow!("Failed to wrap frame buffer"))?;
        let img = DynamicImage::ImageRgb8(buffer);

        let input = preprocess(&img, config.input_size)?;
        let outputs = session.run(ort::inputs![input])?;
        let output = outputs
            .get("output0")
            .ok_or_else(|| anyhow::anyhow!("Missing output0 tensor"))?;
        let tensor = output.try_extract_tensor::<f32>()?;
        let raw: Vec<f32> = tensor.1.iter().copied().collect();

        postprocess(&raw, config, frame.width, frame.height)
    }
}

#[async_trait]
impl PersonDetector for OnnxPersonDetector {
    async fn detect(&self, frame: &CapturedFrame) -> Vec<PersonDetection> {
        // GPU concurrency cap shared by every camera worker.
        let _permit = match self.semaphore.acquire().await {
            Ok(permit) => permit,
            Err(_) => return Vec::new(),
        };

        let (response_tx, response_rx) = tokio::sync::oneshot::channel();
        let request = DetectionRequest {
            frame: frame.clone(),
            response_tx,
        };

        if self.request_tx.try_send(request).is_err() {
            debug!("Detector queue full, skipping frame {}", frame.frame_number);
            return Vec::new();
        }

        response_rx.await.unwrap_or_default()
    }
}

/// Resizes to the square model input, normalizes to [0, 1], and lays the
/// pixels out in NCHW order.
fn preprocess(img: &DynamicImage, input_size: u32) -> anyhow::Result<Value> {
    let resized = img.resize_exact(
        input_size,
        input_size,
        image::imageops::FilterType::Triangle,
    );
    let rgb = resized.to_rgb8();
    let (w, h) = (input_size as usize, input_size as usize);

    let mut chw_data: Vec<f32> = Vec::with_capacity(3 * h * w);
    for c in 0..3 {
        for y in 0..h {
            for x in 0..w {
                let pixel = rgb.get_pixel(x as u32, y as u32);
                chw_data.push(pixel[c] as f32 / 255.0);
            }
        }
    }

    let shape = vec![1usize, 3, h, w];
    Tensor::from_array((shape, chw_data.into_boxed_slice()))
        .map(Value::from)
        .map_err(|e| anyhow::anyhow!("Failed to create input tensor: {}", e))
}

/// Parses the YOLO output layout [1, 84, 8400], keeps person-class boxes
/// above the confidence threshold, and applies NMS.
fn postprocess(
    raw: &[f32],
    config: &DetectorConfig,
    frame_width: u32,
    frame_height: u32,
) -> anyhow::Result<Vec<PersonDetection>> {
    if raw.len() != NUM_FEATURES * NUM_BOXES {
        return Err(anyhow::anyhow!(
            "Unexpected output size {} (expected {})",
            raw.len(),
            NUM_FEATURES * NUM_BOXES
        ));
    }

    let output = Array::from_shape_vec((NUM_FEATURES, NUM_BOXES), raw.to_vec())?;
    let transposed = output.t();

    let input_size = config.input_size as f32;
    let scale_w = frame_width as f32 / input_size;
    let scale_h = frame_height as f32 / input_size;

    let mut candidates = Vec::new();
    for i in 0..NUM_BOXES {
        let score = transposed[[i, 4 + PERSON_CLASS]];
        if score < config.confidence_threshold {
            continue;
        }

        let cx = transposed[[i, 0]] * scale_w;
        let cy = transposed[[i, 1]] * scale_h;
        let w = transposed[[i, 2]] * scale_w;
        let h = transposed[[i, 3]] * scale_h;

        let bbox = BoundingBox::from_corners(
            (cx - w / 2.0) as i32,
            (cy - h / 2.0) as i32,
            (cx + w / 2.0) as i32,
            (cy + h / 2.0) as i32,
        );

        let Some(bbox) = bbox.clipped_to(frame_width, frame_height) else {
            continue;
        };
        candidates.push(PersonDetection::new(bbox, score.clamp(0.0, 1.0)));
    }

    Ok(non_maximum_suppression(candidates, config.nms_threshold))
}

/// Keeps the highest-confidence box of each overlapping cluster.
fn non_maximum_suppression(
    mut detections: Vec<PersonDetection>,
    nms_threshold: f32,
) -> Vec<PersonDetection> {
    detections.sort_by(|a, b| {
        b.confidence()
            .partial_cmp(&a.confidence())
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep: Vec<PersonDetection> = Vec::new();
    for detection in detections {
        let overlaps = keep
            .iter()
            .any(|kept| kept.bounding_box().iou(detection.bounding_box()) > nms_threshold);
        if !overlaps {
            keep.push(detection);
        }
    }
    keep
}

/// Creates the ONNX Runtime session.
pub(crate) fn create_session(model_path: &std::path::Path) -> anyhow::Result<Session> {
    let session = Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .commit_from_file(model_path)?;
    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detection(x: i32, confidence: f32) -> PersonDetection {
        PersonDetection::new(BoundingBox::new(x, 0, 100, 200), confidence)
    }

    #[test]
    fn nms_keeps_highest_confidence_of_overlapping_boxes() {
        let detections = vec![detection(0, 0.6), detection(10, 0.9), detection(400, 0.7)];
        let kept = non_maximum_suppression(detections, 0.45);

        assert_eq!(kept.len(), 2);
        assert!((kept[0].confidence() - 0.9).abs() < f32::EPSILON);
        assert_eq!(kept[1].bounding_box().x(), 400);
    }

    #[test]
    fn nms_keeps_disjoint_boxes() {
        let detections = vec![detection(0, 0.8), detection(200, 0.8)];
        let kept = non_maximum_suppression(detections, 0.45);
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn postprocess_rejects_malformed_output() {
        let config = DetectorConfig::default();
        assert!(postprocess(&[0.0; 10], &config, 640, 640).is_err());
    }

    #[test]
    fn postprocess_extracts_person_boxes() {
        let config = DetectorConfig {
            confidence_threshold: 0.5,
            ..Default::default()
        };

        // One anchor with a confident person box centered at (320, 320).
        let mut raw = vec![0.0f32; NUM_FEATURES * NUM_BOXES];
        raw[0] = 320.0; // cx, anchor 0
        raw[NUM_BOXES] = 320.0; // cy
        raw[2 * NUM_BOXES] = 100.0; // w
        raw[3 * NUM_BOXES] = 200.0; // h
        raw[4 * NUM_BOXES] = 0.9; // person score

        let detections = postprocess(&raw, &config, 640, 640).unwrap();
        assert_eq!(detections.len(), 1);
        let bbox = detections[0].bounding_box();
        assert_eq!(bbox.center(), (320, 320));
        assert_eq!(bbox.width(), 100);
    }
}
