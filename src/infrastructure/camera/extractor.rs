//! Appearance and Color Feature Extraction
//!
//! The appearance encoder produces 512-D L2-normalized embeddings from body
//! crops through an ONNX re-identification model on a dedicated thread. The
//! color extractor is pure pixel math over the raw RGB frame: an HSV
//! histogram of the torso slice and a mean-HSV skin tone of the head slice.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use async_trait::async_trait;
use crossbeam_channel::{bounded, Receiver, Sender};
use image::{DynamicImage, ImageBuffer, Rgb};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::{Tensor, Value};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::application::services::ObservationFeatures;
use crate::domain::value_objects::{
    AppearanceEmbedding, BoundingBox, ClothingHistogram, ColorFeatures, SkinTone, HIST_BINS,
};
use crate::infrastructure::camera::detector::create_session;
use crate::infrastructure::camera::CapturedFrame;

/// Crops smaller than this on either side are rejected.
const MIN_CROP_SIDE: i32 = 64;

/// Bbox area at which the quality proxy saturates at 1.0.
const FULL_QUALITY_AREA: f32 = 256.0 * 512.0;

/// Torso slice of the bbox, as fractions of its height.
const TORSO_SLICE: (f32, f32) = (0.4, 0.7);
/// Head slice of the bbox, as a fraction of its height.
const HEAD_SLICE: f32 = 0.25;

/// Embedder boundary: frame and bbox in, normalized embedding and quality
/// proxy out. None when the crop fails the minimum-size check or inference
/// fails.
#[async_trait]
pub trait AppearanceEncoder: Send + Sync {
    async fn encode(
        &self,
        frame: &CapturedFrame,
        bbox: &BoundingBox,
    ) -> Option<(AppearanceEmbedding, f32)>;
}

/// Appearance encoder configuration.
#[derive(Debug, Clone)]
pub struct EncoderConfig {
    /// Path to the re-identification ONNX model.
    pub model_path: PathBuf,
    /// Model input width and height.
    pub input_width: u32,
    pub input_height: u32,
    /// Concurrent inference cap.
    pub max_concurrent: usize,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("models/osnet_x1_0.onnx"),
            input_width: 128,
            input_height: 256,
            max_concurrent: 2,
        }
    }
}

struct EncodeRequest {
    frame: CapturedFrame,
    bbox: BoundingBox,
    response_tx: tokio::sync::oneshot::Sender<Option<AppearanceEmbedding>>,
}

/// ONNX appearance encoder running on a dedicated inference thread.
pub struct OnnxAppearanceEncoder {
    request_tx: Sender<EncodeRequest>,
    semaphore: Arc<Semaphore>,
}

impl OnnxAppearanceEncoder {
    /// Creates the encoder and spawns its inference thread.
    pub fn new(config: EncoderConfig) -> anyhow::Result<Self> {
        if !config.model_path.exists() {
            return Err(anyhow::anyhow!(
                "Appearance encoder model not found at {:?}",
                config.model_path
            ));
        }

        let (request_tx, request_rx): (Sender<EncodeRequest>, Receiver<EncodeRequest>) =
            bounded(32);
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent.max(1)));

        let thread_config = config.clone();
        thread::Builder::new()
            .name("appearance-encoder".to_string())
            .spawn(move || Self::encoder_thread(request_rx, thread_config))?;

        info!("Appearance encoder initialized from {:?}", config.model_path);

        Ok(Self {
            request_tx,
            semaphore,
        })
    }

    fn encoder_thread(request_rx: Receiver<EncodeRequest>, config: EncoderConfig) {
        let mut session = match create_session(&config.model_path) {
            Ok(session) => session,
            Err(e) => {
                error!("Failed to create encoder session: {}", e);
                return;
            }
        };

        info!("Appearance encoder thread running");

        while let Ok(request) = request_rx.recv() {
            let embedding =
                match Self::run_encode(&mut session, &config, &request.frame, &request.bbox) {
                    Ok(embedding) => embedding,
                    Err(e) => {
                        warn!("Embedding extraction failed: {}", e);
                        None
                    }
                };
            let _ = request.response_tx.send(embedding);
        }

        info!("Appearance encoder thread exiting");
    }

    fn run_encode(
        session: &mut Session,
        config: &EncoderConfig,
        frame: &CapturedFrame,
        bbox: &BoundingBox,
    ) -> anyhow::Result<Option<AppearanceEmbedding>> {
        let Some(crop) = crop_region(frame, bbox) else {
            return Ok(None);
        };

        let resized = crop.resize_exact(
            config.input_width,
            config.input_height,
            image::imageops::FilterType::Triangle,
        );
        let rgb = resized.to_rgb8();
        let (w, h) = (config.input_width as usize, config.input_height as usize);

        // ImageNet normalization, NCHW layout.
        let mean = [0.485f32, 0.456, 0.406];
        let std = [0.229f32, 0.224, 0.225];
        let mut chw_data: Vec<f32> = Vec::with_capacity(3 * h * w);
        for c in 0..3 {
            for y in 0..h {
                for x in 0..w {
                    let pixel = rgb.get_pixel(x as u32, y as u32);
                    chw_data.push((pixel[c] as f32 / 255.0 - mean[c]) / std[c]);
                }
            }
        }

        let shape = vec![1usize, 3, h, w];
        let input: Value = Tensor::from_array((shape, chw_data.into_boxed_slice()))
            .map(Value::from)
            .map_err(|e| anyhow::anyhow!("Failed to create input tensor: {}", e))?;

        let outputs = session.run(ort::inputs![input])?;
        let output = outputs
            .iter()
            .next()
            .map(|(_, value)| value)
            .ok_or_else(|| anyhow::anyhow!("Encoder produced no output"))?;
        let tensor = output.try_extract_tensor::<f32>()?;
        let values: Vec<f32> = tensor.1.iter().copied().collect();

        Ok(AppearanceEmbedding::from_raw(values))
    }
}

#[async_trait]
impl AppearanceEncoder for OnnxAppearanceEncoder {
    async fn encode(
        &self,
        frame: &CapturedFrame,
        bbox: &BoundingBox,
    ) -> Option<(AppearanceEmbedding, f32)> {
        if !crop_meets_minimum(frame, bbox) {
            return None;
        }

        let _permit = self.semaphore.acquire().await.ok()?;

        let (response_tx, response_rx) = tokio::sync::oneshot::channel();
        let request = EncodeRequest {
            frame: frame.clone(),
            bbox: bbox.clone(),
            response_tx,
        };

        if self.request_tx.try_send(request).is_err() {
            debug!("Encoder queue full, skipping crop");
            return None;
        }

        let embedding = response_rx.await.ok().flatten()?;
        Some((embedding, area_quality(bbox)))
    }
}

/// Encoder stand-in used when the embedding model is unavailable. Resolve
/// falls through to the color and dimension stages.
pub struct NullAppearanceEncoder;

#[async_trait]
impl AppearanceEncoder for NullAppearanceEncoder {
    async fn encode(
        &self,
        _frame: &CapturedFrame,
        _bbox: &BoundingBox,
    ) -> Option<(AppearanceEmbedding, f32)> {
        None
    }
}

/// Quality proxy derived from the crop area, saturating at 1.0.
pub fn area_quality(bbox: &BoundingBox) -> f32 {
    (bbox.area() as f32 / FULL_QUALITY_AREA).clamp(0.0, 1.0)
}

fn crop_meets_minimum(frame: &CapturedFrame, bbox: &BoundingBox) -> bool {
    bbox.clipped_to(frame.width, frame.height)
        .is_some_and(|clipped| clipped.width() >= MIN_CROP_SIDE && clipped.height() >= MIN_CROP_SIDE)
}

fn crop_region(frame: &CapturedFrame, bbox: &BoundingBox) -> Option<DynamicImage> {
    let clipped = bbox.clipped_to(frame.width, frame.height)?;
    if clipped.width() < MIN_CROP_SIDE || clipped.height() < MIN_CROP_SIDE {
        return None;
    }

    let buffer: ImageBuffer<Rgb<u8>, Vec<u8>> =
        ImageBuffer::from_raw(frame.width, frame.height, frame.data.clone())?;
    let img = DynamicImage::ImageRgb8(buffer);

    Some(img.crop_imm(
        clipped.x() as u32,
        clipped.y() as u32,
        clipped.width() as u32,
        clipped.height() as u32,
    ))
}

/// Extracts clothing histogram and skin tone from the raw RGB frame.
/// Either part is absent when its slice clips to nothing.
pub fn extract_color_features(frame: &CapturedFrame, bbox: &BoundingBox) -> ColorFeatures {
    let Some(clipped) = bbox.clipped_to(frame.width, frame.height) else {
        return ColorFeatures::default();
    };

    let height = clipped.height() as f32;
    let torso_top = clipped.y() + (height * TORSO_SLICE.0) as i32;
    let torso_bottom = clipped.y() + (height * TORSO_SLICE.1) as i32;
    let head_bottom = clipped.y() + (height * HEAD_SLICE) as i32;

    let clothing = clothing_histogram(frame, &clipped, torso_top, torso_bottom);
    let skin = mean_skin_tone(frame, &clipped, clipped.y(), head_bottom);

    ColorFeatures::new(clothing, skin)
}

fn clothing_histogram(
    frame: &CapturedFrame,
    bbox: &BoundingBox,
    y_top: i32,
    y_bottom: i32,
) -> Option<ClothingHistogram> {
    let mut counts = [[0.0f32; HIST_BINS]; 3];
    let mut samples = 0u32;

    for_each_pixel(frame, bbox, y_top, y_bottom, |h, s, v| {
        counts[0][hue_bin(h)] += 1.0;
        counts[1][unit_bin(s)] += 1.0;
        counts[2][unit_bin(v)] += 1.0;
        samples += 1;
    });

    if samples == 0 {
        return None;
    }
    ClothingHistogram::from_counts(counts)
}

fn mean_skin_tone(
    frame: &CapturedFrame,
    bbox: &BoundingBox,
    y_top: i32,
    y_bottom: i32,
) -> Option<SkinTone> {
    let mut sum = (0.0f32, 0.0f32, 0.0f32);
    let mut samples = 0u32;

    for_each_pixel(frame, bbox, y_top, y_bottom, |h, s, v| {
        sum.0 += h;
        sum.1 += s;
        sum.2 += v;
        samples += 1;
    });

    if samples == 0 {
        return None;
    }
    let n = samples as f32;
    Some(SkinTone::new(sum.0 / n, sum.1 / n, sum.2 / n))
}

fn for_each_pixel(
    frame: &CapturedFrame,
    bbox: &BoundingBox,
    y_top: i32,
    y_bottom: i32,
    mut f: impl FnMut(f32, f32, f32),
) {
    let y_top = y_top.max(0);
    let y_bottom = y_bottom.min(frame.height as i32);
    let x_left = bbox.x().max(0);
    let x_right = bbox.right().min(frame.width as i32);

    for y in y_top..y_bottom {
        for x in x_left..x_right {
            let offset = ((y as u32 * frame.width + x as u32) * 3) as usize;
            if offset + 2 >= frame.data.len() {
                continue;
            }
            let (h, s, v) = rgb_to_hsv(
                frame.data[offset],
                frame.data[offset + 1],
                frame.data[offset + 2],
            );
            f(h, s, v);
        }
    }
}

fn hue_bin(h: f32) -> usize {
    (((h / 360.0) * HIST_BINS as f32) as usize).min(HIST_BINS - 1)
}

fn unit_bin(value: f32) -> usize {
    ((value * HIST_BINS as f32) as usize).min(HIST_BINS - 1)
}

/// RGB in [0, 255] to HSV with hue in degrees and saturation/value in [0, 1].
fn rgb_to_hsv(r: u8, g: u8, b: u8) -> (f32, f32, f32) {
    let r = r as f32 / 255.0;
    let g = g as f32 / 255.0;
    let b = b as f32 / 255.0;

    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;

    let h = if delta == 0.0 {
        0.0
    } else if max == r {
        60.0 * (((g - b) / delta) % 6.0)
    } else if max == g {
        60.0 * ((b - r) / delta + 2.0)
    } else {
        60.0 * ((r - g) / delta + 4.0)
    };
    let h = if h < 0.0 { h + 360.0 } else { h };

    let s = if max == 0.0 { 0.0 } else { delta / max };

    (h, s, max)
}

/// Per-track feature provider handed to the identity engine. Extraction is
/// pulled lazily so bound and unstable tracks skip the GPU entirely.
pub struct FrameFeatures<'a> {
    frame: &'a CapturedFrame,
    bbox: BoundingBox,
    encoder: &'a dyn AppearanceEncoder,
}

impl<'a> FrameFeatures<'a> {
    pub fn new(
        frame: &'a CapturedFrame,
        bbox: BoundingBox,
        encoder: &'a dyn AppearanceEncoder,
    ) -> Self {
        Self {
            frame,
            bbox,
            encoder,
        }
    }
}

#[async_trait]
impl ObservationFeatures for FrameFeatures<'_> {
    async fn appearance(&self) -> Option<(AppearanceEmbedding, f32)> {
        self.encoder.encode(self.frame, &self.bbox).await
    }

    async fn color(&self) -> Option<ColorFeatures> {
        let features = extract_color_features(self.frame, &self.bbox);
        (!features.is_empty()).then_some(features)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Frame with a red torso band and a skin-toned head band.
    fn synthetic_frame() -> CapturedFrame {
        let width = 100u32;
        let height = 200u32;
        let mut data = vec![0u8; (width * height * 3) as usize];

        for y in 0..height {
            for x in 0..width {
                let offset = ((y * width + x) * 3) as usize;
                let (r, g, b) = if y < 50 {
                    // Head band: warm skin tone.
                    (220u8, 170u8, 130u8)
                } else if (80..140).contains(&y) {
                    // Torso band: red shirt.
                    (200, 20, 20)
                } else {
                    (40, 40, 40)
                };
                data[offset] = r;
                data[offset + 1] = g;
                data[offset + 2] = b;
            }
        }

        CapturedFrame {
            camera_id: 1,
            frame_number: 1,
            timestamp_ms: 0,
            width,
            height,
            data,
        }
    }

    #[test]
    fn rgb_to_hsv_handles_primaries() {
        let (h, s, v) = rgb_to_hsv(255, 0, 0);
        assert!(h.abs() < 0.001);
        assert!((s - 1.0).abs() < 0.001);
        assert!((v - 1.0).abs() < 0.001);

        let (h, _, _) = rgb_to_hsv(0, 255, 0);
        assert!((h - 120.0).abs() < 0.001);

        let (h, s, _) = rgb_to_hsv(128, 128, 128);
        assert!(h.abs() < 0.001);
        assert!(s.abs() < 0.001);
    }

    #[test]
    fn color_features_capture_torso_and_head() {
        let frame = synthetic_frame();
        let bbox = BoundingBox::new(0, 0, 100, 200);

        let features = extract_color_features(&frame, &bbox);
        let clothing = features.clothing.expect("torso slice present");
        let skin = features.skin.expect("head slice present");

        // The torso slice is dominated by red: hue bin 0 carries the mass.
        assert!(clothing.values()[0] > 0.9);
        // Warm skin tone lands in the orange hue range.
        assert!(skin.h > 10.0 && skin.h < 50.0);
        assert!(skin.v > 0.5);
    }

    #[test]
    fn identical_crops_produce_identical_features() {
        let frame = synthetic_frame();
        let bbox = BoundingBox::new(10, 10, 80, 180);

        let a = extract_color_features(&frame, &bbox);
        let b = extract_color_features(&frame, &bbox);

        assert_eq!(a.clothing, b.clothing);
        assert_eq!(a.skin, b.skin);
    }

    #[test]
    fn out_of_frame_bbox_yields_empty_features() {
        let frame = synthetic_frame();
        let bbox = BoundingBox::new(500, 500, 50, 50);

        let features = extract_color_features(&frame, &bbox);
        assert!(features.is_empty());
    }

    #[test]
    fn quality_grows_with_area_and_saturates() {
        let small = BoundingBox::new(0, 0, 64, 64);
        let large = BoundingBox::new(0, 0, 512, 1024);

        assert!(area_quality(&small) < area_quality(&large));
        assert!((area_quality(&large) - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn minimum_crop_side_is_enforced() {
        let frame = synthetic_frame();
        assert!(!crop_meets_minimum(&frame, &BoundingBox::new(0, 0, 40, 200)));
        assert!(crop_meets_minimum(&frame, &BoundingBox::new(0, 0, 80, 200)));
    }
}
