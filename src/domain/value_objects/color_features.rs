//! Color Feature Value Objects
//!
//! HSV clothing histogram and skin tone features used by the color matching
//! stage when no appearance embedding is available or decisive.

use serde::{Deserialize, Serialize};

/// Histogram bins per HSV channel.
pub const HIST_BINS: usize = 16;

/// Total clothing histogram dimension (three concatenated channels).
pub const CLOTHING_HIST_DIMENSION: usize = HIST_BINS * 3;

/// A 48-D HSV histogram of the torso region, L1-normalized per channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClothingHistogram {
    values: Vec<f32>,
}

impl ClothingHistogram {
    /// Creates a histogram from raw per-channel bin counts, normalizing each
    /// channel to unit L1 mass. Returns None if any channel is empty.
    pub fn from_counts(counts: [[f32; HIST_BINS]; 3]) -> Option<Self> {
        let mut values = Vec::with_capacity(CLOTHING_HIST_DIMENSION);

        for channel in counts.iter() {
            let total: f32 = channel.iter().sum();
            if total <= 0.0 {
                return None;
            }
            values.extend(channel.iter().map(|c| c / total));
        }

        Some(Self { values })
    }

    /// Reconstructs a histogram from stored values.
    pub fn from_values(values: Vec<f32>) -> Option<Self> {
        if values.len() != CLOTHING_HIST_DIMENSION {
            return None;
        }
        Some(Self { values })
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    /// Pearson correlation with another histogram, in [-1, 1].
    pub fn correlation(&self, other: &ClothingHistogram) -> f32 {
        let n = CLOTHING_HIST_DIMENSION as f32;
        let mean_a: f32 = self.values.iter().sum::<f32>() / n;
        let mean_b: f32 = other.values.iter().sum::<f32>() / n;

        let mut cov = 0.0;
        let mut var_a = 0.0;
        let mut var_b = 0.0;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            let da = a - mean_a;
            let db = b - mean_b;
            cov += da * db;
            var_a += da * da;
            var_b += db * db;
        }

        if var_a == 0.0 || var_b == 0.0 {
            return 0.0;
        }

        cov / (var_a * var_b).sqrt()
    }

    /// Blends another histogram into this one with exponential moving average
    /// weight `alpha`, re-normalizing each channel afterwards.
    pub fn blend(&mut self, other: &ClothingHistogram, alpha: f32) {
        for (v, o) in self.values.iter_mut().zip(other.values.iter()) {
            *v = alpha * o + (1.0 - alpha) * *v;
        }

        for channel in self.values.chunks_mut(HIST_BINS) {
            let total: f32 = channel.iter().sum();
            if total > 0.0 {
                for v in channel.iter_mut() {
                    *v /= total;
                }
            }
        }
    }
}

/// Mean HSV of the head region, a 3-D skin tone proxy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SkinTone {
    pub h: f32,
    pub s: f32,
    pub v: f32,
}

impl SkinTone {
    pub fn new(h: f32, s: f32, v: f32) -> Self {
        Self { h, s, v }
    }

    /// Euclidean distance to another skin tone.
    pub fn distance(&self, other: &SkinTone) -> f32 {
        let dh = self.h - other.h;
        let ds = self.s - other.s;
        let dv = self.v - other.v;
        (dh * dh + ds * ds + dv * dv).sqrt()
    }

    /// Blends another tone into this one with EMA weight `alpha`.
    pub fn blend(&mut self, other: &SkinTone, alpha: f32) {
        self.h = alpha * other.h + (1.0 - alpha) * self.h;
        self.s = alpha * other.s + (1.0 - alpha) * self.s;
        self.v = alpha * other.v + (1.0 - alpha) * self.v;
    }
}

/// Combined color features of one observation. Either part may be missing
/// when its crop slice clips to nothing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ColorFeatures {
    pub clothing: Option<ClothingHistogram>,
    pub skin: Option<SkinTone>,
}

impl ColorFeatures {
    pub fn new(clothing: Option<ClothingHistogram>, skin: Option<SkinTone>) -> Self {
        Self { clothing, skin }
    }

    pub fn is_empty(&self) -> bool {
        self.clothing.is_none() && self.skin.is_none()
    }
}

/// Weighted color match score between an observation and a stored person:
/// `clothing_weight * correl01 + skin_weight * gaussian(distance / sigma)`,
/// where the Pearson correlation is mapped from [-1, 1] to [0, 1].
/// Returns None when neither side has a comparable component.
pub fn color_match_score(
    query: &ColorFeatures,
    stored: &ColorFeatures,
    clothing_weight: f32,
    skin_weight: f32,
    skin_sigma: f32,
) -> Option<f32> {
    let clothing_score = match (&query.clothing, &stored.clothing) {
        (Some(a), Some(b)) => Some((a.correlation(b) + 1.0) / 2.0),
        _ => None,
    };

    let skin_score = match (&query.skin, &stored.skin) {
        (Some(a), Some(b)) => {
            let x = a.distance(b) / skin_sigma;
            Some((-0.5 * x * x).exp())
        }
        _ => None,
    };

    match (clothing_score, skin_score) {
        (Some(c), Some(s)) => Some(clothing_weight * c + skin_weight * s),
        // A single available component is scored against the full weight mass
        // so partial features are not penalized for what was never observed.
        (Some(c), None) => Some(c),
        (None, Some(s)) => Some(s),
        (None, None) => None,
    }
}
