//! Appearance Embedding Value Object
//!
//! Represents a 512-dimensional appearance embedding vector. Vectors are
//! L2-normalized by the encoder, so cosine similarity equals the inner
//! product.

use serde::{Deserialize, Serialize};

/// Dimension of the appearance embedding vector.
pub const EMBEDDING_DIMENSION: usize = 512;

/// An L2-normalized appearance embedding for person re-identification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppearanceEmbedding {
    values: Vec<f32>,
}

impl AppearanceEmbedding {
    /// Creates a new embedding from an already-normalized vector.
    ///
    /// # Panics
    /// Panics if the vector length does not match EMBEDDING_DIMENSION.
    pub fn new(values: Vec<f32>) -> Self {
        assert_eq!(
            values.len(),
            EMBEDDING_DIMENSION,
            "Embedding must have {} dimensions, got {}",
            EMBEDDING_DIMENSION,
            values.len()
        );
        Self { values }
    }

    /// Creates an embedding from raw encoder output, normalizing to unit length.
    /// Returns None for a zero vector or a dimension mismatch.
    pub fn from_raw(values: Vec<f32>) -> Option<Self> {
        if values.len() != EMBEDDING_DIMENSION {
            return None;
        }

        let magnitude: f32 = values.iter().map(|x| x * x).sum::<f32>().sqrt();
        if magnitude == 0.0 {
            return None;
        }

        let values = values.into_iter().map(|v| v / magnitude).collect();
        Some(Self { values })
    }

    /// Returns the embedding values.
    pub fn values(&self) -> &[f32] {
        &self.values
    }

    /// Inner product with another embedding. Because both vectors are unit
    /// length this is their cosine similarity, in [-1, 1].
    pub fn dot(&self, other: &AppearanceEmbedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| a * b)
            .sum()
    }

    /// Cosine similarity to another embedding. Alias for [`Self::dot`] on
    /// normalized vectors, kept for call-site clarity.
    pub fn cosine_similarity(&self, other: &AppearanceEmbedding) -> f32 {
        self.dot(other)
    }
}

impl PartialEq for AppearanceEmbedding {
    fn eq(&self, other: &Self) -> bool {
        self.values
            .iter()
            .zip(other.values.iter())
            .all(|(a, b)| (a - b).abs() < f32::EPSILON)
    }
}
