//! Vector Index Service
//!
//! In-memory top-k cosine similarity search over the active gallery's
//! appearance embeddings. Because embeddings are L2-normalized, cosine
//! similarity is the inner product, so the index is a plain inner-product
//! scan. Results are ordered similarity descending, then ascending id, so
//! any replacement implementation must reproduce the same ordering.

use std::cmp::Ordering;

use tokio::sync::RwLock;

use crate::domain::value_objects::AppearanceEmbedding;
use crate::domain::PersonId;

/// A single search hit.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexHit {
    pub person_id: PersonId,
    pub similarity: f32,
}

/// Thread-safe inner-product index over active person embeddings.
/// Writes are serialized; reads may be concurrent.
pub struct VectorIndex {
    entries: RwLock<Vec<(PersonId, AppearanceEmbedding)>>,
}

impl Default for VectorIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl VectorIndex {
    /// Creates an empty index.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
        }
    }

    /// Adds or replaces the embedding for a person.
    pub async fn add(&self, person_id: PersonId, embedding: AppearanceEmbedding) {
        let mut entries = self.entries.write().await;
        match entries.iter_mut().find(|(id, _)| *id == person_id) {
            Some(entry) => entry.1 = embedding,
            None => entries.push((person_id, embedding)),
        }
    }

    /// Removes a person from the index.
    pub async fn remove(&self, person_id: PersonId) {
        let mut entries = self.entries.write().await;
        entries.retain(|(id, _)| *id != person_id);
    }

    /// Top-k entries with similarity at or above `threshold`, sorted by
    /// similarity descending, ties broken by ascending person id.
    pub async fn search(
        &self,
        query: &AppearanceEmbedding,
        k: usize,
        threshold: f32,
    ) -> Vec<IndexHit> {
        let entries = self.entries.read().await;

        let mut hits: Vec<IndexHit> = entries
            .iter()
            .map(|(person_id, embedding)| IndexHit {
                person_id: *person_id,
                similarity: query.dot(embedding),
            })
            .filter(|hit| hit.similarity >= threshold)
            .collect();

        hits.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.person_id.cmp(&b.person_id))
        });
        hits.truncate(k);
        hits
    }

    /// Number of indexed persons.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}
