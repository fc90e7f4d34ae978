//! Repository Traits
//!
//! Abstractions for data persistence (Dependency Inversion Principle).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::entities::GlobalPerson;
use crate::domain::value_objects::AppearanceEmbedding;
use crate::domain::PersonId;

/// Result type for repository operations.
pub type RepoResult<T> = Result<T, RepositoryError>;

/// Repository error types.
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Engine counters persisted across restarts so that global ids stay
/// strictly increasing and auto-names are never recycled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineCheckpoint {
    pub next_global_id: PersonId,
    pub next_name_index: u32,
}

impl Default for EngineCheckpoint {
    fn default() -> Self {
        Self {
            next_global_id: 1,
            next_name_index: 0,
        }
    }
}

/// Person repository interface over the durable store.
#[async_trait]
pub trait PersonRepository: Send + Sync {
    /// Finds a person by global id.
    async fn find_by_id(&self, id: PersonId) -> RepoResult<Option<GlobalPerson>>;

    /// Loads all active persons that carry an embedding, for the cold-start
    /// gallery backfill.
    async fn load_active_gallery(&self) -> RepoResult<Vec<GlobalPerson>>;

    /// Ranks stored persons by cosine similarity to the query embedding,
    /// best first, including inactive persons. Used as the cold-read
    /// fallback when the in-memory gallery misses.
    async fn search_by_embedding(
        &self,
        embedding: &AppearanceEmbedding,
        limit: usize,
    ) -> RepoResult<Vec<(GlobalPerson, f32)>>;

    /// Upserts the given persons; last writer wins on conflicting ids.
    async fn upsert_all(&self, persons: &[GlobalPerson]) -> RepoResult<()>;

    /// Largest global id ever persisted, if any person exists.
    async fn max_person_id(&self) -> RepoResult<Option<PersonId>>;

    /// Loads the persisted engine checkpoint.
    async fn load_checkpoint(&self) -> RepoResult<Option<EngineCheckpoint>>;

    /// Stores the engine checkpoint.
    async fn save_checkpoint(&self, checkpoint: &EngineCheckpoint) -> RepoResult<()>;
}
