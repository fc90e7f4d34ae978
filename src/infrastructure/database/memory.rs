//! In-Memory Person Repository
//!
//! Store-less fallback used when no database is configured, and the fixture
//! for engine and sync tests. Mirrors the persistence contract exactly,
//! including cosine ranking for embedding searches.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::domain::entities::GlobalPerson;
use crate::domain::repositories::{
    EngineCheckpoint, PersonRepository, RepoResult, RepositoryError,
};
use crate::domain::value_objects::AppearanceEmbedding;
use crate::domain::PersonId;

/// Person repository backed by process memory.
#[derive(Default)]
pub struct InMemoryPersonRepository {
    persons: RwLock<HashMap<PersonId, GlobalPerson>>,
    checkpoint: RwLock<Option<EngineCheckpoint>>,
    write_count: AtomicU64,
    fail_writes: AtomicBool,
}

impl InMemoryPersonRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of completed write operations. Used to assert sync idempotence.
    pub fn write_count(&self) -> u64 {
        self.write_count.load(Ordering::Relaxed)
    }

    /// Makes subsequent writes fail, simulating an unavailable store.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }

    fn check_writable(&self) -> RepoResult<()> {
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(RepositoryError::Unavailable(
                "in-memory store is refusing writes".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl PersonRepository for InMemoryPersonRepository {
    async fn find_by_id(&self, id: PersonId) -> RepoResult<Option<GlobalPerson>> {
        Ok(self.persons.read().await.get(&id).cloned())
    }

    async fn load_active_gallery(&self) -> RepoResult<Vec<GlobalPerson>> {
        Ok(self
            .persons
            .read()
            .await
            .values()
            .filter(|person| person.is_active() && person.embedding().is_some())
            .cloned()
            .collect())
    }

    async fn search_by_embedding(
        &self,
        embedding: &AppearanceEmbedding,
        limit: usize,
    ) -> RepoResult<Vec<(GlobalPerson, f32)>> {
        let persons = self.persons.read().await;

        let mut hits: Vec<(GlobalPerson, f32)> = persons
            .values()
            .filter_map(|person| {
                let similarity = person.embedding()?.dot(embedding);
                Some((person.clone(), similarity))
            })
            .collect();

        hits.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.id().cmp(&b.0.id()))
        });
        hits.truncate(limit);
        Ok(hits)
    }

    async fn upsert_all(&self, persons: &[GlobalPerson]) -> RepoResult<()> {
        self.check_writable()?;

        let mut store = self.persons.write().await;
        for person in persons {
            store.insert(person.id(), person.clone());
        }
        self.write_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn max_person_id(&self) -> RepoResult<Option<PersonId>> {
        Ok(self.persons.read().await.keys().max().copied())
    }

    async fn load_checkpoint(&self) -> RepoResult<Option<EngineCheckpoint>> {
        Ok(*self.checkpoint.read().await)
    }

    async fn save_checkpoint(&self, checkpoint: &EngineCheckpoint) -> RepoResult<()> {
        self.check_writable()?;
        *self.checkpoint.write().await = Some(*checkpoint);
        self.write_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::value_objects::{BoundingBox, EMBEDDING_DIMENSION};
    use chrono::Utc;

    fn person_with_embedding(id: PersonId, axis: usize) -> GlobalPerson {
        let mut person = GlobalPerson::new(id, 1, BoundingBox::new(0, 0, 100, 300), Utc::now());
        let mut values = vec![0.0; EMBEDDING_DIMENSION];
        values[axis] = 1.0;
        person.observe_embedding(AppearanceEmbedding::new(values), 0.8, 0.0);
        person
    }

    #[tokio::test]
    async fn upsert_then_find_round_trips() {
        let repo = InMemoryPersonRepository::new();
        repo.upsert_all(&[person_with_embedding(1, 0)]).await.unwrap();

        let found = repo.find_by_id(1).await.unwrap().unwrap();
        assert_eq!(found.id(), 1);
        assert_eq!(repo.max_person_id().await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn search_ranks_by_cosine_similarity() {
        let repo = InMemoryPersonRepository::new();
        repo.upsert_all(&[person_with_embedding(1, 0), person_with_embedding(2, 5)])
            .await
            .unwrap();

        let mut values = vec![0.0; EMBEDDING_DIMENSION];
        values[0] = 1.0;
        let query = AppearanceEmbedding::new(values);

        let hits = repo.search_by_embedding(&query, 5).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].0.id(), 1);
        assert!((hits[0].1 - 1.0).abs() < 0.001);
        assert!(hits[1].1.abs() < 0.001);
    }

    #[tokio::test]
    async fn failed_writes_surface_as_errors() {
        let repo = InMemoryPersonRepository::new();
        repo.fail_writes(true);

        let result = repo.upsert_all(&[person_with_embedding(1, 0)]).await;
        assert!(result.is_err());
        assert_eq!(repo.write_count(), 0);
    }
}
