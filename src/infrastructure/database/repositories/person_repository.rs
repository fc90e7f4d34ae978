//! Person Repository Implementation
//!
//! PostgreSQL persistence with a pgvector cosine index over embeddings.

use async_trait::async_trait;
use pgvector::Vector;
use sqlx::PgPool;

use crate::domain::entities::GlobalPerson;
use crate::domain::repositories::{EngineCheckpoint, PersonRepository, RepoResult};
use crate::domain::value_objects::AppearanceEmbedding;
use crate::domain::PersonId;
use crate::infrastructure::database::models::{
    EngineStateRow, PersonBindings, PersonHitRow, PersonRow,
};

const PERSON_COLUMNS: &str = r#"
    global_id, assigned_name, embedding, embedding_quality,
    clothing_hist, skin_tone, color_samples,
    avg_height_px, avg_width_px, dimension_samples,
    cameras_visited, current_positions,
    first_seen_at, last_seen_at, total_appearances, is_active
"#;

/// PostgreSQL person repository.
pub struct PgPersonRepository {
    pool: PgPool,
}

impl PgPersonRepository {
    /// Creates a new person repository.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PersonRepository for PgPersonRepository {
    async fn find_by_id(&self, id: PersonId) -> RepoResult<Option<GlobalPerson>> {
        let row: Option<PersonRow> = sqlx::query_as(&format!(
            r#"SELECT {PERSON_COLUMNS} FROM persons WHERE global_id = $1"#
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(PersonRow::into_person))
    }

    async fn load_active_gallery(&self) -> RepoResult<Vec<GlobalPerson>> {
        let rows: Vec<PersonRow> = sqlx::query_as(&format!(
            r#"
            SELECT {PERSON_COLUMNS}
            FROM persons
            WHERE is_active = TRUE AND embedding IS NOT NULL
            ORDER BY last_seen_at DESC
            "#
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(PersonRow::into_person).collect())
    }

    async fn search_by_embedding(
        &self,
        embedding: &AppearanceEmbedding,
        limit: usize,
    ) -> RepoResult<Vec<(GlobalPerson, f32)>> {
        let query = Vector::from(embedding.values().to_vec());

        let rows: Vec<PersonHitRow> = sqlx::query_as(&format!(
            r#"
            SELECT {PERSON_COLUMNS}, 1 - (embedding <=> $1) AS similarity
            FROM persons
            WHERE embedding IS NOT NULL
            ORDER BY embedding <=> $1, global_id
            LIMIT $2
            "#
        ))
        .bind(query)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| (row.person.into_person(), row.similarity as f32))
            .collect())
    }

    async fn upsert_all(&self, persons: &[GlobalPerson]) -> RepoResult<()> {
        let mut tx = self.pool.begin().await?;

        for person in persons {
            let bindings = PersonBindings::from_person(person);

            sqlx::query(
                r#"
                INSERT INTO persons (
                    global_id, assigned_name, embedding, embedding_quality,
                    clothing_hist, skin_tone, color_samples,
                    avg_height_px, avg_width_px, dimension_samples,
                    cameras_visited, current_positions,
                    first_seen_at, last_seen_at, total_appearances, is_active
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
                ON CONFLICT (global_id) DO UPDATE SET
                    assigned_name = EXCLUDED.assigned_name,
                    embedding = EXCLUDED.embedding,
                    embedding_quality = EXCLUDED.embedding_quality,
                    clothing_hist = EXCLUDED.clothing_hist,
                    skin_tone = EXCLUDED.skin_tone,
                    color_samples = EXCLUDED.color_samples,
                    avg_height_px = EXCLUDED.avg_height_px,
                    avg_width_px = EXCLUDED.avg_width_px,
                    dimension_samples = EXCLUDED.dimension_samples,
                    cameras_visited = EXCLUDED.cameras_visited,
                    current_positions = EXCLUDED.current_positions,
                    last_seen_at = EXCLUDED.last_seen_at,
                    total_appearances = EXCLUDED.total_appearances,
                    is_active = EXCLUDED.is_active
                "#,
            )
            .bind(person.id())
            .bind(person.assigned_name())
            .bind(bindings.embedding)
            .bind(person.embedding_quality())
            .bind(bindings.clothing_hist)
            .bind(bindings.skin_tone)
            .bind(person.color_samples() as i32)
            .bind(person.avg_height_px())
            .bind(person.avg_width_px())
            .bind(person.dimension_samples() as i32)
            .bind(bindings.cameras_visited)
            .bind(bindings.current_positions)
            .bind(person.first_seen_at())
            .bind(person.last_seen_at())
            .bind(person.total_appearances() as i64)
            .bind(person.is_active())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn max_person_id(&self) -> RepoResult<Option<PersonId>> {
        let result: (Option<i64>,) = sqlx::query_as(r#"SELECT MAX(global_id) FROM persons"#)
            .fetch_one(&self.pool)
            .await?;

        Ok(result.0)
    }

    async fn load_checkpoint(&self) -> RepoResult<Option<EngineCheckpoint>> {
        let row: Option<EngineStateRow> = sqlx::query_as(
            r#"SELECT next_global_id, next_name_index FROM engine_state WHERE id = 1"#,
        )
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| EngineCheckpoint {
            next_global_id: row.next_global_id,
            next_name_index: row.next_name_index.max(0) as u32,
        }))
    }

    async fn save_checkpoint(&self, checkpoint: &EngineCheckpoint) -> RepoResult<()> {
        sqlx::query(
            r#"
            INSERT INTO engine_state (id, next_global_id, next_name_index, updated_at)
            VALUES (1, $1, $2, NOW())
            ON CONFLICT (id) DO UPDATE SET
                next_global_id = EXCLUDED.next_global_id,
                next_name_index = EXCLUDED.next_name_index,
                updated_at = NOW()
            "#,
        )
        .bind(checkpoint.next_global_id)
        .bind(checkpoint.next_name_index as i32)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
