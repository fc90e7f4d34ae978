//! Database Row Models
//!
//! SQLx-compatible structs for database row mapping, plus conversions
//! between rows and domain entities.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use pgvector::Vector;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::domain::entities::{GlobalPerson, TrackedPosition};
use crate::domain::value_objects::{
    AppearanceEmbedding, BoundingBox, ClothingHistogram, SkinTone,
};
use crate::domain::CameraId;

/// Person database row.
#[derive(Debug, FromRow)]
pub struct PersonRow {
    pub global_id: i64,
    pub assigned_name: Option<String>,
    pub embedding: Option<Vector>,
    pub embedding_quality: f32,
    pub clothing_hist: Option<Vector>,
    pub skin_tone: Option<Vector>,
    pub color_samples: i32,
    pub avg_height_px: f32,
    pub avg_width_px: f32,
    pub dimension_samples: i32,
    pub cameras_visited: Vec<i32>,
    pub current_positions: sqlx::types::Json<HashMap<String, PositionJson>>,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub total_appearances: i64,
    pub is_active: bool,
}

/// Person row joined with a query similarity, for vector searches.
#[derive(Debug, FromRow)]
pub struct PersonHitRow {
    #[sqlx(flatten)]
    pub person: PersonRow,
    pub similarity: f64,
}

/// JSON shape of one live position: bbox as [x, y, width, height].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionJson {
    pub bbox: [i32; 4],
    pub seen_at: DateTime<Utc>,
}

impl PersonRow {
    /// Converts a row into the domain entity. Malformed vector columns are
    /// treated as absent.
    pub fn into_person(self) -> GlobalPerson {
        let embedding = self
            .embedding
            .and_then(|v| AppearanceEmbedding::from_raw(v.to_vec()));
        let clothing_hist = self
            .clothing_hist
            .and_then(|v| ClothingHistogram::from_values(v.to_vec()));
        let skin_tone = self.skin_tone.and_then(|v| {
            let values = v.to_vec();
            (values.len() == 3).then(|| SkinTone::new(values[0], values[1], values[2]))
        });

        let cameras_visited: BTreeSet<CameraId> = self
            .cameras_visited
            .iter()
            .filter_map(|id| u32::try_from(*id).ok())
            .collect();

        let current_positions: HashMap<CameraId, TrackedPosition> = self
            .current_positions
            .0
            .into_iter()
            .filter_map(|(camera_id, position)| {
                let camera_id: CameraId = camera_id.parse().ok()?;
                let [x, y, width, height] = position.bbox;
                Some((
                    camera_id,
                    TrackedPosition {
                        bbox: BoundingBox::new(x, y, width, height),
                        seen_at: position.seen_at,
                    },
                ))
            })
            .collect();

        GlobalPerson::from_store(
            self.global_id,
            self.assigned_name,
            embedding,
            self.embedding_quality,
            clothing_hist,
            skin_tone,
            self.color_samples.max(0) as u32,
            self.avg_height_px,
            self.avg_width_px,
            self.dimension_samples.max(0) as u32,
            cameras_visited,
            current_positions,
            self.first_seen_at,
            self.last_seen_at,
            self.total_appearances.max(0) as u64,
            self.is_active,
        )
    }
}

/// Column values extracted from a person for binding into an upsert.
pub struct PersonBindings {
    pub embedding: Option<Vector>,
    pub clothing_hist: Option<Vector>,
    pub skin_tone: Option<Vector>,
    pub cameras_visited: Vec<i32>,
    pub current_positions: sqlx::types::Json<HashMap<String, PositionJson>>,
}

impl PersonBindings {
    pub fn from_person(person: &GlobalPerson) -> Self {
        let embedding = person
            .embedding()
            .map(|e| Vector::from(e.values().to_vec()));
        let clothing_hist = person
            .clothing_hist()
            .map(|h| Vector::from(h.values().to_vec()));
        let skin_tone = person
            .skin_tone()
            .map(|t| Vector::from(vec![t.h, t.s, t.v]));

        let cameras_visited: Vec<i32> = person
            .cameras_visited()
            .iter()
            .map(|id| *id as i32)
            .collect();

        let current_positions: HashMap<String, PositionJson> = person
            .current_positions()
            .iter()
            .map(|(camera_id, position)| {
                (
                    camera_id.to_string(),
                    PositionJson {
                        bbox: [
                            position.bbox.x(),
                            position.bbox.y(),
                            position.bbox.width(),
                            position.bbox.height(),
                        ],
                        seen_at: position.seen_at,
                    },
                )
            })
            .collect();

        Self {
            embedding,
            clothing_hist,
            skin_tone,
            cameras_visited,
            current_positions: sqlx::types::Json(current_positions),
        }
    }
}

/// Engine checkpoint database row.
#[derive(Debug, FromRow)]
pub struct EngineStateRow {
    pub next_global_id: i64,
    pub next_name_index: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row() -> PersonRow {
        let mut positions = HashMap::new();
        positions.insert(
            "3".to_string(),
            PositionJson {
                bbox: [10, 20, 100, 300],
                seen_at: Utc::now(),
            },
        );

        PersonRow {
            global_id: 7,
            assigned_name: Some("Alex".to_string()),
            embedding: Some(Vector::from(vec![1.0; 512])),
            embedding_quality: 0.8,
            clothing_hist: None,
            skin_tone: Some(Vector::from(vec![20.0, 0.5, 0.6])),
            color_samples: 2,
            avg_height_px: 300.0,
            avg_width_px: 100.0,
            dimension_samples: 5,
            cameras_visited: vec![1, 3],
            current_positions: sqlx::types::Json(positions),
            first_seen_at: Utc::now(),
            last_seen_at: Utc::now(),
            total_appearances: 12,
            is_active: true,
        }
    }

    #[test]
    fn row_converts_to_person() {
        let person = row().into_person();

        assert_eq!(person.id(), 7);
        assert_eq!(person.assigned_name(), Some("Alex"));
        assert!(person.embedding().is_some());
        assert!(person.skin_tone().is_some());
        assert_eq!(person.cameras_visited().len(), 2);
        assert_eq!(person.current_positions().len(), 1);
        assert!(person.current_positions().contains_key(&3));
    }

    #[test]
    fn malformed_skin_tone_is_dropped() {
        let mut row = row();
        row.skin_tone = Some(Vector::from(vec![1.0, 2.0]));
        let person = row.into_person();
        assert!(person.skin_tone().is_none());
    }

    #[test]
    fn bindings_round_trip_through_row() {
        let person = row().into_person();
        let bindings = PersonBindings::from_person(&person);

        assert!(bindings.embedding.is_some());
        assert_eq!(bindings.cameras_visited, vec![1, 3]);
        assert_eq!(bindings.current_positions.0.len(), 1);
    }
}
