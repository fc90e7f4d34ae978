//! Domain Events
//!
//! Events that represent significant occurrences in the identity pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::value_objects::BoundingBox;
use crate::domain::{CameraId, PersonId};

/// The matcher stage that produced an identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStage {
    /// Existing track binding.
    Binding,
    /// Co-observation on an overlapping camera.
    Spatial,
    /// Running-mean bbox dimensions.
    Dimension,
    /// Clothing histogram and skin tone.
    Color,
    /// Deep appearance embedding.
    Appearance,
    /// Reactivated from the persistent store.
    StoreRecall,
}

/// A domain event that can be broadcast to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    /// A new global identity was minted.
    PersonCreated(PersonCreatedEvent),
    /// An existing person was identified on a camera.
    PersonIdentified(PersonIdentifiedEvent),
    /// A person timed out of the active gallery.
    PersonDeactivated(PersonDeactivatedEvent),
    /// A person was renamed.
    PersonRenamed(PersonRenamedEvent),
    /// A camera worker changed state.
    CameraStatusChanged(CameraStatusChangedEvent),
}

/// Event emitted when a new global identity is minted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonCreatedEvent {
    pub person_id: PersonId,
    pub assigned_name: Option<String>,
    pub camera_id: CameraId,
    pub bounding_box: BoundingBox,
    pub timestamp: DateTime<Utc>,
}

/// Event emitted when a known person is identified on a camera.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonIdentifiedEvent {
    pub person_id: PersonId,
    pub assigned_name: Option<String>,
    pub camera_id: CameraId,
    pub bounding_box: BoundingBox,
    pub stage: MatchStage,
    pub similarity: Option<f32>,
    pub timestamp: DateTime<Utc>,
}

/// Event emitted when a person leaves the active gallery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonDeactivatedEvent {
    pub person_id: PersonId,
    pub last_seen_at: DateTime<Utc>,
    pub timestamp: DateTime<Utc>,
}

/// Event emitted when a person is renamed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonRenamedEvent {
    pub person_id: PersonId,
    pub name: String,
    pub timestamp: DateTime<Utc>,
}

/// Event emitted when a camera worker changes state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraStatusChangedEvent {
    pub camera_id: CameraId,
    pub camera_name: String,
    pub status: String,
    pub timestamp: DateTime<Utc>,
}

impl DomainEvent {
    /// Returns the event timestamp.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            DomainEvent::PersonCreated(e) => e.timestamp,
            DomainEvent::PersonIdentified(e) => e.timestamp,
            DomainEvent::PersonDeactivated(e) => e.timestamp,
            DomainEvent::PersonRenamed(e) => e.timestamp,
            DomainEvent::CameraStatusChanged(e) => e.timestamp,
        }
    }

    /// Returns the event type name.
    pub fn event_type(&self) -> &'static str {
        match self {
            DomainEvent::PersonCreated(_) => "person_created",
            DomainEvent::PersonIdentified(_) => "person_identified",
            DomainEvent::PersonDeactivated(_) => "person_deactivated",
            DomainEvent::PersonRenamed(_) => "person_renamed",
            DomainEvent::CameraStatusChanged(_) => "camera_status_changed",
        }
    }
}
