//! Domain Layer
//!
//! Contains core business entities and domain rules.
//! This layer has no external dependencies.

pub mod entities;
pub mod events;
pub mod repositories;
pub mod value_objects;

/// Facility-wide camera identifier.
pub type CameraId = u32;

/// Room identifier from the facility layout.
pub type RoomId = u32;

/// Stable, facility-wide person identifier minted by the identity engine.
/// Monotonically increasing and never reused.
pub type PersonId = i64;

/// Camera-scoped track identifier produced by the local tracker.
pub type LocalTrackId = u64;
