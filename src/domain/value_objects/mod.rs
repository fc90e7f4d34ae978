//! Value Objects
//!
//! Immutable domain objects defined by their attributes rather than identity.

mod appearance_embedding;
mod bounding_box;
mod color_features;

pub use appearance_embedding::*;
pub use bounding_box::*;
pub use color_features::*;
