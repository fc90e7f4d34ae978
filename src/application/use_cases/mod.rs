//! Use Cases
//!
//! Application-specific business rules and orchestration.

pub mod process_frame;
pub mod query_rooms;

pub use process_frame::*;
pub use query_rooms::*;
