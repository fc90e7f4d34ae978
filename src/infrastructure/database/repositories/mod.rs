//! Repository Implementations
//!
//! PostgreSQL implementations of domain repository interfaces.

mod person_repository;

pub use person_repository::*;
