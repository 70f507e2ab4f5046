//! `catalog-core`: domain foundation building blocks.
//!
//! Pure primitives shared by every catalog crate (no IO, no async).

pub mod entity;
pub mod error;
pub mod id;

pub use entity::Entity;
pub use error::{DomainError, DomainResult};
pub use id::{EventId, ProductId};
