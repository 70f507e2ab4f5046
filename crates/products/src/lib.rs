//! Products catalog domain.
//!
//! The product record, the command inputs that describe mutation intent, and the four
//! events that carry that intent to the store. Pure, deterministic logic only (no IO).

pub mod events;
pub mod product;

pub use events::{
    EventKind, ProductCreated, ProductDeleted, ProductEvent, ProductStockUpdated, ProductUpdated,
};
pub use product::{Product, ProductChanges, ProductInput, validate_stock};
