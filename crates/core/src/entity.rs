//! Entity trait: identity that survives state changes.

/// A record with a stable, storage-level identity.
///
/// Stores key records by this id, which is what makes `upsert` well defined.
pub trait Entity {
    type Id: Copy + Eq + core::hash::Hash + core::fmt::Debug + core::fmt::Display;

    fn id(&self) -> Self::Id;
}
