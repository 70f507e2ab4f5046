use serde::Serialize;

/// A domain event that can travel through an [`EventChannel`](crate::EventChannel).
///
/// Events are:
/// - **immutable** (treat them as facts)
/// - **versioned** (schema evolution)
/// - **keyed** (the key decides the partition and therefore the ordering scope)
pub trait Event: Serialize + Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable event name/type identifier (e.g. "catalog.product.created").
    fn event_type(&self) -> &'static str;

    /// Schema version for this event type.
    fn version(&self) -> u32;

    /// Partition key; events for the same entity must return the same key.
    fn partition_key(&self) -> Option<String>;
}
