//! Event publication/subscription mechanics for the catalog pipeline.
//!
//! Domain-agnostic: this crate knows about topics, partitions, keys and consumer
//! groups, never about products.

pub mod channel;
pub mod envelope;
pub mod event;
pub mod in_memory_channel;

pub use channel::{
    ChannelError, Delivery, EventChannel, Headers, OutboundRecord, RecordPosition, Subscription,
    key_partition,
};
pub use envelope::{EnvelopeError, EventEnvelope};
pub use event::Event;
pub use in_memory_channel::InMemoryEventChannel;
