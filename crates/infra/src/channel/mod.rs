//! Infrastructure-backed event channel implementations.
//!
//! The channel abstraction and the in-memory implementation live in `catalog-events`.

#[cfg(feature = "redis")]
pub mod redis_streams;

#[cfg(feature = "redis")]
pub use redis_streams::{RedisStreamsChannel, RedisStreamsSubscription};
