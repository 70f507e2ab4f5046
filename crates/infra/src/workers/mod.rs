//! Long-running background workers.

pub mod consumer_worker;

pub use consumer_worker::{ConsumeError, ConsumerHandle, ConsumerWorker};
