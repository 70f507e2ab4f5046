//! Infrastructure layer: producer, consumer group, stores, channels, config.

pub mod channel;
pub mod config;
pub mod consumer;
pub mod producer;
pub mod services;
pub mod store;
pub mod workers;


pub use config::{ConfigError, SyncConfig, TopicConfig};
pub use consumer::{ApplyOutcome, ProductConsumer, SkipReason};
pub use producer::{EventProducer, ProducerHandle, PublishError, PublishFailure, PublishReceipt};
pub use services::{Accepted, CommandError, ProductCommands, ProductQueries};
pub use store::{InMemoryProductStore, PostgresProductStore, ProductStore, StoreError};
pub use workers::{ConsumeError, ConsumerHandle, ConsumerWorker};
