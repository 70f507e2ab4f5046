//! Event channel abstraction (mechanics only).
//!
//! The channel is the **message log** between the command side and the consumer:
//! named topics, each split into partitions, read by named consumer groups.
//!
//! ## Delivery Model
//!
//! - **Keyed partitioning**: records with the same key always land in the same
//!   partition, so they are read back in publish order
//! - **At-least-once**: a record stays pending until its consumer commits it; a
//!   released (or never committed) record is delivered again
//! - **Consumer groups**: members of one group split a topic's partitions between
//!   them; each partition is read by exactly one member at a time
//! - **Serial partitions**: a subscription hands out at most one in-flight record per
//!   partition, the next one becomes available only after commit or release
//!
//! Consumers must be idempotent - processing the same record twice must leave the
//! same state behind.
//!
//! ```text
//! Producer ──publish(key)──► topic ─┬─ partition 0 ─► group member A
//!                                   ├─ partition 1 ─► group member B
//!                                   └─ partition 2 ─► group member A
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

/// Record metadata carried next to the payload (event id, type, timestamps).
pub type Headers = BTreeMap<String, String>;

/// Channel operation error.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// The channel was shut down; no more records will be accepted or delivered.
    #[error("channel closed")]
    Closed,

    /// Commit/release of a record the subscription does not currently hold.
    #[error("stale delivery: {topic}/{partition}@{offset} is not in flight")]
    StaleDelivery {
        topic: String,
        partition: u32,
        offset: u64,
    },

    /// Internal lock poisoning (in-memory implementation).
    #[error("channel state poisoned")]
    Poisoned,

    /// Transport/broker failure (Redis, network, ...).
    #[error("channel backend error: {0}")]
    Backend(String),
}

/// A record ready to be appended to a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRecord {
    pub topic: String,
    /// Partition key; `None` lets the channel pick a partition (no ordering guarantee).
    pub key: Option<String>,
    pub headers: Headers,
    pub payload: String,
}

impl OutboundRecord {
    pub fn new(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            key: None,
            headers: Headers::new(),
            payload: payload.into(),
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Partition a key maps to among `partitions`: 64-bit FNV-1a of the key's UTF-8
/// bytes, modulo the partition count.
///
/// Placement is part of the wire contract. Every channel implementation routes keys
/// through this, and the result must not change between builds or processes.
pub fn key_partition(key: &str, partitions: u32) -> u32 {
    let hash = key.bytes().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u64::from(byte)).wrapping_mul(FNV_PRIME)
    });
    (hash % u64::from(partitions.max(1))) as u32
}

/// Where a record ended up after a successful publish.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordPosition {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
}

/// A record handed to a subscriber.
///
/// Hold on to it until processing finished, then pass it back to
/// [`Subscription::commit`] or [`Subscription::release`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
    pub key: Option<String>,
    pub headers: Headers,
    pub payload: String,
}

impl Delivery {
    pub fn position(&self) -> RecordPosition {
        RecordPosition {
            topic: self.topic.clone(),
            partition: self.partition,
            offset: self.offset,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

/// One consumer-group member's view of one topic.
#[async_trait]
pub trait Subscription: Send {
    /// Wait for the next record on an assigned partition.
    ///
    /// Returns `Ok(None)` once the channel is closed.
    async fn next(&mut self) -> Result<Option<Delivery>, ChannelError>;

    /// Take a record that is available right now, without waiting for new ones.
    ///
    /// `Ok(None)` means every assigned partition is either empty or has a record in
    /// flight. A record appended before this call started is seen by it.
    async fn try_next(&mut self) -> Result<Option<Delivery>, ChannelError>;

    /// Mark the record processed; the group's position moves past it.
    async fn commit(&mut self, delivery: &Delivery) -> Result<(), ChannelError>;

    /// Give the record back without committing; it will be delivered again.
    async fn release(&mut self, delivery: &Delivery) -> Result<(), ChannelError>;
}

/// Partitioned, at-least-once publish/subscribe log.
///
/// Implementations must be safe to share across tasks; the producer and every
/// consumer task hold the same channel.
#[async_trait]
pub trait EventChannel: Send + Sync {
    type Subscription: Subscription + 'static;

    /// Append a record to its topic. Resolves once the channel accepted it.
    async fn publish(&self, record: OutboundRecord) -> Result<RecordPosition, ChannelError>;

    /// Join `group` on `topic` as member `consumer`.
    ///
    /// A group that does not exist yet starts at the beginning of the topic.
    async fn subscribe(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
    ) -> Result<Self::Subscription, ChannelError>;
}

#[async_trait]
impl<C> EventChannel for Arc<C>
where
    C: EventChannel + ?Sized,
{
    type Subscription = C::Subscription;

    async fn publish(&self, record: OutboundRecord) -> Result<RecordPosition, ChannelError> {
        (**self).publish(record).await
    }

    async fn subscribe(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
    ) -> Result<Self::Subscription, ChannelError> {
        (**self).subscribe(topic, group, consumer).await
    }
}

#[async_trait]
impl<S> Subscription for Box<S>
where
    S: Subscription + ?Sized,
{
    async fn next(&mut self) -> Result<Option<Delivery>, ChannelError> {
        (**self).next().await
    }

    async fn try_next(&mut self) -> Result<Option<Delivery>, ChannelError> {
        (**self).try_next().await
    }

    async fn commit(&mut self, delivery: &Delivery) -> Result<(), ChannelError> {
        (**self).commit(delivery).await
    }

    async fn release(&mut self, delivery: &Delivery) -> Result<(), ChannelError> {
        (**self).release(delivery).await
    }
}
