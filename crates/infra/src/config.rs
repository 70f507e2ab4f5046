//! Configuration loading and representation.
//!
//! Everything comes from environment variables with development defaults.

use std::time::Duration;

use thiserror::Error;

use catalog_products::EventKind;

pub const DEFAULT_CONSUMER_GROUP: &str = "product-group";
pub const DEFAULT_PARTITIONS: u32 = 4;
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 200;
pub const DEFAULT_PRODUCER_QUEUE: usize = 1024;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?} ({reason})")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Topic name per event kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicConfig {
    pub created: String,
    pub updated: String,
    pub stock_updated: String,
    pub deleted: String,
}

impl TopicConfig {
    pub fn topic(&self, kind: EventKind) -> &str {
        match kind {
            EventKind::Created => &self.created,
            EventKind::Updated => &self.updated,
            EventKind::StockUpdated => &self.stock_updated,
            EventKind::Deleted => &self.deleted,
        }
    }
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            created: EventKind::Created.default_topic().to_string(),
            updated: EventKind::Updated.default_topic().to_string(),
            stock_updated: EventKind::StockUpdated.default_topic().to_string(),
            deleted: EventKind::Deleted.default_topic().to_string(),
        }
    }
}

/// Settings for the producer, the consumer group and the backing services.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    pub topics: TopicConfig,
    pub consumer_group: String,
    /// Member name inside the group. Unique per member and stable across restarts, so
    /// a restarted member picks up the records its previous run left unacknowledged.
    pub consumer_name: String,
    pub partitions: u32,
    /// Where skipped or undecodable events are republished; `None` only logs them.
    pub dead_letter_topic: Option<String>,
    /// Pause before a released delivery is picked up again after a store failure.
    pub retry_backoff: Duration,
    pub producer_queue: usize,
    /// Static partition assignment for channels that need one (Redis Streams):
    /// this instance reads partitions `p` with `p % member_count == member_index`.
    pub member_index: u32,
    pub member_count: u32,
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            topics: TopicConfig::default(),
            consumer_group: DEFAULT_CONSUMER_GROUP.to_string(),
            consumer_name: default_consumer_name(0),
            partitions: DEFAULT_PARTITIONS,
            dead_letter_topic: None,
            retry_backoff: Duration::from_millis(DEFAULT_RETRY_BACKOFF_MS),
            producer_queue: DEFAULT_PRODUCER_QUEUE,
            member_index: 0,
            member_count: 1,
            database_url: None,
            redis_url: None,
        }
    }
}

impl SyncConfig {
    /// Read the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from an arbitrary variable source (tests pass a map).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());

        let topics = TopicConfig {
            created: get("CATALOG_TOPIC_CREATED").unwrap_or(defaults.topics.created),
            updated: get("CATALOG_TOPIC_UPDATED").unwrap_or(defaults.topics.updated),
            stock_updated: get("CATALOG_TOPIC_STOCK_UPDATED")
                .unwrap_or(defaults.topics.stock_updated),
            deleted: get("CATALOG_TOPIC_DELETED").unwrap_or(defaults.topics.deleted),
        };

        let partitions = match get("CATALOG_PARTITIONS") {
            Some(v) => parse_positive::<u32>("CATALOG_PARTITIONS", &v)?,
            None => defaults.partitions,
        };
        let retry_backoff = match get("CATALOG_RETRY_BACKOFF_MS") {
            Some(v) => Duration::from_millis(parse::<u64>("CATALOG_RETRY_BACKOFF_MS", &v)?),
            None => defaults.retry_backoff,
        };
        let producer_queue = match get("CATALOG_PRODUCER_QUEUE") {
            Some(v) => parse_positive::<usize>("CATALOG_PRODUCER_QUEUE", &v)?,
            None => defaults.producer_queue,
        };

        let member_count = match get("CATALOG_MEMBER_COUNT") {
            Some(v) => parse_positive::<u32>("CATALOG_MEMBER_COUNT", &v)?,
            None => defaults.member_count,
        };
        let member_index = match get("CATALOG_MEMBER_INDEX") {
            Some(v) => parse::<u32>("CATALOG_MEMBER_INDEX", &v)?,
            None => defaults.member_index,
        };
        if member_index >= member_count {
            return Err(ConfigError::Invalid {
                var: "CATALOG_MEMBER_INDEX",
                value: member_index.to_string(),
                reason: format!("must be below CATALOG_MEMBER_COUNT ({member_count})"),
            });
        }

        Ok(Self {
            topics,
            consumer_group: get("CATALOG_CONSUMER_GROUP").unwrap_or(defaults.consumer_group),
            consumer_name: get("CATALOG_CONSUMER_NAME")
                .unwrap_or_else(|| default_consumer_name(member_index)),
            partitions,
            dead_letter_topic: get("CATALOG_DEAD_LETTER_TOPIC"),
            retry_backoff,
            producer_queue,
            member_index,
            member_count,
            database_url: get("DATABASE_URL"),
            redis_url: get("REDIS_URL"),
        })
    }
}

fn default_consumer_name(member_index: u32) -> String {
    format!("consumer-{member_index}")
}

fn parse<T>(var: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: core::str::FromStr,
    T::Err: core::fmt::Display,
{
    value.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason: e.to_string(),
    })
}

fn parse_positive<T>(var: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: core::str::FromStr + PartialOrd + Default,
    T::Err: core::fmt::Display,
{
    let parsed = parse::<T>(var, value)?;
    if parsed <= T::default() {
        return Err(ConfigError::Invalid {
            var,
            value: value.to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(parsed)
}
