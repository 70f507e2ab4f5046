use chrono::{DateTime, Utc};
use thiserror::Error;

use catalog_core::EventId;

use crate::channel::{Delivery, OutboundRecord};
use crate::event::Event;

pub const HEADER_EVENT_ID: &str = "event-id";
pub const HEADER_EVENT_TYPE: &str = "event-type";
pub const HEADER_EVENT_VERSION: &str = "event-version";
pub const HEADER_OCCURRED_AT: &str = "occurred-at";

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("failed to serialize event payload: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("failed to deserialize event payload from {topic}/{partition}@{offset}: {source}")]
    Deserialize {
        topic: String,
        partition: u32,
        offset: u64,
        #[source]
        source: serde_json::Error,
    },
}

/// Envelope for an event: the payload plus the metadata that travels as record headers.
///
/// The payload itself is serialized bare, so the wire body of a record is exactly
/// the event's own JSON object.
#[derive(Debug, Clone, PartialEq)]
pub struct EventEnvelope<E> {
    event_id: EventId,
    event_type: String,
    version: u32,
    occurred_at: DateTime<Utc>,
    partition_key: Option<String>,
    payload: E,
}

impl<E: Event> EventEnvelope<E> {
    /// Wrap a freshly produced event.
    pub fn new(payload: E) -> Self {
        Self {
            event_id: EventId::new(),
            event_type: payload.event_type().to_string(),
            version: payload.version(),
            occurred_at: Utc::now(),
            partition_key: payload.partition_key(),
            payload,
        }
    }

    /// Build the channel record for `topic`, keyed by the event's partition key.
    pub fn to_record(&self, topic: impl Into<String>) -> Result<OutboundRecord, EnvelopeError> {
        let body = serde_json::to_string(&self.payload).map_err(EnvelopeError::Serialize)?;

        let mut record = OutboundRecord::new(topic, body)
            .with_header(HEADER_EVENT_ID, self.event_id.to_string())
            .with_header(HEADER_EVENT_TYPE, self.event_type.clone())
            .with_header(HEADER_EVENT_VERSION, self.version.to_string())
            .with_header(HEADER_OCCURRED_AT, self.occurred_at.to_rfc3339());
        if let Some(key) = &self.partition_key {
            record = record.with_key(key.clone());
        }
        Ok(record)
    }

    /// Rebuild an envelope from a delivered record.
    ///
    /// `decode` turns the bare JSON body into the event; which event type a body holds
    /// is a property of the topic, so the caller picks the decoder. Missing headers
    /// (records written by producers that send none) fall back to values derived from
    /// the payload.
    pub fn from_delivery(
        delivery: &Delivery,
        decode: impl FnOnce(&str) -> Result<E, serde_json::Error>,
    ) -> Result<Self, EnvelopeError> {
        let payload = decode(&delivery.payload).map_err(|source| EnvelopeError::Deserialize {
            topic: delivery.topic.clone(),
            partition: delivery.partition,
            offset: delivery.offset,
            source,
        })?;

        let event_id = delivery
            .header(HEADER_EVENT_ID)
            .and_then(|v| v.parse::<EventId>().ok())
            .unwrap_or_default();
        let event_type = delivery
            .header(HEADER_EVENT_TYPE)
            .map(str::to_string)
            .unwrap_or_else(|| payload.event_type().to_string());
        let version = delivery
            .header(HEADER_EVENT_VERSION)
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or_else(|| payload.version());
        let occurred_at = delivery
            .header(HEADER_OCCURRED_AT)
            .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        Ok(Self {
            event_id,
            event_type,
            version,
            occurred_at,
            partition_key: delivery.key.clone().or_else(|| payload.partition_key()),
            payload,
        })
    }
}

impl<E> EventEnvelope<E> {
    pub fn event_id(&self) -> EventId {
        self.event_id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn partition_key(&self) -> Option<&str> {
        self.partition_key.as_deref()
    }

    pub fn payload(&self) -> &E {
        &self.payload
    }

    pub fn into_payload(self) -> E {
        self.payload
    }
}
