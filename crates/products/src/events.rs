use serde::{Deserialize, Serialize};

use catalog_core::{DomainResult, ProductId};
use catalog_events::Event;

use crate::product::{validate_fields, validate_stock};

/// The four kinds of product events; each travels on its own topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Created,
    Updated,
    StockUpdated,
    Deleted,
}

impl EventKind {
    pub const ALL: [EventKind; 4] = [
        EventKind::Created,
        EventKind::Updated,
        EventKind::StockUpdated,
        EventKind::Deleted,
    ];

    /// Topic name used when none is configured.
    pub fn default_topic(self) -> &'static str {
        match self {
            EventKind::Created => "product-created",
            EventKind::Updated => "product-updated",
            EventKind::StockUpdated => "product-stock-updated",
            EventKind::Deleted => "product-deleted",
        }
    }

    pub fn event_type(self) -> &'static str {
        match self {
            EventKind::Created => "catalog.product.created",
            EventKind::Updated => "catalog.product.updated",
            EventKind::StockUpdated => "catalog.product.stock_updated",
            EventKind::Deleted => "catalog.product.deleted",
        }
    }
}

impl core::fmt::Display for EventKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.event_type())
    }
}

/// Event: ProductCreated.
///
/// `id` may be absent on the wire (producers that leave id assignment to storage);
/// such events cannot be keyed or applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductCreated {
    #[serde(default)]
    pub id: Option<ProductId>,
    pub name: String,
    pub description: String,
    pub price: f64,
    pub stock: i32,
}

/// Event: ProductUpdated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductUpdated {
    pub id: ProductId,
    pub name: String,
    pub description: String,
    pub price: f64,
    pub stock: i32,
}

/// Event: ProductStockUpdated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductStockUpdated {
    pub id: ProductId,
    pub stock: i32,
}

/// Event: ProductDeleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductDeleted {
    pub id: ProductId,
}

/// Any product event.
///
/// Serializes to the bare payload of its variant; the topic, not a tag, tells
/// readers which variant a payload is (see [`ProductEvent::decode`]).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ProductEvent {
    Created(ProductCreated),
    Updated(ProductUpdated),
    StockUpdated(ProductStockUpdated),
    Deleted(ProductDeleted),
}

impl ProductEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ProductEvent::Created(_) => EventKind::Created,
            ProductEvent::Updated(_) => EventKind::Updated,
            ProductEvent::StockUpdated(_) => EventKind::StockUpdated,
            ProductEvent::Deleted(_) => EventKind::Deleted,
        }
    }

    pub fn product_id(&self) -> Option<ProductId> {
        match self {
            ProductEvent::Created(e) => e.id,
            ProductEvent::Updated(e) => Some(e.id),
            ProductEvent::StockUpdated(e) => Some(e.id),
            ProductEvent::Deleted(e) => Some(e.id),
        }
    }

    /// Parse a wire payload read from the topic of `kind`.
    pub fn decode(kind: EventKind, payload: &str) -> Result<Self, serde_json::Error> {
        Ok(match kind {
            EventKind::Created => ProductEvent::Created(serde_json::from_str(payload)?),
            EventKind::Updated => ProductEvent::Updated(serde_json::from_str(payload)?),
            EventKind::StockUpdated => ProductEvent::StockUpdated(serde_json::from_str(payload)?),
            EventKind::Deleted => ProductEvent::Deleted(serde_json::from_str(payload)?),
        })
    }
}

impl Event for ProductEvent {
    fn event_type(&self) -> &'static str {
        self.kind().event_type()
    }

    fn version(&self) -> u32 {
        1
    }

    fn partition_key(&self) -> Option<String> {
        self.product_id().map(ProductId::partition_key)
    }
}

impl ProductCreated {
    /// Field checks the record must pass before it is stored.
    pub fn validate(&self) -> DomainResult<()> {
        validate_fields(&self.name, self.price, self.stock)
    }
}

impl ProductUpdated {
    pub fn validate(&self) -> DomainResult<()> {
        validate_fields(&self.name, self.price, self.stock)
    }
}

impl ProductStockUpdated {
    pub fn validate(&self) -> DomainResult<()> {
        validate_stock(self.stock)
    }
}

impl From<ProductCreated> for ProductEvent {
    fn from(value: ProductCreated) -> Self {
        ProductEvent::Created(value)
    }
}

impl From<ProductUpdated> for ProductEvent {
    fn from(value: ProductUpdated) -> Self {
        ProductEvent::Updated(value)
    }
}

impl From<ProductStockUpdated> for ProductEvent {
    fn from(value: ProductStockUpdated) -> Self {
        ProductEvent::StockUpdated(value)
    }
}

impl From<ProductDeleted> for ProductEvent {
    fn from(value: ProductDeleted) -> Self {
        ProductEvent::Deleted(value)
    }
}
