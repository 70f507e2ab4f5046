//! Applies product events to the store.
//!
//! Handlers are idempotent under redelivery: creation is an upsert, updates overwrite,
//! deletion of an absent id is a no-op. Wire events get the same field checks as
//! commands before anything is written.

use chrono::Utc;
use tracing::{debug, instrument, warn};

use catalog_core::{DomainResult, ProductId};
use catalog_products::{
    Product, ProductCreated, ProductDeleted, ProductEvent, ProductStockUpdated, ProductUpdated,
};

use crate::store::{ProductStore, StoreError};

/// What applying one event did to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Upserted(ProductId),
    Deleted { id: ProductId, existed: bool },
    /// Nothing was written.
    Skipped(SkipReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Update or stock change for an id the store does not hold (lost update).
    MissingRecord(ProductId),
    /// Creation event without a product id.
    MissingId,
    /// Field values a stored product may not hold (negative stock, blank name, ...).
    Invalid { id: ProductId, reason: String },
}

impl core::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            SkipReason::MissingRecord(id) => write!(f, "no stored product with id {id}"),
            SkipReason::MissingId => f.write_str("creation event carries no product id"),
            SkipReason::Invalid { id, reason } => write!(f, "invalid event for {id}: {reason}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProductConsumer<S> {
    store: S,
}

impl<S> ProductConsumer<S>
where
    S: ProductStore,
{
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Dispatch to the handler of the event's kind.
    pub async fn apply(&self, event: &ProductEvent) -> Result<ApplyOutcome, StoreError> {
        match event {
            ProductEvent::Created(e) => self.on_created(e).await,
            ProductEvent::Updated(e) => self.on_updated(e).await,
            ProductEvent::StockUpdated(e) => self.on_stock_updated(e).await,
            ProductEvent::Deleted(e) => self.on_deleted(e).await,
        }
    }

    #[instrument(skip(self, event), fields(product_id = ?event.id))]
    pub async fn on_created(&self, event: &ProductCreated) -> Result<ApplyOutcome, StoreError> {
        let Some(id) = event.id else {
            warn!("creation event without id skipped");
            return Ok(ApplyOutcome::Skipped(SkipReason::MissingId));
        };
        if let Some(skipped) = rejected(id, event.validate()) {
            return Ok(skipped);
        }

        self.store
            .upsert(Product::created(id, event, Utc::now()))
            .await?;
        debug!("product created");
        Ok(ApplyOutcome::Upserted(id))
    }

    #[instrument(skip(self, event), fields(product_id = %event.id))]
    pub async fn on_updated(&self, event: &ProductUpdated) -> Result<ApplyOutcome, StoreError> {
        if let Some(skipped) = rejected(event.id, event.validate()) {
            return Ok(skipped);
        }
        let Some(mut product) = self.store.find_by_id(event.id).await? else {
            warn!("update for unknown product dropped");
            return Ok(ApplyOutcome::Skipped(SkipReason::MissingRecord(event.id)));
        };

        product.apply_update(event);
        self.store.upsert(product).await?;
        debug!("product updated");
        Ok(ApplyOutcome::Upserted(event.id))
    }

    #[instrument(skip(self, event), fields(product_id = %event.id, stock = event.stock))]
    pub async fn on_stock_updated(
        &self,
        event: &ProductStockUpdated,
    ) -> Result<ApplyOutcome, StoreError> {
        if let Some(skipped) = rejected(event.id, event.validate()) {
            return Ok(skipped);
        }
        let Some(mut product) = self.store.find_by_id(event.id).await? else {
            warn!("stock update for unknown product dropped");
            return Ok(ApplyOutcome::Skipped(SkipReason::MissingRecord(event.id)));
        };

        product.apply_stock(event.stock);
        self.store.upsert(product).await?;
        debug!("product stock updated");
        Ok(ApplyOutcome::Upserted(event.id))
    }

    #[instrument(skip(self, event), fields(product_id = %event.id))]
    pub async fn on_deleted(&self, event: &ProductDeleted) -> Result<ApplyOutcome, StoreError> {
        let existed = self.store.delete_by_id(event.id).await?;
        debug!(existed, "product deleted");
        Ok(ApplyOutcome::Deleted {
            id: event.id,
            existed,
        })
    }
}

fn rejected(id: ProductId, checked: DomainResult<()>) -> Option<ApplyOutcome> {
    let err = checked.err()?;
    warn!(error = %err, "invalid event skipped");
    Some(ApplyOutcome::Skipped(SkipReason::Invalid {
        id,
        reason: err.to_string(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryProductStore;

    fn created(id: i64) -> ProductCreated {
        ProductCreated {
            id: Some(ProductId::new(id)),
            name: "A".to_string(),
            description: "first".to_string(),
            price: 10.0,
            stock: 5,
        }
    }

    #[tokio::test]
    async fn created_then_stock_updated() {
        let consumer = ProductConsumer::new(InMemoryProductStore::new());
        consumer.on_created(&created(1)).await.unwrap();
        consumer
            .on_stock_updated(&ProductStockUpdated {
                id: ProductId::new(1),
                stock: 2,
            })
            .await
            .unwrap();

        let p = consumer.store().find_by_id(ProductId::new(1)).await.unwrap().unwrap();
        assert_eq!((p.name.as_str(), p.price, p.stock, p.active), ("A", 10.0, 2, true));
    }

    #[tokio::test]
    async fn redelivered_creation_keeps_one_record() {
        let consumer = ProductConsumer::new(InMemoryProductStore::new());
        consumer.on_created(&created(1)).await.unwrap();
        consumer.on_created(&created(1)).await.unwrap();

        assert_eq!(consumer.store().len(), 1);
    }

    #[tokio::test]
    async fn update_keeps_active_flag_and_creation_time() {
        let consumer = ProductConsumer::new(InMemoryProductStore::new());
        consumer.on_created(&created(4)).await.unwrap();
        let before = consumer.store().find_by_id(ProductId::new(4)).await.unwrap().unwrap();

        let outcome = consumer
            .on_updated(&ProductUpdated {
                id: ProductId::new(4),
                name: "B".to_string(),
                description: "second".to_string(),
                price: 12.5,
                stock: 9,
            })
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Upserted(ProductId::new(4)));

        let after = consumer.store().find_by_id(ProductId::new(4)).await.unwrap().unwrap();
        assert_eq!(after.name, "B");
        assert_eq!(after.stock, 9);
        assert!(after.active);
        assert_eq!(after.created_at, before.created_at);
    }

    #[tokio::test]
    async fn changes_to_unknown_products_are_skipped() {
        let consumer = ProductConsumer::new(InMemoryProductStore::new());
        let id = ProductId::new(99);

        let stock = consumer
            .on_stock_updated(&ProductStockUpdated { id, stock: 3 })
            .await
            .unwrap();
        let update = consumer
            .on_updated(&ProductUpdated {
                id,
                name: "x".to_string(),
                description: String::new(),
                price: 1.0,
                stock: 1,
            })
            .await
            .unwrap();

        assert_eq!(stock, ApplyOutcome::Skipped(SkipReason::MissingRecord(id)));
        assert_eq!(update, ApplyOutcome::Skipped(SkipReason::MissingRecord(id)));
        assert!(consumer.store().is_empty());
    }

    #[tokio::test]
    async fn out_of_range_fields_are_never_stored() {
        let consumer = ProductConsumer::new(InMemoryProductStore::new());
        let mut negative = created(1);
        negative.stock = -7;

        let outcome = consumer.on_created(&negative).await.unwrap();
        assert!(matches!(
            outcome,
            ApplyOutcome::Skipped(SkipReason::Invalid { id, .. }) if id == ProductId::new(1)
        ));
        assert!(consumer.store().is_empty());

        consumer.on_created(&created(1)).await.unwrap();
        let stock = consumer
            .on_stock_updated(&ProductStockUpdated {
                id: ProductId::new(1),
                stock: -1,
            })
            .await
            .unwrap();
        let update = consumer
            .on_updated(&ProductUpdated {
                id: ProductId::new(1),
                name: "B".to_string(),
                description: String::new(),
                price: f64::NAN,
                stock: 1,
            })
            .await
            .unwrap();
        assert!(matches!(stock, ApplyOutcome::Skipped(SkipReason::Invalid { .. })));
        assert!(matches!(update, ApplyOutcome::Skipped(SkipReason::Invalid { .. })));

        let stored = consumer.store().find_by_id(ProductId::new(1)).await.unwrap().unwrap();
        assert_eq!((stored.name.as_str(), stored.stock), ("A", 5));
    }

    #[tokio::test]
    async fn deleting_an_absent_id_is_not_an_error() {
        let consumer = ProductConsumer::new(InMemoryProductStore::new());
        let outcome = consumer
            .on_deleted(&ProductDeleted { id: ProductId::new(8) })
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ApplyOutcome::Deleted {
                id: ProductId::new(8),
                existed: false
            }
        );
    }

    #[tokio::test]
    async fn creation_without_id_writes_nothing() {
        let consumer = ProductConsumer::new(InMemoryProductStore::new());
        let mut event = created(1);
        event.id = None;

        let outcome = consumer.apply(&event.into()).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Skipped(SkipReason::MissingId));
        assert!(consumer.store().is_empty());
    }
}
