//! Write side.
//!
//! Commands never touch the store. Each one validates its input, publishes one event
//! and returns an [`Accepted`] right away; the consumer makes the change visible later.

use tracing::{instrument, warn};

use catalog_core::ProductId;
use catalog_products::{
    Product, ProductChanges, ProductCreated, ProductDeleted, ProductInput, ProductStockUpdated,
    ProductUpdated, validate_stock,
};

use crate::producer::EventProducer;
use crate::store::ProductStore;

use super::{Accepted, CommandError, ProductQueries};

#[derive(Debug, Clone)]
pub struct ProductCommands<S> {
    producer: EventProducer,
    queries: ProductQueries<S>,
}

impl<S> ProductCommands<S>
where
    S: ProductStore,
{
    pub fn new(producer: EventProducer, queries: ProductQueries<S>) -> Self {
        Self { producer, queries }
    }

    /// Publish a creation event; returns `input` unchanged.
    ///
    /// No existence check: creating an existing id replaces it once consumed.
    #[instrument(skip(self, input), fields(product_id = ?input.id))]
    pub fn create(&self, input: ProductInput) -> Result<Accepted<ProductInput>, CommandError> {
        input.validate()?;
        let receipt = self.producer.publish(ProductCreated {
            id: input.id,
            name: input.name.clone(),
            description: input.description.clone(),
            price: input.price,
            stock: input.stock,
        });
        Ok(Accepted::new(input, receipt))
    }

    /// Publish a full update; returns `changes` merged with `id`.
    ///
    /// The stored record may end up different (or absent) if the product does not exist
    /// when the event is consumed.
    #[instrument(skip(self, changes), fields(product_id = %id))]
    pub fn update(
        &self,
        id: ProductId,
        changes: ProductChanges,
    ) -> Result<Accepted<ProductInput>, CommandError> {
        changes.validate()?;
        let receipt = self.producer.publish(ProductUpdated {
            id,
            name: changes.name.clone(),
            description: changes.description.clone(),
            price: changes.price,
            stock: changes.stock,
        });
        Ok(Accepted::new(changes.with_id(id), receipt))
    }

    /// Publish a stock change, then read the current record and patch its stock.
    ///
    /// The returned product is advisory: the read races the consumer, and is `None`
    /// when the record is not stored (yet, or any more) or the read fails.
    #[instrument(skip(self), fields(product_id = %id))]
    pub async fn update_stock(
        &self,
        id: ProductId,
        new_stock: i32,
    ) -> Result<Accepted<Option<Product>>, CommandError> {
        validate_stock(new_stock)?;
        let receipt = self.producer.publish(ProductStockUpdated {
            id,
            stock: new_stock,
        });

        let current = match self.queries.find_by_id(id).await {
            Ok(found) => found,
            Err(err) => {
                warn!(error = %err, "advisory read after stock update failed");
                None
            }
        };
        let value = current.map(|mut product| {
            product.apply_stock(new_stock);
            product
        });
        Ok(Accepted::new(value, receipt))
    }

    #[instrument(skip(self), fields(product_id = %id))]
    pub fn delete(&self, id: ProductId) -> Result<Accepted<()>, CommandError> {
        let receipt = self.producer.publish(ProductDeleted { id });
        Ok(Accepted::new((), receipt))
    }

    pub async fn find_all(&self) -> Result<Vec<Product>, CommandError> {
        Ok(self.queries.find_all().await?)
    }

    pub async fn find_by_id(&self, id: ProductId) -> Result<Option<Product>, CommandError> {
        Ok(self.queries.find_by_id(id).await?)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use catalog_core::DomainError;
    use catalog_events::InMemoryEventChannel;
    use chrono::Utc;

    use super::*;
    use crate::config::TopicConfig;
    use crate::producer::ProducerHandle;
    use crate::store::InMemoryProductStore;

    fn setup() -> (
        InMemoryEventChannel,
        Arc<InMemoryProductStore>,
        ProductCommands<Arc<InMemoryProductStore>>,
        ProducerHandle,
    ) {
        let channel = InMemoryEventChannel::new();
        let store = Arc::new(InMemoryProductStore::new());
        let (producer, handle) =
            EventProducer::spawn(channel.clone(), TopicConfig::default(), 16, None);
        let commands = ProductCommands::new(producer, ProductQueries::new(store.clone()));
        (channel, store, commands, handle)
    }

    fn input(id: Option<i64>) -> ProductInput {
        ProductInput {
            id: id.map(ProductId::new),
            name: "Mug".to_string(),
            description: "ceramic".to_string(),
            price: 8.0,
            stock: 12,
        }
    }

    #[tokio::test]
    async fn create_returns_input_and_publishes_without_storing() {
        let (channel, store, commands, handle) = setup();

        let accepted = commands.create(input(Some(1))).unwrap();
        assert_eq!(accepted.value(), &input(Some(1)));
        let (value, position) = accepted.confirmed().await.unwrap();
        assert_eq!(value.id, Some(ProductId::new(1)));
        assert_eq!(position.topic, "product-created");

        assert_eq!(channel.records("product-created").len(), 1);
        assert!(store.is_empty());
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn create_requires_an_id() {
        let (channel, _store, commands, handle) = setup();

        let err = commands.create(input(None)).unwrap_err();
        assert!(matches!(err, CommandError::Domain(DomainError::InvalidId(_))));
        assert!(channel.records("product-created").is_empty());
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn update_returns_merge_of_id_and_changes() {
        let (_channel, _store, commands, handle) = setup();

        let changes = ProductChanges {
            name: "Cup".to_string(),
            description: "glass".to_string(),
            price: 4.0,
            stock: 1,
        };
        let accepted = commands.update(ProductId::new(3), changes).unwrap();
        assert_eq!(accepted.value().id, Some(ProductId::new(3)));
        assert_eq!(accepted.value().name, "Cup");
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn negative_stock_is_rejected_before_publish() {
        let (channel, _store, commands, handle) = setup();

        let err = commands.update_stock(ProductId::new(1), -1).await.unwrap_err();
        assert!(matches!(err, CommandError::Domain(DomainError::Validation(_))));
        assert!(channel.records("product-stock-updated").is_empty());
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn update_stock_patches_the_stored_copy() {
        let (channel, store, commands, handle) = setup();
        store
            .upsert(Product {
                id: ProductId::new(2),
                name: "Mug".to_string(),
                description: "ceramic".to_string(),
                price: 8.0,
                stock: 12,
                active: true,
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        let accepted = commands.update_stock(ProductId::new(2), 4).await.unwrap();
        assert_eq!(accepted.value().as_ref().map(|p| p.stock), Some(4));

        // The store itself is left to the consumer.
        let stored = store.find_by_id(ProductId::new(2)).await.unwrap().unwrap();
        assert_eq!(stored.stock, 12);

        accepted.confirmed().await.unwrap();
        assert_eq!(channel.records("product-stock-updated").len(), 1);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn update_stock_of_unknown_product_returns_none() {
        let (_channel, _store, commands, handle) = setup();

        let accepted = commands.update_stock(ProductId::new(99), 3).await.unwrap();
        assert!(accepted.value().is_none());
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn delete_succeeds_for_any_id() {
        let (channel, _store, commands, handle) = setup();

        commands.delete(ProductId::new(42)).unwrap().confirmed().await.unwrap();
        let records = channel.records("product-deleted");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].payload, r#"{"id":42}"#);
        handle.shutdown().await;
    }
}
