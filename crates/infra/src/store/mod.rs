//! Product record storage.
//!
//! The store is the only durable state in the pipeline. It is written exclusively
//! by the event consumer and read by the query side.

pub mod in_memory;
pub mod postgres;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use catalog_core::ProductId;
use catalog_products::Product;

pub use in_memory::InMemoryProductStore;
pub use postgres::PostgresProductStore;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store state poisoned")]
    Poisoned,

    #[error("store backend error: {0}")]
    Backend(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(value: sqlx::Error) -> Self {
        StoreError::Backend(value.to_string())
    }
}

/// Keyed product storage.
///
/// Must tolerate concurrent writes to distinct ids; ordering of writes to the same
/// id is the caller's concern.
#[async_trait]
pub trait ProductStore: Send + Sync {
    async fn find_all(&self) -> Result<Vec<Product>, StoreError>;

    async fn find_by_id(&self, id: ProductId) -> Result<Option<Product>, StoreError>;

    /// Insert or replace the record with `product.id`.
    async fn upsert(&self, product: Product) -> Result<(), StoreError>;

    /// Remove the record; returns whether one existed.
    async fn delete_by_id(&self, id: ProductId) -> Result<bool, StoreError>;
}

#[async_trait]
impl<S> ProductStore for Arc<S>
where
    S: ProductStore + ?Sized,
{
    async fn find_all(&self) -> Result<Vec<Product>, StoreError> {
        (**self).find_all().await
    }

    async fn find_by_id(&self, id: ProductId) -> Result<Option<Product>, StoreError> {
        (**self).find_by_id(id).await
    }

    async fn upsert(&self, product: Product) -> Result<(), StoreError> {
        (**self).upsert(product).await
    }

    async fn delete_by_id(&self, id: ProductId) -> Result<bool, StoreError> {
        (**self).delete_by_id(id).await
    }
}
