use catalog_core::ProductId;
use catalog_products::Product;

use crate::store::{ProductStore, StoreError};

/// Read side: straight to the store, no caching.
#[derive(Debug, Clone)]
pub struct ProductQueries<S> {
    store: S,
}

impl<S> ProductQueries<S>
where
    S: ProductStore,
{
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub async fn find_all(&self) -> Result<Vec<Product>, StoreError> {
        self.store.find_all().await
    }

    pub async fn find_by_id(&self, id: ProductId) -> Result<Option<Product>, StoreError> {
        self.store.find_by_id(id).await
    }
}
