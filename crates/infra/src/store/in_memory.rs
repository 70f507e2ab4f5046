use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;

use catalog_core::{Entity, ProductId};
use catalog_products::Product;

use super::{ProductStore, StoreError};

/// In-memory product store for tests/dev.
///
/// `find_all` returns records in id order.
#[derive(Debug, Default)]
pub struct InMemoryProductStore {
    inner: RwLock<BTreeMap<ProductId, Product>>,
}

impl InMemoryProductStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.read().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ProductStore for InMemoryProductStore {
    async fn find_all(&self) -> Result<Vec<Product>, StoreError> {
        let map = self.inner.read().map_err(|_| StoreError::Poisoned)?;
        Ok(map.values().cloned().collect())
    }

    async fn find_by_id(&self, id: ProductId) -> Result<Option<Product>, StoreError> {
        let map = self.inner.read().map_err(|_| StoreError::Poisoned)?;
        Ok(map.get(&id).cloned())
    }

    async fn upsert(&self, product: Product) -> Result<(), StoreError> {
        let mut map = self.inner.write().map_err(|_| StoreError::Poisoned)?;
        map.insert(product.id(), product);
        Ok(())
    }

    async fn delete_by_id(&self, id: ProductId) -> Result<bool, StoreError> {
        let mut map = self.inner.write().map_err(|_| StoreError::Poisoned)?;
        Ok(map.remove(&id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn product(id: i64, name: &str) -> Product {
        Product {
            id: ProductId::new(id),
            name: name.to_string(),
            description: String::new(),
            price: 1.0,
            stock: 1,
            active: true,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn upsert_replaces_by_id() {
        let store = InMemoryProductStore::new();
        store.upsert(product(1, "a")).await.unwrap();
        store.upsert(product(1, "b")).await.unwrap();

        assert_eq!(store.len(), 1);
        let found = store.find_by_id(ProductId::new(1)).await.unwrap().unwrap();
        assert_eq!(found.name, "b");
    }

    #[tokio::test]
    async fn find_all_is_ordered_by_id() {
        let store = InMemoryProductStore::new();
        for id in [3, 1, 2] {
            store.upsert(product(id, "x")).await.unwrap();
        }
        let ids: Vec<i64> = store
            .find_all()
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.id.get())
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn delete_reports_whether_a_record_existed() {
        let store = InMemoryProductStore::new();
        store.upsert(product(5, "x")).await.unwrap();

        assert!(store.delete_by_id(ProductId::new(5)).await.unwrap());
        assert!(!store.delete_by_id(ProductId::new(5)).await.unwrap());
        assert!(store.is_empty());
    }
}
