use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use catalog_core::{DomainError, DomainResult, Entity, ProductId};

use crate::events::{ProductCreated, ProductUpdated};

/// Stored product record (the store is the single source of truth for it).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: ProductId,
    pub name: String,
    pub description: String,
    pub price: f64,
    pub stock: i32,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl Product {
    /// Record produced by the first application of a creation event.
    pub fn created(id: ProductId, event: &ProductCreated, now: DateTime<Utc>) -> Self {
        Self {
            id,
            name: event.name.clone(),
            description: event.description.clone(),
            price: event.price,
            stock: event.stock,
            active: true,
            created_at: now,
        }
    }

    /// Overwrite the mutable fields from an update event.
    ///
    /// `id`, `active` and `created_at` are untouched.
    pub fn apply_update(&mut self, event: &ProductUpdated) {
        self.name = event.name.clone();
        self.description = event.description.clone();
        self.price = event.price;
        self.stock = event.stock;
    }

    pub fn apply_stock(&mut self, stock: i32) {
        self.stock = stock;
    }
}

impl Entity for Product {
    type Id = ProductId;

    fn id(&self) -> ProductId {
        self.id
    }
}

/// Creation intent as handed over by the request layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductInput {
    pub id: Option<ProductId>,
    pub name: String,
    pub description: String,
    pub price: f64,
    pub stock: i32,
}

impl ProductInput {
    /// Ids are caller-supplied; a creation without one cannot be keyed or stored.
    pub fn require_id(&self) -> DomainResult<ProductId> {
        self.id
            .ok_or_else(|| DomainError::invalid_id("product id must be supplied on creation"))
    }

    pub fn validate(&self) -> DomainResult<()> {
        self.require_id()?;
        validate_fields(&self.name, self.price, self.stock)
    }
}

/// Full replacement of a product's mutable fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductChanges {
    pub name: String,
    pub description: String,
    pub price: f64,
    pub stock: i32,
}

impl ProductChanges {
    pub fn validate(&self) -> DomainResult<()> {
        validate_fields(&self.name, self.price, self.stock)
    }

    /// Merge with `id` into the shape returned to the caller.
    pub fn with_id(self, id: ProductId) -> ProductInput {
        ProductInput {
            id: Some(id),
            name: self.name,
            description: self.description,
            price: self.price,
            stock: self.stock,
        }
    }
}

pub fn validate_stock(stock: i32) -> DomainResult<()> {
    if stock < 0 {
        return Err(DomainError::validation(format!(
            "stock must be non-negative (got {stock})"
        )));
    }
    Ok(())
}

pub(crate) fn validate_fields(name: &str, price: f64, stock: i32) -> DomainResult<()> {
    if name.trim().is_empty() {
        return Err(DomainError::validation("product name cannot be empty"));
    }
    if !price.is_finite() || price < 0.0 {
        return Err(DomainError::validation(format!(
            "price must be a non-negative number (got {price})"
        )));
    }
    validate_stock(stock)
}
