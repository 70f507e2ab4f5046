//! Command and query entry points used by the request layer.

pub mod commands;
pub mod queries;

use thiserror::Error;

use catalog_core::DomainError;
use catalog_events::RecordPosition;

use crate::producer::{PublishError, PublishReceipt};
use crate::store::StoreError;

pub use commands::ProductCommands;
pub use queries::ProductQueries;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Optimistic result of a command.
///
/// `value` is what the caller gets back immediately; it reflects the intent, not
/// the stored state. The receipt reports whether the event reached the channel.
#[derive(Debug)]
#[must_use]
pub struct Accepted<T> {
    value: T,
    receipt: PublishReceipt,
}

impl<T> Accepted<T> {
    pub(crate) fn new(value: T, receipt: PublishReceipt) -> Self {
        Self { value, receipt }
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    /// Keep the value and stop tracking the publish.
    pub fn into_value(self) -> T {
        self.value
    }

    pub fn into_parts(self) -> (T, PublishReceipt) {
        (self.value, self.receipt)
    }

    /// Wait until the event is on the channel.
    ///
    /// This does not wait for the consumer; the store may still lag behind.
    pub async fn confirmed(self) -> Result<(T, RecordPosition), PublishError> {
        let position = self.receipt.await?;
        Ok((self.value, position))
    }
}
