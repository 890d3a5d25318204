//! Aggregate store trait: durable home of [`ProductAggregateState`] documents.
//!
//! # Design
//!
//! The store holds exactly one document per product and offers optimistic
//! concurrency on `version`. Within one process the router already serializes
//! writes per product, so a [`StoreError::ConcurrencyConflict`] means a second
//! writer (another replica, a manual edit) touched the document; the gate
//! reports it as a transient failure and the event is redelivered against the
//! fresh state.
//!
//! # Implementations
//!
//! - `PostgresAggregateStore` (in `catalog-sync-postgres`): production
//! - `InMemoryAggregateStore` (in `catalog-sync-testing`): tests
//!
//! # Example
//!
//! ```no_run
//! use catalog_sync_core::product::ProductId;
//! use catalog_sync_core::store::{AggregateStore, StoreError};
//!
//! async fn bump<S: AggregateStore>(store: &S) -> Result<(), StoreError> {
//!     let id = ProductId::new("prod-1");
//!     if let Some(mut state) = store.load(&id).await? {
//!         let expected = state.version;
//!         state.version += 1;
//!         store.save(&state, expected).await?;
//!     }
//!     Ok(())
//! }
//! ```

use crate::product::{ProductAggregateState, ProductId};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors that can occur during aggregate store operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The stored version differs from the one the caller read.
    #[error("Concurrency conflict on {product_id}: expected version {expected}, found {actual:?}")]
    ConcurrencyConflict {
        /// Product whose document conflicted.
        product_id: ProductId,
        /// Version the caller expected.
        expected: u64,
        /// Version found, `None` if the document vanished.
        actual: Option<u64>,
    },

    /// `insert` found an existing document.
    #[error("Aggregate already exists: {0}")]
    AlreadyExists(ProductId),

    /// Database connection or query error.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// The stored document could not be (de)serialized.
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

/// Durable storage for product aggregates.
///
/// # Dyn Compatibility
///
/// This trait uses explicit `Pin<Box<dyn Future>>` returns instead of `async fn`
/// so the router can hold it as `Arc<dyn AggregateStore>`.
pub trait AggregateStore: Send + Sync {
    /// Load the document for a product, `None` if it was never created.
    ///
    /// Logically removed products are returned with `removed = true`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DatabaseError`] or [`StoreError::SerializationError`].
    fn load(
        &self,
        product_id: &ProductId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<ProductAggregateState>, StoreError>> + Send + '_>>;

    /// Store the first document for a product.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::AlreadyExists`] if a document is present.
    fn insert(
        &self,
        state: &ProductAggregateState,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>>;

    /// Replace a document if its stored version equals `expected_version`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::ConcurrencyConflict`] when the stored version
    /// differs or the document is missing.
    fn save(
        &self,
        state: &ProductAggregateState,
        expected_version: u64,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>>;

    /// Products that hold at least one automatic badge expiring at or before `now`.
    ///
    /// Removed products are excluded.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DatabaseError`] on query failure.
    fn products_with_expired_badges(
        &self,
        now: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<ProductId>, StoreError>> + Send + '_>>;
}
