//! In-memory aggregate store.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)]

use catalog_sync_core::product::{ProductAggregateState, ProductId};
use catalog_sync_core::store::{AggregateStore, StoreError};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// `HashMap`-backed aggregate store with optimistic concurrency.
///
/// Besides the trait, it offers direct accessors for assertions and a few
/// knobs to simulate a slow or contended database.
#[derive(Clone, Debug, Default)]
pub struct InMemoryAggregateStore {
    documents: Arc<RwLock<HashMap<ProductId, ProductAggregateState>>>,
    save_delay: Arc<RwLock<Option<Duration>>>,
    conflicts_to_inject: Arc<AtomicUsize>,
    saves: Arc<AtomicUsize>,
}

impl InMemoryAggregateStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Put a document in place, bypassing version checks.
    pub fn seed(&self, state: ProductAggregateState) {
        self.documents
            .write()
            .unwrap()
            .insert(state.product_id.clone(), state);
    }

    /// Current document for a product.
    #[must_use]
    pub fn get(&self, product_id: &ProductId) -> Option<ProductAggregateState> {
        self.documents.read().unwrap().get(product_id).cloned()
    }

    /// Number of documents.
    #[must_use]
    pub fn len(&self) -> usize {
        self.documents.read().unwrap().len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.documents.read().unwrap().is_empty()
    }

    /// Number of successful `insert`/`save` calls.
    #[must_use]
    pub fn write_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// Sleep inside every `save`, after reading the stored version.
    ///
    /// Widens the read-modify-write window so tests can prove callers
    /// serialize writes themselves.
    pub fn set_save_delay(&self, delay: Option<Duration>) {
        *self.save_delay.write().unwrap() = delay;
    }

    /// Make the next `n` saves fail with a concurrency conflict.
    pub fn inject_conflicts(&self, n: usize) {
        self.conflicts_to_inject.store(n, Ordering::SeqCst);
    }

    fn take_injected_conflict(&self) -> bool {
        self.conflicts_to_inject
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl AggregateStore for InMemoryAggregateStore {
    fn load(
        &self,
        product_id: &ProductId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<ProductAggregateState>, StoreError>> + Send + '_>>
    {
        let product_id = product_id.clone();
        Box::pin(async move { Ok(self.get(&product_id)) })
    }

    fn insert(
        &self,
        state: &ProductAggregateState,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>> {
        let state = state.clone();
        Box::pin(async move {
            let mut documents = self.documents.write().unwrap();
            if documents.contains_key(&state.product_id) {
                return Err(StoreError::AlreadyExists(state.product_id));
            }
            documents.insert(state.product_id.clone(), state);
            self.saves.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn save(
        &self,
        state: &ProductAggregateState,
        expected_version: u64,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>> {
        let state = state.clone();
        Box::pin(async move {
            let actual = self
                .documents
                .read()
                .unwrap()
                .get(&state.product_id)
                .map(|s| s.version);

            let delay = *self.save_delay.read().unwrap();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            if self.take_injected_conflict() || actual != Some(expected_version) {
                return Err(StoreError::ConcurrencyConflict {
                    product_id: state.product_id,
                    expected: expected_version,
                    actual,
                });
            }

            // Last writer wins after the delay, exactly like an unguarded
            // read-modify-write against a real database.
            self.documents
                .write()
                .unwrap()
                .insert(state.product_id.clone(), state);
            self.saves.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn products_with_expired_badges(
        &self,
        now: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<ProductId>, StoreError>> + Send + '_>> {
        Box::pin(async move {
            let mut ids: Vec<ProductId> = self
                .documents
                .read()
                .unwrap()
                .values()
                .filter(|s| !s.removed)
                .filter(|s| s.badges.iter().any(|b| b.is_auto() && b.is_expired(now)))
                .map(|s| s.product_id.clone())
                .collect();
            ids.sort();
            Ok(ids)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn save_checks_version() {
        let store = InMemoryAggregateStore::new();
        let mut state = ProductAggregateState::new(ProductId::new("p"), Utc::now());
        store.insert(&state).await.unwrap();
        assert!(matches!(
            store.insert(&state).await,
            Err(StoreError::AlreadyExists(_))
        ));

        state.version = 2;
        store.save(&state, 1).await.unwrap();
        let err = store.save(&state, 1).await.unwrap_err();
        assert_eq!(
            err,
            StoreError::ConcurrencyConflict {
                product_id: ProductId::new("p"),
                expected: 1,
                actual: Some(2),
            }
        );
        assert_eq!(store.write_count(), 2);
    }

    #[tokio::test]
    async fn injected_conflicts_are_consumed() {
        let store = InMemoryAggregateStore::new();
        let mut state = ProductAggregateState::new(ProductId::new("p"), Utc::now());
        store.insert(&state).await.unwrap();
        store.inject_conflicts(1);
        state.version = 2;
        assert!(store.save(&state, 1).await.is_err());
        assert!(store.save(&state, 1).await.is_ok());
    }
}
