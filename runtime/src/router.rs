//! Per-product single-writer lanes.
//!
//! Every mutation of a product's aggregate runs inside that product's lane:
//! load, fold, persist. Two mutations for the same product never overlap;
//! mutations for different products run fully in parallel.
//!
//! ```text
//!   route(p-1, m1) ──┐
//!   route(p-1, m2) ──┼──> lane p-1 (Mutex) ──> load ─> apply ─> save
//!   route(p-2, m3) ──┼──> lane p-2 (Mutex) ──> load ─> apply ─> save
//!                    │
//!          lanes: RwLock<HashMap<ProductId, Arc<Mutex<()>>>>
//! ```
//!
//! Lanes are created on demand and dropped once nobody holds or waits on
//! them. Waiting for a lane is bounded by `acquire_timeout`; a timeout is a
//! transient failure the broker will redeliver.
//!
//! Once acquired, the critical section runs on its own task, so a caller
//! that gives up mid-write cannot leave a half-persisted aggregate behind.

use crate::metrics::RouterMetrics;
use catalog_sync_core::environment::Clock;
use catalog_sync_core::product::ProductId;
use catalog_sync_core::recalc::{self, FoldOutcome, Mutation, RecalcContext, RecalcError, RecalcSettings};
use catalog_sync_core::store::{AggregateStore, StoreError};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

/// Default bound on waiting for a busy lane.
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors from routing a mutation.
#[derive(Error, Debug)]
pub enum RouterError {
    /// The lane stayed busy longer than the acquire timeout.
    #[error("Timed out after {waited:?} waiting for lane of product {product_id}")]
    LaneTimeout {
        /// Product whose lane was busy.
        product_id: ProductId,
        /// How long we waited.
        waited: Duration,
    },

    /// The fold rejected the mutation.
    #[error(transparent)]
    Recalc(#[from] RecalcError),

    /// Loading or persisting the aggregate failed.
    #[error("Aggregate store error: {0}")]
    Store(#[from] StoreError),

    /// The task running the critical section panicked or was aborted.
    #[error("Lane task failed: {0}")]
    LaneTask(#[from] tokio::task::JoinError),
}

impl RouterError {
    /// Whether redelivering the same mutation may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        !matches!(self, Self::Recalc(RecalcError::InvariantViolation(_)))
    }
}

type Lane = Arc<Mutex<()>>;

struct Inner {
    store: Arc<dyn AggregateStore>,
    clock: Arc<dyn Clock>,
    settings: RecalcSettings,
    acquire_timeout: Duration,
    lanes: RwLock<HashMap<ProductId, Lane>>,
}

/// Routes mutations into per-product lanes.
///
/// Cheap to clone; clones share lanes.
///
/// # Example
///
/// ```
/// use catalog_sync_runtime::router::LaneRouter;
/// use catalog_sync_core::recalc::{FoldOutcome, Mutation, RecalcSettings};
/// use catalog_sync_core::envelope::ProductEvent;
/// use catalog_sync_core::environment::SystemClock;
/// use catalog_sync_core::product::ProductId;
/// use catalog_sync_testing::InMemoryAggregateStore;
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let router = LaneRouter::new(
///     Arc::new(InMemoryAggregateStore::new()),
///     Arc::new(SystemClock),
///     RecalcSettings::default(),
/// );
/// let outcome = router
///     .route(&ProductId::new("p-1"), Mutation::event(ProductEvent::ProductCreated, 0, None))
///     .await?;
/// assert!(matches!(outcome, FoldOutcome::Applied { .. }));
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct LaneRouter {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for LaneRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LaneRouter")
            .field("acquire_timeout", &self.inner.acquire_timeout)
            .field("settings", &self.inner.settings)
            .finish_non_exhaustive()
    }
}

impl LaneRouter {
    /// Create a router with the default acquire timeout.
    #[must_use]
    pub fn new(
        store: Arc<dyn AggregateStore>,
        clock: Arc<dyn Clock>,
        settings: RecalcSettings,
    ) -> Self {
        Self::with_acquire_timeout(store, clock, settings, DEFAULT_ACQUIRE_TIMEOUT)
    }

    /// Create a router with an explicit acquire timeout.
    #[must_use]
    pub fn with_acquire_timeout(
        store: Arc<dyn AggregateStore>,
        clock: Arc<dyn Clock>,
        settings: RecalcSettings,
        acquire_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                clock,
                settings,
                acquire_timeout,
                lanes: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Backing aggregate store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn AggregateStore> {
        &self.inner.store
    }

    /// Current time from the router's clock.
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.inner.clock.now()
    }

    /// Fold settings in use.
    #[must_use]
    pub fn settings(&self) -> &RecalcSettings {
        &self.inner.settings
    }

    /// Number of lanes currently allocated.
    pub async fn active_lanes(&self) -> usize {
        self.inner.lanes.read().await.len()
    }

    /// Apply `mutation` to `product_id` inside its lane.
    ///
    /// Returns after the lane is released, so follow-on work (publishing
    /// derived events, ledger writes) never holds it.
    ///
    /// # Errors
    ///
    /// - [`RouterError::LaneTimeout`] if the lane stays busy too long
    /// - [`RouterError::Recalc`] if the fold rejects the mutation; nothing is
    ///   persisted
    /// - [`RouterError::Store`] if loading or saving fails
    /// - [`RouterError::LaneTask`] if the critical section panicked
    pub async fn route(
        &self,
        product_id: &ProductId,
        mutation: Mutation,
    ) -> Result<FoldOutcome, RouterError> {
        let lease = self.lease(product_id).await;

        let started = Instant::now();
        let guard = tokio::time::timeout(
            self.inner.acquire_timeout,
            Arc::clone(&lease.lane).lock_owned(),
        )
        .await;
        let waited = started.elapsed();
        RouterMetrics::record_lane_wait(waited);

        let Ok(guard) = guard else {
            lease.release().await;
            tracing::warn!(
                product_id = %product_id,
                waited_ms = u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
                "Lane acquire timed out"
            );
            return Err(RouterError::LaneTimeout {
                product_id: product_id.clone(),
                waited,
            });
        };

        // The task owns the guard and the lease, so the lane is unlocked and
        // released even if our caller stops waiting.
        let inner = Arc::clone(&self.inner);
        let id = product_id.clone();
        tokio::spawn(async move {
            let outcome = fold_and_persist(&inner, &id, &mutation).await;
            drop(guard);
            lease.release().await;
            outcome
        })
        .await?
    }

    async fn lease(&self, product_id: &ProductId) -> LaneLease {
        let lane = {
            let lanes = self.inner.lanes.read().await;
            lanes.get(product_id).map(Arc::clone)
        };
        let lane = match lane {
            Some(lane) => lane,
            None => {
                let mut lanes = self.inner.lanes.write().await;
                let lane = Arc::clone(
                    lanes
                        .entry(product_id.clone())
                        .or_insert_with(|| Arc::new(Mutex::new(()))),
                );
                RouterMetrics::record_active_lanes(lanes.len());
                lane
            }
        };

        LaneLease {
            inner: Arc::clone(&self.inner),
            product_id: product_id.clone(),
            lane,
            released: false,
        }
    }
}

/// A handle on one product's lane. Giving it back removes the lane from the
/// map when nobody else holds or waits on it.
///
/// [`LaneLease::release`] is the normal path. A lease dropped without it
/// (the caller was cancelled while waiting) releases on a spawned task.
struct LaneLease {
    inner: Arc<Inner>,
    product_id: ProductId,
    lane: Lane,
    released: bool,
}

impl LaneLease {
    async fn release(mut self) {
        let mut lanes = self.inner.lanes.write().await;
        forget_if_idle(&mut lanes, &self.product_id, &self.lane);
        drop(lanes);
        self.released = true;
    }
}

impl Drop for LaneLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let inner = Arc::clone(&self.inner);
            let product_id = self.product_id.clone();
            let lane = Arc::clone(&self.lane);
            handle.spawn(async move {
                let mut lanes = inner.lanes.write().await;
                forget_if_idle(&mut lanes, &product_id, &lane);
            });
        } else if let Ok(mut lanes) = self.inner.lanes.try_write() {
            forget_if_idle(&mut lanes, &self.product_id, &self.lane);
        }
    }
}

/// Remove the map entry if `lane` is the only handle besides the map's.
fn forget_if_idle(lanes: &mut HashMap<ProductId, Lane>, product_id: &ProductId, lane: &Lane) {
    let idle = lanes
        .get(product_id)
        .is_some_and(|current| Arc::ptr_eq(current, lane) && Arc::strong_count(lane) == 2);
    if idle {
        lanes.remove(product_id);
        RouterMetrics::record_active_lanes(lanes.len());
    }
}

async fn fold_and_persist(
    inner: &Inner,
    product_id: &ProductId,
    mutation: &Mutation,
) -> Result<FoldOutcome, RouterError> {
    let current = inner.store.load(product_id).await?;
    let ctx = RecalcContext::new(&inner.settings, inner.clock.now());
    let outcome = recalc::apply(current.as_ref(), product_id, mutation, &ctx)?;

    if let FoldOutcome::Applied { state, .. } = &outcome {
        match &current {
            None => inner.store.insert(state).await?,
            Some(previous) => inner.store.save(state, previous.version).await?,
        }
        tracing::debug!(
            product_id = %product_id,
            mutation = mutation.label(),
            version = state.version,
            "Aggregate updated"
        );
    }

    Ok(outcome)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use catalog_sync_core::envelope::ProductEvent;
    use catalog_sync_testing::{InMemoryAggregateStore, test_clock};

    fn router(store: &InMemoryAggregateStore, timeout: Duration) -> LaneRouter {
        LaneRouter::with_acquire_timeout(
            Arc::new(store.clone()),
            Arc::new(test_clock()),
            RecalcSettings::default(),
            timeout,
        )
    }

    fn created() -> Mutation {
        Mutation::event(ProductEvent::ProductCreated, 0, None)
    }

    fn stock(sequence: u64, available_quantity: i64) -> Mutation {
        Mutation::event(ProductEvent::StockUpdated { available_quantity }, sequence, None)
    }

    #[tokio::test]
    async fn creates_then_saves_with_version() {
        let store = InMemoryAggregateStore::new();
        let router = router(&store, DEFAULT_ACQUIRE_TIMEOUT);
        let id = ProductId::new("p-1");

        router.route(&id, created()).await.unwrap();
        router.route(&id, stock(1, 4)).await.unwrap();

        let state = store.get(&id).unwrap();
        assert_eq!(state.version, 2);
        assert_eq!(state.availability.available_quantity, 4);
        assert_eq!(router.active_lanes().await, 0);
    }

    #[tokio::test]
    async fn unknown_product_is_transient() {
        let store = InMemoryAggregateStore::new();
        let router = router(&store, DEFAULT_ACQUIRE_TIMEOUT);
        let err = router.route(&ProductId::new("ghost"), stock(1, 4)).await.unwrap_err();
        assert!(matches!(err, RouterError::Recalc(RecalcError::UnknownProduct(_))));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn invariant_violation_leaves_state_untouched() {
        let store = InMemoryAggregateStore::new();
        let router = router(&store, DEFAULT_ACQUIRE_TIMEOUT);
        let id = ProductId::new("p-1");
        router.route(&id, created()).await.unwrap();

        let err = router.route(&id, stock(1, -3)).await.unwrap_err();
        assert!(!err.is_transient());
        assert_eq!(store.get(&id).unwrap().version, 1);
    }

    #[tokio::test]
    async fn busy_lane_times_out() {
        let store = InMemoryAggregateStore::new();
        let router = router(&store, Duration::from_millis(20));
        let id = ProductId::new("p-1");
        router.route(&id, created()).await.unwrap();

        store.set_save_delay(Some(Duration::from_millis(200)));
        let slow = {
            let router = router.clone();
            let id = id.clone();
            tokio::spawn(async move { router.route(&id, stock(1, 4)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let err = router.route(&id, stock(2, 6)).await.unwrap_err();
        assert!(matches!(err, RouterError::LaneTimeout { .. }));
        assert!(err.is_transient());

        slow.await.unwrap().unwrap();
        assert_eq!(store.get(&id).unwrap().availability.available_quantity, 4);
    }

    #[tokio::test]
    async fn cancelled_callers_still_release_the_lane() {
        let store = InMemoryAggregateStore::new();
        let router = router(&store, DEFAULT_ACQUIRE_TIMEOUT);
        let id = ProductId::new("p-1");
        router.route(&id, created()).await.unwrap();
        store.set_save_delay(Some(Duration::from_millis(100)));

        // Gives up mid-write, then gives up while queued behind that write.
        let writing = tokio::time::timeout(Duration::from_millis(20), router.route(&id, stock(1, 4)));
        assert!(writing.await.is_err());
        let waiting = tokio::time::timeout(Duration::from_millis(20), router.route(&id, stock(2, 6)));
        assert!(waiting.await.is_err());

        let mut lanes = usize::MAX;
        for _ in 0..100 {
            lanes = router.active_lanes().await;
            if lanes == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(lanes, 0);
        assert_eq!(store.get(&id).unwrap().availability.available_quantity, 4);
    }

    #[tokio::test]
    async fn other_products_are_not_blocked() {
        let store = InMemoryAggregateStore::new();
        let router = router(&store, Duration::from_millis(100));
        let a = ProductId::new("a");
        let b = ProductId::new("b");
        router.route(&a, created()).await.unwrap();
        router.route(&b, created()).await.unwrap();

        store.set_save_delay(Some(Duration::from_millis(60)));
        let (ra, rb) = tokio::join!(router.route(&a, stock(1, 1)), router.route(&b, stock(1, 2)));
        ra.unwrap();
        rb.unwrap();
        assert_eq!(store.get(&b).unwrap().availability.available_quantity, 2);
    }
}
