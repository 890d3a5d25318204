//! # Catalog Sync Testing
//!
//! Testing utilities for the catalog sync components.
//!
//! This crate provides:
//! - A controllable clock
//! - In-memory implementations of the ledger, aggregate store and event bus,
//!   each with failure injection
//! - Builders for inbound envelopes
//!
//! ## Example
//!
//! ```ignore
//! use catalog_sync_testing::{InMemoryAggregateStore, InMemoryLedger, RecordingEventBus};
//! use catalog_sync_testing::builders;
//!
//! #[tokio::test]
//! async fn restock_is_published() {
//!     let gate = gate_with(InMemoryLedger::new(), InMemoryAggregateStore::new(), bus.clone());
//!     gate.ingest(&builders::product_created("e-0", "p-1")).await;
//!     gate.ingest(&builders::stock_updated("e-1", "p-1", 1, 0)).await;
//!     gate.ingest(&builders::stock_updated("e-2", "p-1", 2, 5)).await;
//!     assert_eq!(bus.published_of_type("product.back.in.stock").len(), 1);
//! }
//! ```

use chrono::{DateTime, Duration, Utc};
use catalog_sync_core::environment::Clock;

pub mod builders;
pub mod event_bus;
pub mod ledger;
pub mod store;

/// Mock implementations of Environment traits
pub mod mocks {
    use super::{Clock, DateTime, Duration, Utc};
    use std::sync::{Arc, RwLock};

    /// Controllable clock for deterministic tests
    ///
    /// Returns the same time until moved with [`FixedClock::advance`] or
    /// [`FixedClock::set`]. Clones share the same time.
    ///
    /// # Example
    ///
    /// ```
    /// use catalog_sync_testing::mocks::FixedClock;
    /// use catalog_sync_core::environment::Clock;
    /// use chrono::{Duration, Utc};
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// assert_eq!(time1, clock.now());
    ///
    /// clock.advance(Duration::hours(1));
    /// assert_eq!(clock.now() - time1, Duration::hours(1));
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: Arc<RwLock<DateTime<Utc>>>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(RwLock::new(time)),
            }
        }

        /// Move the clock forward.
        #[allow(clippy::unwrap_used)] // poisoned only if a test already panicked
        pub fn advance(&self, by: Duration) {
            let mut time = self.time.write().unwrap();
            *time += by;
        }

        /// Jump to a specific time.
        #[allow(clippy::unwrap_used)] // poisoned only if a test already panicked
        pub fn set(&self, to: DateTime<Utc>) {
            *self.time.write().unwrap() = to;
        }
    }

    impl Clock for FixedClock {
        #[allow(clippy::unwrap_used)] // poisoned only if a test already panicked
        fn now(&self) -> DateTime<Utc> {
            *self.time.read().unwrap()
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }
}

// Re-export commonly used items
pub use event_bus::RecordingEventBus;
pub use ledger::InMemoryLedger;
pub use mocks::{FixedClock, test_clock};
pub use store::InMemoryAggregateStore;
