//! # Catalog Sync Core
//!
//! Domain model and pure logic for keeping the denormalized aggregate fields of
//! a product (review summary, availability, Q&A counters, automatic badges) in
//! step with upstream domain events.
//!
//! This crate performs no I/O. Everything that touches a database, a broker or
//! the wall clock is expressed as a trait here and implemented elsewhere:
//!
//! - [`store::AggregateStore`]: persisted [`product::ProductAggregateState`] documents
//! - [`ledger::IdempotencyLedger`]: processed event identifiers
//! - [`event_bus::EventBus`]: inbound subscriptions and outbound derived events
//! - [`environment::Clock`]: the current time
//!
//! ## Data Flow
//!
//! ```text
//! bytes ──► EventEnvelope ──► ProductEvent ──► recalc::apply ──► (state', derived events)
//!                                                   │
//!                                                   └──► BadgeEngine::evaluate
//! ```
//!
//! ## Example
//!
//! ```
//! use catalog_sync_core::envelope::EventEnvelope;
//! use catalog_sync_core::product::{ProductAggregateState, ProductId};
//! use catalog_sync_core::recalc::{self, FoldOutcome, Mutation, RecalcContext, RecalcSettings};
//! use chrono::Utc;
//!
//! let raw = br#"{
//!     "eventId": "evt-1",
//!     "eventType": "review.created",
//!     "targetProductId": "prod-1",
//!     "sequence": 1,
//!     "data": { "reviewId": "rev-1", "rating": 5 }
//! }"#;
//!
//! let envelope = EventEnvelope::from_slice(raw).unwrap();
//! let event = envelope.decode_event().unwrap();
//!
//! let state = ProductAggregateState::new(ProductId::new("prod-1"), Utc::now());
//! let settings = RecalcSettings::default();
//! let ctx = RecalcContext::new(&settings, Utc::now());
//! let mutation = Mutation::event(event, envelope.sequence, envelope.occurred_at);
//!
//! match recalc::apply(Some(&state), &envelope.product_id, &mutation, &ctx).unwrap() {
//!     FoldOutcome::Applied { state, .. } => {
//!         assert_eq!(state.review_aggregate.total_count, 1);
//!         assert!((state.review_aggregate.average_rating - 5.0).abs() < f64::EPSILON);
//!     }
//!     FoldOutcome::Stale(reason) => panic!("unexpected stale outcome: {reason}"),
//! }
//! ```

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};

pub mod badge;
pub mod derived;
pub mod disposition;
pub mod envelope;
pub mod event;
pub mod event_bus;
pub mod ledger;
pub mod product;
pub mod recalc;
pub mod store;

/// Environment module - Dependency injection traits
///
/// All access to the outside world that the pure recalculation logic needs is
/// abstracted here so tests can pin it down.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// Badge assignment timestamps, expiry checks and ledger records all read
    /// the time through this trait.
    ///
    /// # Examples
    ///
    /// ```
    /// use catalog_sync_core::environment::{Clock, SystemClock};
    ///
    /// let clock = SystemClock;
    /// let before = chrono::Utc::now();
    /// assert!(clock.now() >= before);
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Production clock backed by the system time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
