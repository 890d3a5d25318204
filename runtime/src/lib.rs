//! # Catalog Sync Runtime
//!
//! Moving parts that keep product aggregates in step with upstream events.
//!
//! ## Core Components
//!
//! - **[`IngestionGate`]**: decodes envelopes, deduplicates against the
//!   idempotency ledger and reports a [`Disposition`]
//! - **[`LaneRouter`]**: one writer per product; load, fold, persist
//! - **[`DerivedEventEmitter`]**: best-effort publication of restock and
//!   badge notifications
//! - **[`BadgeExpirySweeper`]** and **[`LedgerJanitor`]**: periodic
//!   housekeeping
//! - **[`EventConsumer`]**: bus subscription feeding the gate with bounded
//!   parallelism
//!
//! ## Example
//!
//! ```ignore
//! let router = LaneRouter::new(store, clock.clone(), RecalcSettings::default());
//! let emitter = DerivedEventEmitter::new(bus.clone(), clock, "catalog.derived");
//! let gate = Arc::new(IngestionGate::new(ledger, router, emitter));
//!
//! match gate.ingest(&bytes).await {
//!     Disposition::TransientFailure => { /* leave for redelivery */ }
//!     _ => { /* acknowledge */ }
//! }
//! ```
//!
//! [`Disposition`]: catalog_sync_core::disposition::Disposition

/// Bus consumer with bounded workers
pub mod consumer;

/// Derived event publication
pub mod emitter;

/// Envelope entry point
pub mod gate;

/// Ledger retention
pub mod janitor;

/// Prometheus metrics for observability
pub mod metrics;

/// Retry logic with exponential backoff
pub mod retry;

/// Per-product lanes
pub mod router;

/// Badge expiry sweeps
pub mod sweeper;

pub use consumer::{EventConsumer, EventConsumerBuilder};
pub use emitter::{DerivedEventEmitter, EmitReport};
pub use gate::IngestionGate;
pub use janitor::{LedgerJanitor, PurgeReport};
pub use metrics::{MetricsError, MetricsServer};
pub use retry::{RetryPolicy, retry_with_backoff};
pub use router::{LaneRouter, RouterError};
pub use sweeper::{BadgeExpirySweeper, SweepReport};
