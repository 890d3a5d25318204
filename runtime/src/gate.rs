//! The entry point for inbound envelopes.
//!
//! ```text
//! bytes ─> decode ──malformed──────────────────────────────> Malformed
//!            │
//!            └─> ledger.is_processed ──yes──────────────────> Duplicate
//!                   │ (error/timeout) ──────────────────────> TransientFailure
//!                   └─> router.route ──Applied──> ledger.record ─> emit ─> Applied
//!                          │         ──Stale────> ledger.record ───────> Stale
//!                          │         ──invariant───────────────────────> InvariantViolation
//!                          └───────────other error─────────────────────> TransientFailure
//! ```
//!
//! The ledger is written only after the router reports the outcome. A crash
//! in between is safe: the redelivered event folds to `Stale` because every
//! sub-aggregate remembers the sequences it has applied.

use crate::emitter::DerivedEventEmitter;
use crate::metrics::IngestMetrics;
use crate::router::{LaneRouter, RouterError};
use catalog_sync_core::disposition::Disposition;
use catalog_sync_core::envelope::EventEnvelope;
use catalog_sync_core::ledger::{IdempotencyLedger, LedgerError, ProcessedEventRecord};
use catalog_sync_core::product::{ProductAggregateState, ProductId};
use catalog_sync_core::recalc::{FoldOutcome, ManualBadge, Mutation, RecalcError};
use catalog_sync_core::store::StoreError;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Default bound on each ledger call.
pub const DEFAULT_LEDGER_TIMEOUT: Duration = Duration::from_secs(2);

/// Decodes envelopes, deduplicates them and routes them into lanes.
///
/// # Example
///
/// ```
/// use catalog_sync_runtime::{DerivedEventEmitter, IngestionGate, LaneRouter};
/// use catalog_sync_core::disposition::Disposition;
/// use catalog_sync_core::recalc::RecalcSettings;
/// use catalog_sync_testing::{builders, test_clock, InMemoryAggregateStore, InMemoryLedger, RecordingEventBus};
/// use std::sync::Arc;
///
/// # async fn example() {
/// let clock = Arc::new(test_clock());
/// let router = LaneRouter::new(Arc::new(InMemoryAggregateStore::new()), clock.clone(), RecalcSettings::default());
/// let emitter = DerivedEventEmitter::new(Arc::new(RecordingEventBus::new()), clock, "catalog.derived");
/// let gate = IngestionGate::new(Arc::new(InMemoryLedger::new()), router, emitter);
///
/// let created = builders::product_created("e-0", "p-1");
/// assert_eq!(gate.ingest(&created).await, Disposition::Applied);
/// assert_eq!(gate.ingest(&created).await, Disposition::Duplicate);
/// # }
/// ```
#[derive(Clone)]
pub struct IngestionGate {
    ledger: Arc<dyn IdempotencyLedger>,
    router: LaneRouter,
    emitter: DerivedEventEmitter,
    ledger_timeout: Duration,
}

impl std::fmt::Debug for IngestionGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestionGate")
            .field("router", &self.router)
            .field("emitter", &self.emitter)
            .field("ledger_timeout", &self.ledger_timeout)
            .finish_non_exhaustive()
    }
}

impl IngestionGate {
    /// Create a gate with the default ledger timeout.
    #[must_use]
    pub const fn new(
        ledger: Arc<dyn IdempotencyLedger>,
        router: LaneRouter,
        emitter: DerivedEventEmitter,
    ) -> Self {
        Self {
            ledger,
            router,
            emitter,
            ledger_timeout: DEFAULT_LEDGER_TIMEOUT,
        }
    }

    /// Bound each ledger call.
    #[must_use]
    pub const fn with_ledger_timeout(mut self, timeout: Duration) -> Self {
        self.ledger_timeout = timeout;
        self
    }

    /// The router behind this gate.
    #[must_use]
    pub const fn router(&self) -> &LaneRouter {
        &self.router
    }

    /// Process one inbound envelope.
    ///
    /// Never fails: every outcome, including infrastructure trouble, is a
    /// [`Disposition`]. The caller acknowledges the message unless
    /// [`Disposition::should_ack`] says otherwise.
    pub async fn ingest(&self, bytes: &[u8]) -> Disposition {
        let started = Instant::now();
        let disposition = self.process(bytes).await;
        IngestMetrics::record(disposition, started.elapsed());
        disposition
    }

    async fn process(&self, bytes: &[u8]) -> Disposition {
        let envelope = match EventEnvelope::from_slice(bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(error = %e, size = bytes.len(), "Dropping malformed envelope");
                return Disposition::Malformed;
            }
        };

        let (envelope, event) = match envelope.into_product_event() {
            Ok(decoded) => decoded,
            Err(e) => {
                tracing::warn!(error = %e, "Dropping malformed envelope");
                return Disposition::Malformed;
            }
        };

        match self.with_timeout(self.ledger.is_processed(&envelope.event_id)).await {
            Ok(true) => {
                tracing::debug!(
                    event_id = %envelope.event_id,
                    event_type = %envelope.event_type,
                    "Duplicate event"
                );
                return Disposition::Duplicate;
            }
            Ok(false) => {}
            Err(e) => {
                IngestMetrics::record_ledger_error();
                tracing::warn!(
                    event_id = %envelope.event_id,
                    error = %e,
                    "Ledger check failed"
                );
                return Disposition::TransientFailure;
            }
        }

        let mutation = Mutation::event(event, envelope.sequence, envelope.occurred_at);
        let routed = self.router.route(&envelope.product_id, mutation).await;

        let disposition = match routed {
            Ok(FoldOutcome::Applied { state, derived }) => {
                tracing::info!(
                    event_id = %envelope.event_id,
                    event_type = %envelope.event_type,
                    product_id = %envelope.product_id,
                    sequence = envelope.sequence,
                    version = state.version,
                    correlation_id = envelope.correlation_id.as_deref().unwrap_or("-"),
                    "Event applied"
                );
                self.record(&envelope).await;
                self.emitter
                    .emit(derived, envelope.correlation_id.as_deref())
                    .await;
                return Disposition::Applied;
            }
            Ok(FoldOutcome::Stale(reason)) => {
                tracing::debug!(
                    event_id = %envelope.event_id,
                    event_type = %envelope.event_type,
                    product_id = %envelope.product_id,
                    sequence = envelope.sequence,
                    reason = %reason,
                    "Stale event"
                );
                Disposition::Stale
            }
            Err(RouterError::Recalc(RecalcError::InvariantViolation(detail))) => {
                tracing::error!(
                    event_id = %envelope.event_id,
                    event_type = %envelope.event_type,
                    product_id = %envelope.product_id,
                    sequence = envelope.sequence,
                    detail = %detail,
                    "Invariant violation, mutation rejected"
                );
                Disposition::InvariantViolation
            }
            Err(e) => {
                tracing::warn!(
                    event_id = %envelope.event_id,
                    event_type = %envelope.event_type,
                    product_id = %envelope.product_id,
                    error = %e,
                    "Transient failure, leaving for redelivery"
                );
                Disposition::TransientFailure
            }
        };

        if disposition.records_in_ledger() {
            self.record(&envelope).await;
        }
        disposition
    }

    /// Write the processed-event record; failures only cost a cheap
    /// `Stale` on redelivery, so they are logged and swallowed.
    async fn record(&self, envelope: &EventEnvelope) {
        let record = ProcessedEventRecord {
            event_id: envelope.event_id.clone(),
            stream_name: envelope.stream_name().to_string(),
            event_type: envelope.event_type.clone(),
            product_id: envelope.product_id.clone(),
            processed_at: self.router.now(),
        };

        match self.with_timeout(self.ledger.record(record)).await {
            Ok(true) => IngestMetrics::record_ledger_write(),
            Ok(false) => {
                tracing::debug!(event_id = %envelope.event_id, "Ledger record already present");
            }
            Err(e) => {
                IngestMetrics::record_ledger_error();
                tracing::warn!(
                    event_id = %envelope.event_id,
                    error = %e,
                    "Failed to record processed event"
                );
            }
        }
    }

    async fn with_timeout<T>(
        &self,
        call: impl Future<Output = Result<T, LedgerError>>,
    ) -> Result<T, LedgerError> {
        tokio::time::timeout(self.ledger_timeout, call)
            .await
            .map_err(|_| LedgerError::Timeout(self.ledger_timeout))?
    }

    /// Latest durably applied aggregate for a product.
    ///
    /// Logically removed products are returned with `removed` set.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store cannot be read.
    pub async fn get_aggregate(
        &self,
        product_id: &ProductId,
    ) -> Result<Option<ProductAggregateState>, StoreError> {
        self.router.store().load(product_id).await
    }

    /// Attach a manual badge through the product's lane.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError`] if the lane, the fold or the store fails.
    pub async fn assign_manual_badge(
        &self,
        product_id: &ProductId,
        badge: ManualBadge,
    ) -> Result<FoldOutcome, RouterError> {
        self.dispatch(product_id, Mutation::AssignManualBadge(badge)).await
    }

    /// Detach a manual badge through the product's lane.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError`] if the lane, the fold or the store fails.
    pub async fn remove_manual_badge(
        &self,
        product_id: &ProductId,
        badge_type: impl Into<String>,
    ) -> Result<FoldOutcome, RouterError> {
        let mutation = Mutation::RemoveManualBadge {
            badge_type: badge_type.into(),
        };
        self.dispatch(product_id, mutation).await
    }

    /// Route a mutation that did not arrive as an envelope, then publish
    /// its derived events.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError`] if the lane, the fold or the store fails.
    pub async fn dispatch(
        &self,
        product_id: &ProductId,
        mutation: Mutation,
    ) -> Result<FoldOutcome, RouterError> {
        let label = mutation.label();
        let outcome = self.router.route(product_id, mutation).await?;
        if let FoldOutcome::Applied { state, derived } = &outcome {
            tracing::info!(
                product_id = %product_id,
                mutation = label,
                version = state.version,
                "Mutation applied"
            );
            self.emitter.emit(derived.clone(), None).await;
        }
        Ok(outcome)
    }
}
