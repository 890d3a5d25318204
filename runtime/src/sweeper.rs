//! Periodic removal of expired automatic badges.
//!
//! Badge expiry is otherwise only noticed when the next event for a product
//! arrives. The sweeper asks the store which products hold an expired
//! automatic badge and routes a sweep through each product's lane, so the
//! removal is serialized with regular events and emits `badge.removed`.

use crate::gate::IngestionGate;
use catalog_sync_core::recalc::{FoldOutcome, Mutation};
use catalog_sync_core::store::StoreError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Result of one sweep pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Products the store reported.
    pub candidates: usize,
    /// Products whose badges were removed.
    pub swept: usize,
    /// Products that failed and will be retried next pass.
    pub failed: usize,
}

/// Runs badge expiry sweeps on an interval.
#[derive(Debug, Clone)]
pub struct BadgeExpirySweeper {
    gate: Arc<IngestionGate>,
    interval: Duration,
}

impl BadgeExpirySweeper {
    /// Create a sweeper over `gate`'s router and emitter.
    #[must_use]
    pub const fn new(gate: Arc<IngestionGate>, interval: Duration) -> Self {
        Self { gate, interval }
    }

    /// Run a single pass.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the candidate query fails. Per-product
    /// failures are logged and counted in the report.
    pub async fn sweep_once(&self) -> Result<SweepReport, StoreError> {
        let router = self.gate.router();
        let candidates = router
            .store()
            .products_with_expired_badges(router.now())
            .await?;

        let mut report = SweepReport {
            candidates: candidates.len(),
            ..SweepReport::default()
        };

        for product_id in candidates {
            match self.gate.dispatch(&product_id, Mutation::SweepExpiredBadges).await {
                Ok(FoldOutcome::Applied { .. }) => report.swept += 1,
                Ok(FoldOutcome::Stale(_)) => {}
                Err(e) => {
                    tracing::warn!(product_id = %product_id, error = %e, "Badge sweep failed");
                    report.failed += 1;
                }
            }
        }

        if report.candidates > 0 {
            tracing::info!(
                candidates = report.candidates,
                swept = report.swept,
                failed = report.failed,
                "Badge expiry sweep finished"
            );
        }
        Ok(report)
    }

    /// Sweep every `interval` until shutdown.
    #[must_use]
    pub fn spawn(self, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tracing::info!(interval_secs = self.interval.as_secs(), "Badge expiry sweeper started");

            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.sweep_once().await {
                            tracing::warn!(error = %e, "Badge expiry sweep could not list candidates");
                        }
                    }
                }
            }

            tracing::info!("Badge expiry sweeper stopped");
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::{DerivedEventEmitter, LaneRouter};
    use catalog_sync_core::badge::TRENDING;
    use catalog_sync_core::product::ProductId;
    use catalog_sync_core::recalc::RecalcSettings;
    use catalog_sync_testing::{
        FixedClock, InMemoryAggregateStore, InMemoryLedger, RecordingEventBus, builders, test_clock,
    };

    fn setup() -> (BadgeExpirySweeper, Arc<IngestionGate>, InMemoryAggregateStore, RecordingEventBus, FixedClock) {
        let store = InMemoryAggregateStore::new();
        let bus = RecordingEventBus::new();
        let clock = test_clock();
        let router = LaneRouter::new(
            Arc::new(store.clone()),
            Arc::new(clock.clone()),
            RecalcSettings::default(),
        );
        let emitter = DerivedEventEmitter::new(Arc::new(bus.clone()), Arc::new(clock.clone()), "derived");
        let gate = Arc::new(IngestionGate::new(Arc::new(InMemoryLedger::new()), router, emitter));
        let sweeper = BadgeExpirySweeper::new(Arc::clone(&gate), Duration::from_secs(60));
        (sweeper, gate, store, bus, clock)
    }

    #[tokio::test]
    async fn removes_expired_trending_badge() {
        let (sweeper, gate, store, bus, clock) = setup();
        gate.ingest(&builders::product_created("e-0", "p-1")).await;
        gate.ingest(&builders::views_updated("e-1", "p-1", 1, 80.0)).await;
        let id = ProductId::new("p-1");
        assert!(store.get(&id).unwrap().badge(TRENDING).is_some());

        assert_eq!(sweeper.sweep_once().await.unwrap().candidates, 0);

        clock.advance(chrono::Duration::hours(169));
        bus.clear_published();
        let report = sweeper.sweep_once().await.unwrap();
        assert_eq!(report, SweepReport { candidates: 1, swept: 1, failed: 0 });
        assert!(store.get(&id).unwrap().badge(TRENDING).is_none());

        let removed = bus.published_of_type("badge.removed");
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].payload().unwrap()["data"]["reason"], "expired");
    }

    #[tokio::test]
    async fn spawn_stops_on_shutdown() {
        let (sweeper, ..) = setup();
        let (tx, rx) = broadcast::channel(1);
        let handle = sweeper.spawn(rx);
        tx.send(()).unwrap();
        handle.await.unwrap();
    }
}
