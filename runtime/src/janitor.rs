//! Ledger retention.
//!
//! Processed-event records only need to outlive the broker's redelivery
//! window. The janitor deletes older records stream by stream.

use catalog_sync_core::envelope::STREAMS;
use catalog_sync_core::environment::Clock;
use catalog_sync_core::ledger::IdempotencyLedger;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Result of one purge pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PurgeReport {
    /// Records deleted across all streams.
    pub purged: u64,
    /// Streams whose purge failed.
    pub failed_streams: Vec<&'static str>,
}

/// Periodically purges old ledger records.
#[derive(Clone)]
pub struct LedgerJanitor {
    ledger: Arc<dyn IdempotencyLedger>,
    clock: Arc<dyn Clock>,
    retention: chrono::Duration,
    interval: Duration,
}

impl std::fmt::Debug for LedgerJanitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerJanitor")
            .field("retention", &self.retention)
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

impl LedgerJanitor {
    /// Keep records for `retention`, purging every `interval`.
    #[must_use]
    pub const fn new(
        ledger: Arc<dyn IdempotencyLedger>,
        clock: Arc<dyn Clock>,
        retention: chrono::Duration,
        interval: Duration,
    ) -> Self {
        Self {
            ledger,
            clock,
            retention,
            interval,
        }
    }

    /// Purge every known stream once.
    pub async fn purge_once(&self) -> PurgeReport {
        let cutoff = self.clock.now() - self.retention;
        let mut report = PurgeReport::default();

        for stream in STREAMS {
            match self.ledger.purge_older_than(stream, cutoff).await {
                Ok(purged) => {
                    if purged > 0 {
                        tracing::info!(stream, purged, "Purged processed-event records");
                    }
                    report.purged += purged;
                }
                Err(e) => {
                    tracing::warn!(stream, error = %e, "Ledger purge failed");
                    report.failed_streams.push(stream);
                }
            }
        }

        report
    }

    /// Purge every `interval` until shutdown.
    #[must_use]
    pub fn spawn(self, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tracing::info!(
                retention_hours = self.retention.num_hours(),
                "Ledger janitor started"
            );

            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = ticker.tick() => {
                        self.purge_once().await;
                    }
                }
            }

            tracing::info!("Ledger janitor stopped");
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use catalog_sync_core::ledger::ProcessedEventRecord;
    use catalog_sync_core::product::ProductId;
    use catalog_sync_testing::{InMemoryLedger, test_clock};

    #[tokio::test]
    async fn purges_records_past_retention() {
        let ledger = InMemoryLedger::new();
        let clock = test_clock();
        let now = clock.now();
        for (id, stream, age_hours) in [("a", "reviews", 200), ("b", "qa", 200), ("c", "reviews", 2)] {
            ledger
                .record(ProcessedEventRecord {
                    event_id: id.to_string(),
                    stream_name: stream.to_string(),
                    event_type: "x".to_string(),
                    product_id: ProductId::new("p"),
                    processed_at: now - chrono::Duration::hours(age_hours),
                })
                .await
                .unwrap();
        }

        let janitor = LedgerJanitor::new(
            Arc::new(ledger.clone()),
            Arc::new(clock),
            chrono::Duration::hours(168),
            Duration::from_secs(3600),
        );
        let report = janitor.purge_once().await;
        assert_eq!(report.purged, 2);
        assert!(report.failed_streams.is_empty());
        assert_eq!(ledger.len(), 1);
        assert!(ledger.get("c").is_some());
    }

    #[tokio::test]
    async fn failures_are_reported_per_stream() {
        let ledger = InMemoryLedger::new();
        ledger.set_unavailable(true);
        let janitor = LedgerJanitor::new(
            Arc::new(ledger),
            Arc::new(test_clock()),
            chrono::Duration::hours(1),
            Duration::from_secs(1),
        );
        let report = janitor.purge_once().await;
        assert_eq!(report.failed_streams.len(), STREAMS.len());
    }
}
