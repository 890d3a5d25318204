//! Prometheus metrics for the ingestion pipeline.
//!
//! Metrics are recorded through the `metrics` facade from the gate, the
//! router and the emitter. [`MetricsServer`] installs the Prometheus recorder
//! and serves `/metrics`.
//!
//! | Metric | Kind | Labels |
//! |--------|------|--------|
//! | `ingest_events_total` | counter | `disposition` |
//! | `ingest_duration_seconds` | histogram | |
//! | `ledger_records_written_total` | counter | |
//! | `ledger_errors_total` | counter | |
//! | `lane_wait_duration_seconds` | histogram | |
//! | `router_active_lanes` | gauge | |
//! | `derived_events_published_total` | counter | `event_type` |
//! | `derived_events_dropped_total` | counter | `event_type` |
//! | `badge_transitions_total` | counter | `badge_type`, `transition` |
//! | `invariant_violations_total` | counter | |
//!
//! # Example
//!
//! ```rust,no_run
//! use catalog_sync_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//! # Ok(())
//! # }
//! ```

use catalog_sync_core::derived::DerivedEvent;
use catalog_sync_core::disposition::Disposition;
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

pub use metrics::{counter, gauge, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus metrics server.
///
/// Exposes metrics on an HTTP endpoint for Prometheus scraping. Must be
/// started from inside a Tokio runtime.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server bound to `addr` once started.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Install the recorder and spawn the HTTP listener.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::Build`] if the exporter cannot be built and
    /// [`MetricsError::Install`] if the global recorder cannot be set. A
    /// recorder that is already installed (common in tests) is logged and
    /// tolerated.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let (recorder, exporter) = PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?
            .build()
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        let handle = recorder.handle();
        match metrics::set_global_recorder(recorder) {
            Ok(()) => {
                tokio::spawn(async move {
                    if exporter.await.is_err() {
                        tracing::error!("Metrics HTTP listener stopped");
                    }
                });
                self.handle = Some(handle);
                tracing::info!(addr = %self.addr, "Metrics server started");
                Ok(())
            }
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            }
        }
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus text format.
    ///
    /// Returns `None` if this server did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

fn register_metrics() {
    describe_counter!(
        "ingest_events_total",
        "Inbound envelopes by disposition"
    );
    describe_histogram!(
        "ingest_duration_seconds",
        "Time from receiving an envelope to its disposition"
    );
    describe_counter!(
        "ledger_records_written_total",
        "Processed-event records written to the idempotency ledger"
    );
    describe_counter!(
        "ledger_errors_total",
        "Idempotency ledger failures and timeouts"
    );
    describe_histogram!(
        "lane_wait_duration_seconds",
        "Time spent waiting for a product lane"
    );
    describe_gauge!("router_active_lanes", "Product lanes currently allocated");
    describe_counter!(
        "derived_events_published_total",
        "Derived events published to the bus"
    );
    describe_counter!(
        "derived_events_dropped_total",
        "Derived events dropped after exhausting retries"
    );
    describe_counter!(
        "badge_transitions_total",
        "Badge assignments and removals"
    );
    describe_counter!(
        "invariant_violations_total",
        "Mutations rejected because they would break an aggregate invariant"
    );
}

/// Gate-side metrics.
pub struct IngestMetrics;

impl IngestMetrics {
    /// Record a disposition and how long it took to reach.
    pub fn record(disposition: Disposition, duration: Duration) {
        counter!("ingest_events_total", "disposition" => disposition.as_str()).increment(1);
        histogram!("ingest_duration_seconds").record(duration.as_secs_f64());
        if disposition == Disposition::InvariantViolation {
            counter!("invariant_violations_total").increment(1);
        }
    }

    /// Record a ledger write.
    pub fn record_ledger_write() {
        counter!("ledger_records_written_total").increment(1);
    }

    /// Record a ledger failure or timeout.
    pub fn record_ledger_error() {
        counter!("ledger_errors_total").increment(1);
    }
}

/// Router-side metrics.
pub struct RouterMetrics;

impl RouterMetrics {
    /// Record how long a caller waited for its lane.
    pub fn record_lane_wait(duration: Duration) {
        histogram!("lane_wait_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record the number of allocated lanes.
    #[allow(clippy::cast_precision_loss)]
    pub fn record_active_lanes(count: usize) {
        gauge!("router_active_lanes").set(count as f64);
    }
}

/// Emitter-side metrics.
pub struct DerivedMetrics;

impl DerivedMetrics {
    /// Record a successful publish.
    pub fn record_published(event: &DerivedEvent) {
        counter!("derived_events_published_total", "event_type" => event.event_type()).increment(1);
    }

    /// Record a publish given up on.
    pub fn record_dropped(event: &DerivedEvent) {
        counter!("derived_events_dropped_total", "event_type" => event.event_type()).increment(1);
    }

    /// Record a badge transition carried by a derived event, if any.
    pub fn record_badge_transition(event: &DerivedEvent) {
        let (badge_type, transition) = match event {
            DerivedEvent::BadgeAssigned { badge_type, .. } => (badge_type.clone(), "assigned"),
            DerivedEvent::BadgeRemoved { badge_type, .. } => (badge_type.clone(), "removed"),
            DerivedEvent::BackInStock { .. } => return,
        };
        counter!(
            "badge_transitions_total",
            "badge_type" => badge_type,
            "transition" => transition
        )
        .increment(1);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use catalog_sync_core::product::ProductId;

    #[tokio::test]
    async fn server_starts_unstarted_has_no_handle() {
        let server = MetricsServer::new("127.0.0.1:0".parse().unwrap());
        assert!(server.handle().is_none());
        assert!(server.render().is_none());
    }

    #[tokio::test]
    async fn records_pipeline_metrics() {
        let mut server = MetricsServer::new("127.0.0.1:0".parse().unwrap());
        server.start().unwrap();

        IngestMetrics::record(Disposition::Applied, Duration::from_millis(3));
        IngestMetrics::record_ledger_write();
        RouterMetrics::record_active_lanes(2);
        let event = DerivedEvent::BackInStock {
            product_id: ProductId::new("p-1"),
            available_quantity: 5,
        };
        DerivedMetrics::record_published(&event);
        DerivedMetrics::record_badge_transition(&event);

        // Another test may have installed the recorder first.
        if let Some(rendered) = server.render() {
            assert!(rendered.contains("ingest_events_total"));
            assert!(rendered.contains("derived_events_published_total"));
            assert!(rendered.contains("router_active_lanes"));
        }
    }
}
