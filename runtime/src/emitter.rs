//! Best-effort publication of derived events.
//!
//! A derived event is a notification about a state change that is already
//! durable. Publishing retries with backoff and then gives up with a metric;
//! it never reports failure back to the caller.

use crate::metrics::DerivedMetrics;
use crate::retry::{RetryPolicy, retry_with_predicate};
use catalog_sync_core::derived::{DerivedEnvelope, DerivedEvent};
use catalog_sync_core::environment::Clock;
use catalog_sync_core::event::SerializedEvent;
use catalog_sync_core::event_bus::{EventBus, EventBusError};
use serde_json::json;
use std::sync::Arc;

/// `source` attribute stamped on every derived envelope.
pub const DEFAULT_SOURCE: &str = "catalog-sync";

/// What happened to a batch of derived events.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EmitReport {
    /// Events accepted by the bus.
    pub published: usize,
    /// Events given up on.
    pub dropped: usize,
}

/// Publishes derived events to one topic.
#[derive(Clone)]
pub struct DerivedEventEmitter {
    bus: Arc<dyn EventBus>,
    clock: Arc<dyn Clock>,
    topic: String,
    source: String,
    policy: RetryPolicy,
}

impl std::fmt::Debug for DerivedEventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DerivedEventEmitter")
            .field("topic", &self.topic)
            .field("source", &self.source)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl DerivedEventEmitter {
    /// Create an emitter with the default retry policy.
    #[must_use]
    pub fn new(bus: Arc<dyn EventBus>, clock: Arc<dyn Clock>, topic: impl Into<String>) -> Self {
        Self {
            bus,
            clock,
            topic: topic.into(),
            source: DEFAULT_SOURCE.to_string(),
            policy: RetryPolicy::default(),
        }
    }

    /// Replace the retry policy.
    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Replace the `source` attribute.
    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Destination topic.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Publish each event in order, retrying transient failures.
    ///
    /// Failures are logged and counted, never returned.
    pub async fn emit(&self, events: Vec<DerivedEvent>, correlation_id: Option<&str>) -> EmitReport {
        let mut report = EmitReport::default();

        for event in events {
            DerivedMetrics::record_badge_transition(&event);

            let metric_event = event.clone();
            let envelope = DerivedEnvelope::new(
                uuid::Uuid::new_v4().to_string(),
                self.source.clone(),
                self.clock.now(),
                correlation_id.map(str::to_string),
                event,
            );
            let metadata = correlation_id.map(|id| json!({ "correlationId": id }));

            let serialized = match SerializedEvent::from_event(&envelope, metadata) {
                Ok(serialized) => serialized,
                Err(e) => {
                    tracing::error!(
                        event_type = %envelope.event_type,
                        error = %e,
                        "Failed to serialize derived event, dropping"
                    );
                    DerivedMetrics::record_dropped(&metric_event);
                    report.dropped += 1;
                    continue;
                }
            };

            let bus = &self.bus;
            let topic = self.topic.as_str();
            let message = &serialized;
            let published = retry_with_predicate(
                self.policy.clone(),
                move || bus.publish(topic, message),
                EventBusError::is_retryable,
            )
            .await;

            match published {
                Ok(()) => {
                    tracing::debug!(
                        event_id = %envelope.id,
                        event_type = %envelope.event_type,
                        product_id = %metric_event.product_id(),
                        "Derived event published"
                    );
                    DerivedMetrics::record_published(&metric_event);
                    report.published += 1;
                }
                Err(e) => {
                    tracing::error!(
                        event_id = %envelope.id,
                        event_type = %envelope.event_type,
                        product_id = %metric_event.product_id(),
                        correlation_id = correlation_id.unwrap_or("-"),
                        error = %e,
                        "Derived event dropped after retries"
                    );
                    DerivedMetrics::record_dropped(&metric_event);
                    report.dropped += 1;
                }
            }
        }

        report
    }
}
