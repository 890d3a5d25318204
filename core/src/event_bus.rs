//! Event bus abstraction for inbound domain events and outbound derived events.
//!
//! The service sits between upstream producers (reviews, inventory, analytics,
//! Q&A, catalog) and downstream consumers (search indexing, notifications,
//! cache invalidation). Both directions go through the [`EventBus`] trait.
//!
//! # Architecture
//!
//! ```text
//!  upstream topics                                  derived topic
//!  ┌───────────────┐                               ┌──────────────────┐
//!  │ review-events │──┐                        ┌──►│ catalog-derived  │
//!  │ inventory-... │──┼─► subscribe ─► gate ───┤   │   (keyed by id)  │
//!  │ analytics-... │──┘                        │   └──────────────────┘
//!  └───────────────┘                           └── publish
//! ```
//!
//! # Key Principles
//!
//! - **At-least-once delivery**: inbound events may be redelivered; the
//!   idempotency ledger absorbs duplicates
//! - **Ordered within partition**: producers key by product id, so events
//!   for one product arrive in order unless the producer reorders them
//! - **Best-effort outbound**: a failed publish never rolls back state
//!
//! # Implementations
//!
//! - `RecordingEventBus` in `catalog-sync-testing`: in-memory, inspectable
//! - `RedpandaEventBus` in `catalog-sync-redpanda`: Kafka-compatible
//!
//! # Example
//!
//! ```rust,ignore
//! use catalog_sync_core::event_bus::EventBus;
//! use futures::StreamExt;
//!
//! async fn example(bus: impl EventBus) {
//!     let mut stream = bus.subscribe(&["review-events", "inventory-events"]).await?;
//!     while let Some(result) = stream.next().await {
//!         match result {
//!             Ok(event) => gate.ingest(&event.data).await,
//!             Err(e) => tracing::error!("Event stream error: {}", e),
//!         }
//!     }
//! }
//! ```

use crate::event::SerializedEvent;
use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors that can occur during event bus operations.
#[derive(Error, Debug, Clone)]
pub enum EventBusError {
    /// Failed to connect to the event bus
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to publish an event to a topic
    #[error("Publish failed for topic '{topic}': {reason}")]
    PublishFailed {
        /// The topic that failed
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to subscribe to topics
    #[error("Subscription failed for topics {topics:?}: {reason}")]
    SubscriptionFailed {
        /// The topics that failed to subscribe
        topics: Vec<String>,
        /// The reason for failure
        reason: String,
    },

    /// Consumer group error
    #[error("Consumer group error: {0}")]
    ConsumerGroupError(String),

    /// Network or transport error
    #[error("Transport error: {0}")]
    TransportError(String),
}

impl EventBusError {
    /// Whether retrying the operation may succeed.
    ///
    /// Only `SubscriptionFailed` is treated as permanent; everything else is
    /// a broker or network condition.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        !matches!(self, Self::SubscriptionFailed { .. })
    }
}

/// Stream of events from subscriptions.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<SerializedEvent, EventBusError>> + Send>>;

/// Trait for event bus implementations.
///
/// # Dyn Compatibility
///
/// This trait uses explicit `Pin<Box<dyn Future>>` returns instead of `async fn`
/// so it can be shared as `Arc<dyn EventBus>` between the consumer loop and
/// the derived event emitter.
pub trait EventBus: Send + Sync {
    /// Publish an event to a topic.
    ///
    /// Implementations use [`SerializedEvent::key`] as the partition key so
    /// that derived events for one product stay ordered.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::PublishFailed`] if the publish operation fails.
    fn publish(
        &self,
        topic: &str,
        event: &SerializedEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>>;

    /// Subscribe to one or more topics and receive a stream of events.
    ///
    /// Inbound envelopes are delivered untouched in [`SerializedEvent::data`];
    /// decoding them is the ingestion gate's job.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::SubscriptionFailed`] if subscription fails.
    fn subscribe(
        &self,
        topics: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<EventStream, EventBusError>> + Send + '_>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(EventBusError::TransportError("reset".into()).is_retryable());
        assert!(
            EventBusError::PublishFailed {
                topic: "t".into(),
                reason: "queue full".into()
            }
            .is_retryable()
        );
        assert!(
            !EventBusError::SubscriptionFailed {
                topics: vec!["t".into()],
                reason: "unknown topic".into()
            }
            .is_retryable()
        );
    }
}
