//! Redpanda event bus for the catalog sync service.
//!
//! Implements [`EventBus`] from `catalog-sync-core` on top of rdkafka, so any
//! Kafka-compatible broker works (Redpanda, Apache Kafka, MSK).
//!
//! # Wire format
//!
//! Messages are plain JSON. Upstream services publish envelopes we do not
//! control, and downstream consumers of derived events are not Rust, so the
//! bus never adds its own framing:
//!
//! | Kafka field | Outbound (publish)                 | Inbound (subscribe)              |
//! |-------------|------------------------------------|----------------------------------|
//! | value       | [`SerializedEvent::data`]          | [`SerializedEvent::data`], as is |
//! | key         | [`SerializedEvent::key`] (product) | [`SerializedEvent::key`]         |
//! | headers     | `event_type` + string metadata     | `event_type` + other headers     |
//!
//! Keying by product id keeps every derived event for one product on one
//! partition, in publication order.
//!
//! # Delivery Semantics
//!
//! **At-least-once delivery** with manual offset commits:
//! - Offsets are committed AFTER the message is handed to the subscriber's channel
//! - If the process crashes before commit, messages are redelivered
//! - The ingestion gate's idempotency ledger absorbs the duplicates
//!
//! # Example
//!
//! ```no_run
//! use catalog_sync_core::event::SerializedEvent;
//! use catalog_sync_core::event_bus::EventBus;
//! use catalog_sync_redpanda::RedpandaEventBus;
//! use futures::StreamExt;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let event_bus = RedpandaEventBus::builder()
//!     .brokers("localhost:9092")
//!     .consumer_group("catalog-sync")
//!     .build()?;
//!
//! let event = SerializedEvent::new(
//!     "product.back.in.stock".to_string(),
//!     Some("p-1".to_string()),
//!     br#"{"productId":"p-1","availableQuantity":5}"#.to_vec(),
//!     None,
//! );
//! event_bus.publish("catalog-derived", &event).await?;
//!
//! let mut stream = event_bus.subscribe(&["inventory-events"]).await?;
//! while let Some(result) = stream.next().await {
//!     match result {
//!         Ok(event) => println!("Received {} bytes", event.data.len()),
//!         Err(e) => eprintln!("Error: {e}"),
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use catalog_sync_core::event::SerializedEvent;
use catalog_sync_core::event_bus::{EventBus, EventBusError, EventStream};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::{Header, Headers, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use serde_json::{Map, Value};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Header carrying [`SerializedEvent::event_type`].
pub const EVENT_TYPE_HEADER: &str = "event_type";

/// Default subscriber buffer.
pub const DEFAULT_BUFFER_SIZE: usize = 1000;

/// Redpanda event bus.
///
/// One producer is shared by every publish. Each [`EventBus::subscribe`] call
/// creates its own consumer in the configured group, so several service
/// instances split the inbound partitions between them.
///
/// # Example
///
/// ```no_run
/// use catalog_sync_redpanda::RedpandaEventBus;
/// use std::time::Duration;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let event_bus = RedpandaEventBus::builder()
///     .brokers("localhost:9092,localhost:9093")
///     .producer_acks("all")
///     .compression("lz4")
///     .timeout(Duration::from_secs(10))
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct RedpandaEventBus {
    producer: FutureProducer,
    brokers: String,
    timeout: Duration,
    consumer_group: Option<String>,
    buffer_size: usize,
    auto_offset_reset: String,
}

impl std::fmt::Debug for RedpandaEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedpandaEventBus")
            .field("brokers", &self.brokers)
            .field("consumer_group", &self.consumer_group)
            .field("buffer_size", &self.buffer_size)
            .field("auto_offset_reset", &self.auto_offset_reset)
            .finish_non_exhaustive()
    }
}

impl RedpandaEventBus {
    /// Create a bus with default settings.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::ConnectionFailed`] if the producer cannot be
    /// created from the broker list.
    pub fn new(brokers: &str) -> Result<Self, EventBusError> {
        Self::builder().brokers(brokers).build()
    }

    /// Create a new builder.
    #[must_use]
    pub fn builder() -> RedpandaEventBusBuilder {
        RedpandaEventBusBuilder::default()
    }

    /// Bootstrap servers.
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.brokers
    }

    /// Consumer group used by [`EventBus::subscribe`] for these topics.
    ///
    /// Without an explicit group, the id is derived from the sorted topic
    /// list so restarts resume from the same committed offsets.
    #[must_use]
    pub fn consumer_group_for(&self, topics: &[String]) -> String {
        self.consumer_group.clone().unwrap_or_else(|| {
            let mut sorted = topics.to_vec();
            sorted.sort();
            format!("catalog-sync-{}", sorted.join("-"))
        })
    }
}

/// Builder for [`RedpandaEventBus`].
#[derive(Default)]
pub struct RedpandaEventBusBuilder {
    brokers: Option<String>,
    producer_acks: Option<String>,
    compression: Option<String>,
    timeout: Option<Duration>,
    consumer_group: Option<String>,
    buffer_size: Option<usize>,
    auto_offset_reset: Option<String>,
}

impl RedpandaEventBusBuilder {
    /// Comma-separated broker addresses, e.g. `"localhost:9092"`.
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Producer acknowledgment mode: `"0"`, `"1"` or `"all"`.
    ///
    /// Default: `"all"`
    #[must_use]
    pub fn producer_acks(mut self, acks: impl Into<String>) -> Self {
        self.producer_acks = Some(acks.into());
        self
    }

    /// Compression codec: `"none"`, `"gzip"`, `"snappy"`, `"lz4"`, `"zstd"`.
    ///
    /// Default: `"none"`
    #[must_use]
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// Producer send timeout.
    ///
    /// Default: 5 seconds
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Consumer group id for subscriptions.
    ///
    /// All instances of the service should share one group so that each
    /// inbound partition is processed by exactly one of them.
    #[must_use]
    pub fn consumer_group(mut self, consumer_group: impl Into<String>) -> Self {
        self.consumer_group = Some(consumer_group.into());
        self
    }

    /// Messages buffered between the Kafka consumer and the subscriber
    /// (default 1000, minimum 1).
    #[must_use]
    pub const fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = Some(buffer_size);
        self
    }

    /// Where a new consumer group starts reading: `"earliest"`, `"latest"`
    /// or `"error"`.
    ///
    /// Default: `"earliest"`
    #[must_use]
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = Some(policy.into());
        self
    }

    /// Build the [`RedpandaEventBus`].
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::ConnectionFailed`] if brokers are not set or
    /// the producer configuration is rejected.
    pub fn build(self) -> Result<RedpandaEventBus, EventBusError> {
        let brokers = self
            .brokers
            .ok_or_else(|| EventBusError::ConnectionFailed("Brokers not configured".to_string()))?;
        let timeout = self.timeout.unwrap_or(Duration::from_secs(5));
        let acks = self.producer_acks.as_deref().unwrap_or("all");
        let compression = self.compression.as_deref().unwrap_or("none");

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", timeout.as_millis().to_string())
            .set("acks", acks)
            .set("compression.type", compression)
            .create()
            .map_err(|e| {
                EventBusError::ConnectionFailed(format!("Failed to create producer: {e}"))
            })?;

        let buffer_size = self.buffer_size.unwrap_or(DEFAULT_BUFFER_SIZE).max(1);
        let auto_offset_reset = self
            .auto_offset_reset
            .unwrap_or_else(|| "earliest".to_string());

        tracing::info!(
            brokers = %brokers,
            acks,
            compression,
            buffer_size,
            auto_offset_reset = %auto_offset_reset,
            "RedpandaEventBus created"
        );

        Ok(RedpandaEventBus {
            producer,
            brokers,
            timeout,
            consumer_group: self.consumer_group,
            buffer_size,
            auto_offset_reset,
        })
    }
}

/// Message headers for an outbound event.
///
/// String metadata values become headers verbatim; other JSON values are
/// written in their JSON text form.
fn outbound_headers(event: &SerializedEvent) -> OwnedHeaders {
    let mut headers = OwnedHeaders::new().insert(Header {
        key: EVENT_TYPE_HEADER,
        value: Some(event.event_type.as_bytes()),
    });

    if let Some(Value::Object(metadata)) = &event.metadata {
        for (key, value) in metadata {
            let text = match value {
                Value::String(s) => s.clone(),
                Value::Null => continue,
                other => other.to_string(),
            };
            headers = headers.insert(Header {
                key: key.as_str(),
                value: Some(text.as_bytes()),
            });
        }
    }

    headers
}

/// Rebuild a [`SerializedEvent`] from the parts of a received message.
///
/// The payload is passed through untouched. The event type comes from the
/// `event_type` header when the producer set one; other UTF-8 headers become
/// metadata.
fn inbound_event<H: Headers>(
    key: Option<&[u8]>,
    payload: &[u8],
    headers: Option<&H>,
) -> SerializedEvent {
    let mut event_type = String::new();
    let mut metadata = Map::new();

    if let Some(headers) = headers {
        for idx in 0..headers.count() {
            let Some(header) = headers.try_get(idx) else {
                continue;
            };
            let Some(value) = header.value.and_then(|v| std::str::from_utf8(v).ok()) else {
                continue;
            };
            if header.key == EVENT_TYPE_HEADER {
                event_type = value.to_string();
            } else {
                metadata.insert(header.key.to_string(), Value::String(value.to_string()));
            }
        }
    }

    SerializedEvent::new(
        event_type,
        key.and_then(|k| std::str::from_utf8(k).ok()).map(str::to_string),
        payload.to_vec(),
        (!metadata.is_empty()).then_some(Value::Object(metadata)),
    )
}

impl EventBus for RedpandaEventBus {
    fn publish(
        &self,
        topic: &str,
        event: &SerializedEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>> {
        let topic = topic.to_string();
        let event = event.clone();
        let timeout = self.timeout;

        Box::pin(async move {
            // Unkeyed events fall back to their type, which still gives a
            // stable partition per event type.
            let key = event.key.as_deref().unwrap_or(&event.event_type);
            let record = FutureRecord::to(&topic)
                .payload(&event.data)
                .key(key)
                .headers(outbound_headers(&event));

            match self.producer.send(record, Timeout::After(timeout)).await {
                Ok((partition, offset)) => {
                    tracing::debug!(
                        topic = %topic,
                        partition,
                        offset,
                        event_type = %event.event_type,
                        key,
                        "Event published"
                    );
                    Ok(())
                }
                Err((kafka_error, _)) => {
                    tracing::warn!(
                        topic = %topic,
                        event_type = %event.event_type,
                        key,
                        error = %kafka_error,
                        "Failed to publish event"
                    );
                    Err(EventBusError::PublishFailed {
                        topic,
                        reason: kafka_error.to_string(),
                    })
                }
            }
        })
    }

    fn subscribe(
        &self,
        topics: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<EventStream, EventBusError>> + Send + '_>> {
        let topics: Vec<String> = topics.iter().map(|s| (*s).to_string()).collect();
        let consumer_group_id = self.consumer_group_for(&topics);
        let brokers = self.brokers.clone();
        let buffer_size = self.buffer_size;
        let auto_offset_reset = self.auto_offset_reset.clone();

        Box::pin(async move {
            let consumer: StreamConsumer = ClientConfig::new()
                .set("bootstrap.servers", &brokers)
                .set("group.id", &consumer_group_id)
                .set("enable.auto.commit", "false")
                .set("auto.offset.reset", &auto_offset_reset)
                .set("session.timeout.ms", "6000")
                .set("enable.partition.eof", "false")
                .create()
                .map_err(|e| EventBusError::SubscriptionFailed {
                    topics: topics.clone(),
                    reason: format!("Failed to create consumer: {e}"),
                })?;

            let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
            consumer
                .subscribe(&topic_refs)
                .map_err(|e| EventBusError::SubscriptionFailed {
                    topics: topics.clone(),
                    reason: format!("Failed to subscribe to topics: {e}"),
                })?;

            tracing::info!(
                topics = ?topics,
                consumer_group = %consumer_group_id,
                buffer_size,
                auto_offset_reset = %auto_offset_reset,
                "Subscribed to topics"
            );

            let (tx, rx) = tokio::sync::mpsc::channel(buffer_size);

            tokio::spawn(async move {
                use futures::StreamExt;
                use rdkafka::consumer::CommitMode;

                let mut stream = consumer.stream();

                while let Some(msg_result) = stream.next().await {
                    match msg_result {
                        Ok(message) => {
                            let result = match message.payload() {
                                Some(payload) => {
                                    let event =
                                        inbound_event(message.key(), payload, message.headers());
                                    tracing::trace!(
                                        topic = message.topic(),
                                        partition = message.partition(),
                                        offset = message.offset(),
                                        size = payload.len(),
                                        "Received message"
                                    );
                                    Ok(event)
                                }
                                None => Err(EventBusError::DeserializationFailed(format!(
                                    "Message without payload at {}[{}]@{}",
                                    message.topic(),
                                    message.partition(),
                                    message.offset()
                                ))),
                            };

                            // Commit only once the subscriber has the message.
                            if tx.send(result).await.is_err() {
                                tracing::debug!("Subscriber dropped, exiting consumer task");
                                break;
                            }

                            if let Err(e) = consumer.commit_message(&message, CommitMode::Async) {
                                tracing::warn!(
                                    topic = message.topic(),
                                    partition = message.partition(),
                                    offset = message.offset(),
                                    error = %e,
                                    "Failed to commit offset (message may be redelivered)"
                                );
                            }
                        }
                        Err(e) => {
                            let err = EventBusError::TransportError(format!(
                                "Failed to receive message: {e}"
                            ));
                            if tx.send(Err(err)).await.is_err() {
                                break;
                            }
                        }
                    }
                }

                tracing::debug!("Consumer task exiting");
            });

            let stream = async_stream::stream! {
                let mut rx = rx;
                while let Some(result) = rx.recv().await {
                    yield result;
                }
            };

            Ok(Box::pin(stream) as EventStream)
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn redpanda_event_bus_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<RedpandaEventBus>();
        assert_sync::<RedpandaEventBus>();
    }

    #[test]
    fn build_requires_brokers() {
        let err = RedpandaEventBus::builder().build().unwrap_err();
        assert!(matches!(err, EventBusError::ConnectionFailed(_)));
    }

    #[test]
    fn consumer_group_defaults_to_sorted_topics() {
        let bus = RedpandaEventBus::new("localhost:9092").unwrap();
        let topics = vec!["review-events".to_string(), "inventory-events".to_string()];
        assert_eq!(
            bus.consumer_group_for(&topics),
            "catalog-sync-inventory-events-review-events"
        );

        let bus = RedpandaEventBus::builder()
            .brokers("localhost:9092")
            .consumer_group("catalog-sync")
            .build()
            .unwrap();
        assert_eq!(bus.consumer_group_for(&topics), "catalog-sync");
    }

    #[test]
    fn headers_carry_type_and_string_metadata() {
        let event = SerializedEvent::new(
            "badge.assigned".to_string(),
            Some("p-1".to_string()),
            b"{}".to_vec(),
            Some(json!({"correlationId": "corr-1", "attempt": 2, "skip": null})),
        );

        let headers = outbound_headers(&event);
        let decoded = inbound_event(Some(b"p-1"), &event.data, Some(&headers));

        assert_eq!(decoded.event_type, "badge.assigned");
        assert_eq!(decoded.key.as_deref(), Some("p-1"));
        assert_eq!(decoded.data, b"{}");
        assert_eq!(
            decoded.metadata,
            Some(json!({"correlationId": "corr-1", "attempt": "2"}))
        );
    }

    #[test]
    fn inbound_without_headers_keeps_raw_payload() {
        let payload = br#"{"eventId":"e-1","eventType":"review.created"}"#;
        let decoded = inbound_event::<OwnedHeaders>(None, payload, None);

        assert!(decoded.event_type.is_empty());
        assert!(decoded.key.is_none());
        assert!(decoded.metadata.is_none());
        assert_eq!(decoded.data, payload);
    }
}
