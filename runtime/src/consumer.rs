//! Bus consumer feeding the ingestion gate.
//!
//! Subscribe, hand each message to a bounded pool of workers, reconnect when
//! the stream ends, stop on shutdown.
//!
//! ```text
//! loop {
//!     subscribe(topics)
//!     while let Some(msg) = stream.next() {
//!         acquire worker permit          (backpressure when all busy)
//!         spawn: gate.ingest(msg)        (retry TransientFailure until it clears)
//!     }
//!     sleep(retry_delay)                 (stream ended or subscribe failed)
//! }
//! ```
//!
//! The bus commits a message once it is handed to the consumer, so a
//! transient failure is never dropped here: the worker keeps retrying with
//! capped backoff until the gate returns any other disposition. Only
//! shutdown interrupts that loop.
//!
//! On shutdown the consumer stops reading, signals workers still backing off
//! and waits for in-flight workers.

use crate::gate::IngestionGate;
use crate::retry::RetryPolicy;
use catalog_sync_core::disposition::Disposition;
use catalog_sync_core::event::SerializedEvent;
use catalog_sync_core::event_bus::{EventBus, EventStream};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, broadcast, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// Default number of concurrent gate workers.
pub const DEFAULT_WORKERS: usize = 16;

/// Consumes inbound topics and drives the gate.
///
/// # Example
///
/// ```rust,ignore
/// let consumer = EventConsumer::builder()
///     .name("catalog-sync")
///     .topics(vec!["reviews".to_string(), "inventory".to_string()])
///     .event_bus(bus)
///     .gate(gate)
///     .shutdown(shutdown_rx)
///     .workers(16)
///     .build()?;
///
/// let handle = consumer.spawn();
/// ```
pub struct EventConsumer {
    name: String,
    topics: Vec<String>,
    event_bus: Arc<dyn EventBus>,
    gate: Arc<IngestionGate>,
    shutdown: broadcast::Receiver<()>,
    retry_delay: Duration,
    workers: usize,
    transient_policy: RetryPolicy,
}

impl EventConsumer {
    /// Create a builder for configuring a consumer.
    #[must_use]
    pub fn builder() -> EventConsumerBuilder {
        EventConsumerBuilder::default()
    }

    /// Spawn the consumer as a background task.
    #[must_use]
    pub fn spawn(mut self) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(&mut self) {
        info!(consumer = %self.name, workers = self.workers, "Event consumer started");
        let permits = Arc::new(Semaphore::new(self.workers));
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut in_flight = JoinSet::new();

        loop {
            let topics: Vec<&str> = self.topics.iter().map(String::as_str).collect();

            tokio::select! {
                _ = self.shutdown.recv() => {
                    info!(consumer = %self.name, "Event consumer received shutdown signal");
                    break;
                }
                subscribed = self.event_bus.subscribe(&topics) => {
                    match subscribed {
                        Ok(mut stream) => {
                            info!(consumer = %self.name, topics = ?self.topics, "Subscribed to event bus");
                            if self.drain(&mut stream, &permits, &stop_rx, &mut in_flight).await {
                                break;
                            }
                            warn!(
                                consumer = %self.name,
                                "Event stream ended, reconnecting in {:?}",
                                self.retry_delay
                            );
                        }
                        Err(e) => {
                            error!(
                                consumer = %self.name,
                                error = %e,
                                "Failed to subscribe to event bus, retrying in {:?}",
                                self.retry_delay
                            );
                        }
                    }

                    tokio::select! {
                        _ = self.shutdown.recv() => break,
                        () = tokio::time::sleep(self.retry_delay) => {}
                    }
                }
            }
        }

        let _ = stop_tx.send(true);
        while in_flight.join_next().await.is_some() {}
        info!(consumer = %self.name, "Event consumer stopped");
    }

    /// Feed the stream to workers. Returns `true` on shutdown.
    async fn drain(
        &mut self,
        stream: &mut EventStream,
        permits: &Arc<Semaphore>,
        stop: &watch::Receiver<bool>,
        in_flight: &mut JoinSet<()>,
    ) -> bool {
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => return true,
                next = stream.next() => {
                    match next {
                        Some(Ok(message)) => {
                            // Every worker may be backing off on a transient
                            // failure; shutdown still has to get through.
                            let permit = tokio::select! {
                                _ = self.shutdown.recv() => {
                                    abandon(&message, 0);
                                    return true;
                                }
                                permit = Arc::clone(permits).acquire_owned() => permit,
                            };
                            let Ok(permit) = permit else {
                                return true;
                            };
                            let gate = Arc::clone(&self.gate);
                            let policy = self.transient_policy.clone();
                            let stop = stop.clone();
                            in_flight.spawn(async move {
                                handle_message(&gate, &policy, &message, stop).await;
                                drop(permit);
                            });
                            while in_flight.try_join_next().is_some() {}
                        }
                        Some(Err(e)) => {
                            warn!(consumer = %self.name, error = %e, "Error receiving event");
                        }
                        None => return false,
                    }
                }
            }
        }
    }
}

/// Ingest one message, retrying for as long as the gate reports a transient
/// failure.
///
/// The backoff grows to the policy's `max_delay` and stays there; the
/// policy's `max_retries` does not apply. Returns early only when `stop`
/// flips, in which case the message is abandoned and logged.
async fn handle_message(
    gate: &IngestionGate,
    policy: &RetryPolicy,
    message: &SerializedEvent,
    mut stop: watch::Receiver<bool>,
) {
    let key = message.key.as_deref().unwrap_or("-");
    let mut attempt = 0usize;

    loop {
        let disposition = gate.ingest(&message.data).await;
        if !matches!(disposition, Disposition::TransientFailure) {
            if attempt > 0 {
                info!(
                    key,
                    attempt,
                    disposition = disposition.as_str(),
                    "Message cleared after transient failures"
                );
            }
            return;
        }

        let delay = policy.sleep_for_attempt(attempt);
        let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        if attempt == 0 {
            warn!(key, delay_ms, "Transient failure, retrying until it clears");
        } else {
            debug!(key, attempt, delay_ms, "Transient failure persists, retrying");
        }
        attempt = attempt.saturating_add(1);

        let stopped = *stop.borrow();
        if stopped {
            abandon(message, attempt);
            return;
        }
        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            _ = stop.changed() => {
                abandon(message, attempt);
                return;
            }
        }
    }
}

fn abandon(message: &SerializedEvent, attempts: usize) {
    error!(
        key = message.key.as_deref().unwrap_or("-"),
        size = message.data.len(),
        attempts,
        "Shutting down before message was applied; it will not be redelivered"
    );
}

/// Builder for [`EventConsumer`].
#[derive(Default)]
pub struct EventConsumerBuilder {
    name: Option<String>,
    topics: Vec<String>,
    event_bus: Option<Arc<dyn EventBus>>,
    gate: Option<Arc<IngestionGate>>,
    shutdown: Option<broadcast::Receiver<()>>,
    retry_delay: Option<Duration>,
    workers: Option<usize>,
    transient_policy: Option<RetryPolicy>,
}

impl EventConsumerBuilder {
    /// Consumer name for logs.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Topics to subscribe to.
    #[must_use]
    pub fn topics(mut self, topics: Vec<String>) -> Self {
        self.topics = topics;
        self
    }

    /// Bus to consume from.
    #[must_use]
    pub fn event_bus(mut self, bus: Arc<dyn EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    /// Gate receiving each message.
    #[must_use]
    pub fn gate(mut self, gate: Arc<IngestionGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Shutdown signal.
    #[must_use]
    pub fn shutdown(mut self, shutdown: broadcast::Receiver<()>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Delay before resubscribing (default 5s).
    #[must_use]
    pub const fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = Some(delay);
        self
    }

    /// Concurrent gate workers (default 16, minimum 1).
    #[must_use]
    pub const fn workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    /// Backoff between attempts while the gate reports a transient failure.
    ///
    /// Defaults to 100ms doubling up to 5s. Attempts continue until the
    /// failure clears or the consumer shuts down.
    #[must_use]
    pub fn transient_policy(mut self, policy: RetryPolicy) -> Self {
        self.transient_policy = Some(policy);
        self
    }

    /// Build the consumer.
    ///
    /// # Errors
    ///
    /// Returns the name of the first missing required field: `event_bus`,
    /// `gate` or `shutdown`.
    pub fn build(self) -> Result<EventConsumer, &'static str> {
        Ok(EventConsumer {
            name: self.name.unwrap_or_else(|| "catalog-sync".to_string()),
            topics: self.topics,
            event_bus: self.event_bus.ok_or("event_bus")?,
            gate: self.gate.ok_or("gate")?,
            shutdown: self.shutdown.ok_or("shutdown")?,
            retry_delay: self.retry_delay.unwrap_or(Duration::from_secs(5)),
            workers: self.workers.unwrap_or(DEFAULT_WORKERS).max(1),
            transient_policy: self.transient_policy.unwrap_or_else(|| {
                RetryPolicy::builder()
                    .initial_delay(Duration::from_millis(100))
                    .max_delay(Duration::from_secs(5))
                    .build()
            }),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::{DerivedEventEmitter, LaneRouter};
    use catalog_sync_core::product::ProductId;
    use catalog_sync_core::recalc::RecalcSettings;
    use catalog_sync_testing::{
        InMemoryAggregateStore, InMemoryLedger, RecordingEventBus, builders, test_clock,
    };

    fn gate_over(store: &InMemoryAggregateStore, bus: &RecordingEventBus) -> Arc<IngestionGate> {
        let clock = Arc::new(test_clock());
        let router = LaneRouter::new(Arc::new(store.clone()), clock.clone(), RecalcSettings::default());
        let emitter = DerivedEventEmitter::new(Arc::new(bus.clone()), clock, "derived");
        Arc::new(IngestionGate::new(Arc::new(InMemoryLedger::new()), router, emitter))
    }

    #[tokio::test]
    async fn consumes_until_shutdown() {
        let store = InMemoryAggregateStore::new();
        let bus = RecordingEventBus::new();
        let gate = gate_over(&store, &bus);

        bus.push_inbound("catalog", builders::product_created("e-0", "p-1"));
        let (tx, rx) = broadcast::channel(1);
        let consumer = EventConsumer::builder()
            .topics(vec!["catalog".to_string(), "inventory".to_string()])
            .event_bus(Arc::new(bus.clone()))
            .gate(gate)
            .shutdown(rx)
            .workers(2)
            .retry_delay(Duration::from_millis(10))
            .build()
            .unwrap();
        let handle = consumer.spawn();

        for _ in 0..100 {
            if store.get(&ProductId::new("p-1")).is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        bus.push_inbound("inventory", builders::stock_updated("e-1", "p-1", 1, 3));
        for _ in 0..100 {
            if store.get(&ProductId::new("p-1")).unwrap().version == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        tx.send(()).unwrap();
        handle.await.unwrap();
        assert_eq!(
            store.get(&ProductId::new("p-1")).unwrap().availability.available_quantity,
            3
        );
    }

    #[tokio::test]
    async fn review_arriving_before_its_product_is_kept_until_creation() {
        let store = InMemoryAggregateStore::new();
        let bus = RecordingEventBus::new();
        let (tx, rx) = broadcast::channel(1);
        let consumer = EventConsumer::builder()
            .topics(vec!["catalog".to_string(), "reviews".to_string()])
            .event_bus(Arc::new(bus.clone()))
            .gate(gate_over(&store, &bus))
            .shutdown(rx)
            .workers(2)
            .transient_policy(
                RetryPolicy::builder()
                    .max_retries(1)
                    .initial_delay(Duration::from_millis(1))
                    .max_delay(Duration::from_millis(10))
                    .jitter(false)
                    .build(),
            )
            .build()
            .unwrap();
        let handle = consumer.spawn();

        bus.push_inbound("reviews", builders::review_created("e-1", "p-1", 1, "r-1", 5));
        // Far longer than one retry at this policy's delays.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(store.get(&ProductId::new("p-1")).is_none());

        bus.push_inbound("catalog", builders::product_created("e-0", "p-1"));
        let mut total = 0;
        for _ in 0..200 {
            total = store
                .get(&ProductId::new("p-1"))
                .map_or(0, |p| p.review_aggregate.total_count);
            if total == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        tx.send(()).unwrap();
        handle.await.unwrap();
        assert_eq!(total, 1, "review held back by the missing product was lost");
    }

    #[tokio::test]
    async fn shutdown_interrupts_a_message_that_never_clears() {
        let store = InMemoryAggregateStore::new();
        let bus = RecordingEventBus::new();
        let (tx, rx) = broadcast::channel(1);
        let consumer = EventConsumer::builder()
            .topics(vec!["reviews".to_string()])
            .event_bus(Arc::new(bus.clone()))
            .gate(gate_over(&store, &bus))
            .shutdown(rx)
            .workers(1)
            .build()
            .unwrap();
        let handle = consumer.spawn();

        // The second message waits for the only worker, which never frees up.
        bus.push_inbound("reviews", builders::review_created("e-1", "ghost", 1, "r-1", 4));
        bus.push_inbound("reviews", builders::review_created("e-2", "ghost", 2, "r-2", 3));
        tokio::time::sleep(Duration::from_millis(50)).await;

        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("consumer stops while a worker is backing off")
            .unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn build_requires_gate() {
        let (_tx, rx) = broadcast::channel(1);
        let err = EventConsumer::builder()
            .event_bus(Arc::new(RecordingEventBus::new()))
            .shutdown(rx)
            .build()
            .err();
        assert_eq!(err, Some("gate"));
    }
}
