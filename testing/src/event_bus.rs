//! Recording event bus for tests.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)]

use catalog_sync_core::event::SerializedEvent;
use catalog_sync_core::event_bus::{EventBus, EventBusError, EventStream};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

#[derive(Debug)]
struct Subscriber {
    topics: Vec<String>,
    tx: mpsc::UnboundedSender<SerializedEvent>,
}

#[derive(Debug, Default)]
struct Inner {
    published: Vec<(String, SerializedEvent)>,
    pending: Vec<(String, SerializedEvent)>,
    subscribers: Vec<Subscriber>,
}

/// In-memory bus that records publishes and feeds subscribers on demand.
///
/// - [`RecordingEventBus::publish`] stores the event for inspection
/// - [`RecordingEventBus::push_inbound`] delivers bytes to subscribers of a
///   topic, buffering them until someone subscribes
/// - [`RecordingEventBus::fail_next_publishes`] and
///   [`RecordingEventBus::set_publish_failing`] simulate broker outages
///
/// # Example
///
/// ```
/// use catalog_sync_testing::RecordingEventBus;
/// use catalog_sync_core::event::SerializedEvent;
/// use catalog_sync_core::event_bus::EventBus;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let bus = RecordingEventBus::new();
/// let event = SerializedEvent::new("badge.assigned".into(), Some("p-1".into()), b"{}".to_vec(), None);
/// bus.publish("derived", &event).await?;
/// assert_eq!(bus.published_of_type("badge.assigned").len(), 1);
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug, Default)]
pub struct RecordingEventBus {
    inner: Arc<Mutex<Inner>>,
    failures_to_inject: Arc<AtomicUsize>,
    always_fail: Arc<AtomicBool>,
    publish_attempts: Arc<AtomicUsize>,
}

impl RecordingEventBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` publishes.
    pub fn fail_next_publishes(&self, n: usize) {
        self.failures_to_inject.store(n, Ordering::SeqCst);
    }

    /// Fail every publish until switched off.
    pub fn set_publish_failing(&self, failing: bool) {
        self.always_fail.store(failing, Ordering::SeqCst);
    }

    /// Number of publish calls, failed or not.
    #[must_use]
    pub fn publish_attempts(&self) -> usize {
        self.publish_attempts.load(Ordering::SeqCst)
    }

    /// Successfully published events with their topics.
    #[must_use]
    pub fn published(&self) -> Vec<(String, SerializedEvent)> {
        self.inner.lock().unwrap().published.clone()
    }

    /// Published events of one type.
    #[must_use]
    pub fn published_of_type(&self, event_type: &str) -> Vec<SerializedEvent> {
        self.inner
            .lock()
            .unwrap()
            .published
            .iter()
            .filter(|(_, e)| e.event_type == event_type)
            .map(|(_, e)| e.clone())
            .collect()
    }

    /// Forget everything published so far.
    pub fn clear_published(&self) {
        self.inner.lock().unwrap().published.clear();
    }

    /// Deliver raw bytes to subscribers of `topic`.
    pub fn push_inbound(&self, topic: &str, payload: Vec<u8>) {
        let event = SerializedEvent::new(String::new(), None, payload, None);
        let mut inner = self.inner.lock().unwrap();
        inner.subscribers.retain(|s| !s.tx.is_closed());

        let mut delivered = false;
        for subscriber in inner
            .subscribers
            .iter()
            .filter(|s| s.topics.iter().any(|t| t == topic))
        {
            delivered |= subscriber.tx.send(event.clone()).is_ok();
        }
        if !delivered {
            inner.pending.push((topic.to_string(), event));
        }
    }

    /// Drop every subscriber's sender, ending their streams.
    pub fn close_subscriptions(&self) {
        self.inner.lock().unwrap().subscribers.clear();
    }

    fn take_injected_failure(&self) -> bool {
        self.always_fail.load(Ordering::SeqCst)
            || self
                .failures_to_inject
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
    }
}

impl EventBus for RecordingEventBus {
    fn publish(
        &self,
        topic: &str,
        event: &SerializedEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>> {
        let topic = topic.to_string();
        let event = event.clone();
        Box::pin(async move {
            self.publish_attempts.fetch_add(1, Ordering::SeqCst);
            if self.take_injected_failure() {
                return Err(EventBusError::PublishFailed {
                    topic,
                    reason: "injected failure".to_string(),
                });
            }
            self.inner.lock().unwrap().published.push((topic, event));
            Ok(())
        })
    }

    fn subscribe(
        &self,
        topics: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<EventStream, EventBusError>> + Send + '_>> {
        let topics: Vec<String> = topics.iter().map(|t| (*t).to_string()).collect();
        Box::pin(async move {
            let (tx, mut rx) = mpsc::unbounded_channel();
            {
                let mut inner = self.inner.lock().unwrap();
                let pending = std::mem::take(&mut inner.pending);
                for (topic, event) in pending {
                    if topics.contains(&topic) {
                        let _ = tx.send(event);
                    } else {
                        inner.pending.push((topic, event));
                    }
                }
                inner.subscribers.push(Subscriber { topics, tx });
            }

            let stream = async_stream::stream! {
                while let Some(event) = rx.recv().await {
                    yield Ok(event);
                }
            };
            Ok(Box::pin(stream) as EventStream)
        })
    }
}
