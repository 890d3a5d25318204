//! Integration tests for [`RedpandaEventBus`] against a real broker.
//!
//! These start a Kafka container with testcontainers and are ignored by
//! default because they need Docker and take tens of seconds:
//!
//! ```bash
//! cargo test -p catalog-sync-redpanda --test integration_tests -- --ignored
//! ```

#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use catalog_sync_core::event::SerializedEvent;
use catalog_sync_core::event_bus::EventBus;
use catalog_sync_redpanda::RedpandaEventBus;
use futures::StreamExt;
use std::time::Duration;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::kafka::{KAFKA_PORT, Kafka};

fn json_event(event_type: &str, key: &str, body: &str) -> SerializedEvent {
    SerializedEvent::new(
        event_type.to_string(),
        Some(key.to_string()),
        body.as_bytes().to_vec(),
        None,
    )
}

async fn start_kafka() -> (ContainerAsync<Kafka>, String) {
    let kafka = Kafka::default()
        .with_env_var("KAFKA_AUTO_CREATE_TOPICS_ENABLE", "true")
        .start()
        .await
        .expect("Failed to start Kafka container");

    let host = kafka.get_host().await.expect("Failed to get host");
    let port = kafka
        .get_host_port_ipv4(KAFKA_PORT)
        .await
        .expect("Failed to get port");
    (kafka, format!("{host}:{port}"))
}

/// Publish a warmup message until the topic exists and the broker answers.
async fn ensure_topic_exists(event_bus: &RedpandaEventBus, topic: &str) {
    let warmup = json_event("warmup", "warmup", "{}");
    for attempt in 1..=60 {
        if event_bus.publish(topic, &warmup).await.is_ok() {
            tokio::time::sleep(Duration::from_secs(3)).await;
            return;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(attempt != 60, "Failed to create topic {topic}");
    }
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn json_payload_key_and_type_round_trip() {
    let (_kafka, brokers) = start_kafka().await;
    let event_bus = RedpandaEventBus::builder()
        .brokers(&brokers)
        .consumer_group("round-trip")
        .build()
        .expect("Failed to create event bus");
    ensure_topic_exists(&event_bus, "catalog-derived").await;

    let mut stream = event_bus
        .subscribe(&["catalog-derived"])
        .await
        .expect("Failed to subscribe");
    tokio::time::sleep(Duration::from_secs(2)).await;

    let mut restock = json_event(
        "product.back.in.stock",
        "p-1",
        r#"{"productId":"p-1","availableQuantity":5}"#,
    );
    restock.metadata = Some(serde_json::json!({"correlationId": "corr-9"}));
    event_bus
        .publish("catalog-derived", &restock)
        .await
        .expect("Failed to publish");

    let received = tokio::time::timeout(Duration::from_secs(15), async {
        loop {
            let event = stream
                .next()
                .await
                .expect("stream ended")
                .expect("Failed to receive event");
            if event.event_type != "warmup" {
                return event;
            }
        }
    })
    .await
    .expect("Timeout waiting for event");

    assert_eq!(received.event_type, "product.back.in.stock");
    assert_eq!(received.key.as_deref(), Some("p-1"));
    assert_eq!(received.data, restock.data);
    assert_eq!(
        received.metadata,
        Some(serde_json::json!({"correlationId": "corr-9"}))
    );
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn uncommitted_messages_are_redelivered_to_the_group() {
    let (_kafka, brokers) = start_kafka().await;
    let event_bus = RedpandaEventBus::builder()
        .brokers(&brokers)
        .consumer_group("redelivery")
        .buffer_size(1)
        .build()
        .expect("Failed to create event bus");
    ensure_topic_exists(&event_bus, "inventory-events").await;

    for i in 0..3 {
        let body = format!(r#"{{"eventId":"e-{i}","eventType":"inventory.stock.updated"}}"#);
        event_bus
            .publish("inventory-events", &json_event("", "p-1", &body))
            .await
            .expect("Failed to publish");
    }

    // Read one message, then drop the stream before the rest are handed over.
    {
        let mut stream = event_bus
            .subscribe(&["inventory-events"])
            .await
            .expect("Failed to subscribe");
        let first = tokio::time::timeout(Duration::from_secs(20), stream.next())
            .await
            .expect("Timeout waiting for first message");
        assert!(first.is_some());
    }
    tokio::time::sleep(Duration::from_secs(8)).await;

    let mut stream = event_bus
        .subscribe(&["inventory-events"])
        .await
        .expect("Failed to resubscribe");
    let mut bodies = Vec::new();
    let _ = tokio::time::timeout(Duration::from_secs(20), async {
        while let Some(Ok(event)) = stream.next().await {
            bodies.push(String::from_utf8(event.data).expect("utf8"));
            if bodies.iter().any(|b| b.contains("e-2")) {
                break;
            }
        }
    })
    .await;

    assert!(
        bodies.iter().any(|b| b.contains("e-2")),
        "last message was not redelivered: {bodies:?}"
    );
}
