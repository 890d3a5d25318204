//! Builders for inbound envelope bytes.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)]

use serde_json::{Value, json};

/// Fluent builder for a JSON envelope.
///
/// # Example
///
/// ```
/// use catalog_sync_testing::builders::EnvelopeBuilder;
/// use catalog_sync_core::envelope::EventEnvelope;
///
/// let bytes = EnvelopeBuilder::new("evt-1", "answer.created", "p-1")
///     .sequence(4)
///     .data(serde_json::json!({"questionId": "q-1"}))
///     .correlation_id("corr-1")
///     .build();
///
/// let envelope = EventEnvelope::from_slice(&bytes).unwrap();
/// assert_eq!(envelope.sequence, 4);
/// assert_eq!(envelope.correlation_id.as_deref(), Some("corr-1"));
/// ```
#[derive(Clone, Debug)]
pub struct EnvelopeBuilder {
    body: serde_json::Map<String, Value>,
}

impl EnvelopeBuilder {
    /// Start an envelope with sequence 1 and empty data.
    #[must_use]
    pub fn new(event_id: &str, event_type: &str, product_id: &str) -> Self {
        let mut body = serde_json::Map::new();
        body.insert("eventId".into(), json!(event_id));
        body.insert("eventType".into(), json!(event_type));
        body.insert("targetProductId".into(), json!(product_id));
        body.insert("occurredAt".into(), json!("2025-01-01T00:00:00Z"));
        body.insert("sequence".into(), json!(1));
        body.insert("data".into(), json!({}));
        Self { body }
    }

    /// Set the sequence.
    #[must_use]
    pub fn sequence(mut self, sequence: u64) -> Self {
        self.body.insert("sequence".into(), json!(sequence));
        self
    }

    /// Set the payload.
    #[must_use]
    pub fn data(mut self, data: Value) -> Self {
        self.body.insert("data".into(), data);
        self
    }

    /// Set a top-level correlation id.
    #[must_use]
    pub fn correlation_id(mut self, id: &str) -> Self {
        self.body.insert("correlationId".into(), json!(id));
        self
    }

    /// Remove a top-level field, to build malformed envelopes.
    #[must_use]
    pub fn without(mut self, field: &str) -> Self {
        self.body.remove(field);
        self
    }

    /// Serialize to bytes.
    #[must_use]
    pub fn build(self) -> Vec<u8> {
        serde_json::to_vec(&Value::Object(self.body)).unwrap()
    }
}

/// `product.created` envelope at sequence 0.
#[must_use]
pub fn product_created(event_id: &str, product_id: &str) -> Vec<u8> {
    EnvelopeBuilder::new(event_id, "product.created", product_id)
        .sequence(0)
        .build()
}

/// `product.deleted` envelope.
#[must_use]
pub fn product_deleted(event_id: &str, product_id: &str, sequence: u64) -> Vec<u8> {
    EnvelopeBuilder::new(event_id, "product.deleted", product_id)
        .sequence(sequence)
        .build()
}

/// `review.created` envelope.
#[must_use]
pub fn review_created(
    event_id: &str,
    product_id: &str,
    sequence: u64,
    review_id: &str,
    rating: u8,
) -> Vec<u8> {
    EnvelopeBuilder::new(event_id, "review.created", product_id)
        .sequence(sequence)
        .data(json!({"reviewId": review_id, "rating": rating}))
        .build()
}

/// `review.deleted` envelope.
#[must_use]
pub fn review_deleted(
    event_id: &str,
    product_id: &str,
    sequence: u64,
    review_id: &str,
    rating: u8,
) -> Vec<u8> {
    EnvelopeBuilder::new(event_id, "review.deleted", product_id)
        .sequence(sequence)
        .data(json!({"reviewId": review_id, "rating": rating}))
        .build()
}

/// `inventory.stock.updated` envelope.
#[must_use]
pub fn stock_updated(event_id: &str, product_id: &str, sequence: u64, available: i64) -> Vec<u8> {
    EnvelopeBuilder::new(event_id, "inventory.stock.updated", product_id)
        .sequence(sequence)
        .data(json!({"availableQuantity": available}))
        .build()
}

/// `analytics.sales.updated` envelope.
#[must_use]
pub fn sales_updated(
    event_id: &str,
    product_id: &str,
    sequence: u64,
    units_last_30_days: u64,
    category_rank: u32,
) -> Vec<u8> {
    EnvelopeBuilder::new(event_id, "analytics.sales.updated", product_id)
        .sequence(sequence)
        .data(json!({"unitsLast30Days": units_last_30_days, "categoryRank": category_rank}))
        .build()
}

/// `analytics.views.updated` envelope.
#[must_use]
pub fn views_updated(event_id: &str, product_id: &str, sequence: u64, growth: f64) -> Vec<u8> {
    EnvelopeBuilder::new(event_id, "analytics.views.updated", product_id)
        .sequence(sequence)
        .data(json!({"viewGrowthPercent": growth}))
        .build()
}

/// `question.created` envelope.
#[must_use]
pub fn question_created(
    event_id: &str,
    product_id: &str,
    sequence: u64,
    question_id: &str,
) -> Vec<u8> {
    EnvelopeBuilder::new(event_id, "question.created", product_id)
        .sequence(sequence)
        .data(json!({"questionId": question_id}))
        .build()
}

/// `answer.created` envelope.
#[must_use]
pub fn answer_created(event_id: &str, product_id: &str, sequence: u64, question_id: &str) -> Vec<u8> {
    EnvelopeBuilder::new(event_id, "answer.created", product_id)
        .sequence(sequence)
        .data(json!({"questionId": question_id}))
        .build()
}
