//! Inbound event envelopes and their typed payloads.
//!
//! Upstream services publish JSON envelopes:
//!
//! ```text
//! { "eventId": "...", "eventType": "review.created",
//!   "targetProductId": "...", "occurredAt": "2024-01-01T00:00:00Z",
//!   "sequence": 42, "correlationId": "...", "data": { ... } }
//! ```
//!
//! Decoding happens in two steps so the gate can consult the idempotency
//! ledger as early as possible:
//!
//! 1. [`EventEnvelope::from_slice`] validates the envelope itself. An envelope
//!    without `eventId`, `targetProductId` or `sequence` is malformed.
//! 2. [`EventEnvelope::decode_event`] validates the type-specific `data` and
//!    produces a [`ProductEvent`].
//!
//! Both steps fail with [`EnvelopeError`], which the gate classifies as a
//! malformed event: dropped, logged, never retried.

use crate::product::{ProductId, Rating};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

/// Event type names accepted on the inbound topics.
pub mod event_types {
    /// A review was created.
    pub const REVIEW_CREATED: &str = "review.created";
    /// A review's rating changed.
    pub const REVIEW_UPDATED: &str = "review.updated";
    /// A review was deleted.
    pub const REVIEW_DELETED: &str = "review.deleted";
    /// Absolute stock level changed.
    pub const STOCK_UPDATED: &str = "inventory.stock.updated";
    /// Reserved quantity grew.
    pub const INVENTORY_RESERVED: &str = "inventory.reserved";
    /// Reserved quantity shrank.
    pub const INVENTORY_RELEASED: &str = "inventory.released";
    /// New sales snapshot.
    pub const SALES_UPDATED: &str = "analytics.sales.updated";
    /// New views snapshot.
    pub const VIEWS_UPDATED: &str = "analytics.views.updated";
    /// A question was asked.
    pub const QUESTION_CREATED: &str = "question.created";
    /// A question received an answer.
    pub const ANSWER_CREATED: &str = "answer.created";
    /// A question was deleted.
    pub const QUESTION_DELETED: &str = "question.deleted";
    /// The catalog created a product.
    pub const PRODUCT_CREATED: &str = "product.created";
    /// The catalog deleted a product.
    pub const PRODUCT_DELETED: &str = "product.deleted";
}

/// Errors raised while decoding an inbound envelope.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    /// The bytes are not a JSON object of the expected shape.
    #[error("Invalid envelope JSON: {0}")]
    InvalidJson(String),

    /// A required envelope field is absent or empty.
    #[error("Envelope missing required field '{0}'")]
    MissingField(&'static str),

    /// The event type is not one this service handles.
    #[error("Unsupported event type: {0}")]
    UnsupportedEventType(String),

    /// The type-specific payload is missing fields or has invalid values.
    #[error("Invalid data for {event_type}: {reason}")]
    InvalidData {
        /// Event type being decoded.
        event_type: String,
        /// What was wrong.
        reason: String,
    },
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEnvelope {
    #[serde(alias = "id")]
    event_id: Option<String>,
    #[serde(alias = "type")]
    event_type: Option<String>,
    target_product_id: Option<String>,
    occurred_at: Option<DateTime<Utc>>,
    sequence: Option<u64>,
    correlation_id: Option<String>,
    #[serde(default)]
    metadata: Option<Value>,
    #[serde(default)]
    data: Option<Value>,
}

/// A validated inbound envelope.
#[derive(Clone, Debug, PartialEq)]
pub struct EventEnvelope {
    /// Globally unique event id; the dedup key.
    pub event_id: String,
    /// Dotted event type.
    pub event_type: String,
    /// Product the event targets.
    pub product_id: ProductId,
    /// When the event happened upstream, if the producer said.
    pub occurred_at: Option<DateTime<Utc>>,
    /// Producer-assigned sequence used for ordering checks.
    pub sequence: u64,
    /// Correlation id from the envelope or its metadata.
    pub correlation_id: Option<String>,
    /// Type-specific payload, not yet validated.
    pub data: Value,
}

fn non_empty(value: Option<String>, field: &'static str) -> Result<String, EnvelopeError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(EnvelopeError::MissingField(field)),
    }
}

impl EventEnvelope {
    /// Decode and validate an envelope from raw bytes.
    ///
    /// # Errors
    ///
    /// - [`EnvelopeError::InvalidJson`] if the bytes are not a JSON envelope
    /// - [`EnvelopeError::MissingField`] if `eventId`, `eventType`,
    ///   `targetProductId` or `sequence` is absent or blank
    ///
    /// # Examples
    ///
    /// ```
    /// use catalog_sync_core::envelope::{EnvelopeError, EventEnvelope};
    ///
    /// let err = EventEnvelope::from_slice(br#"{"eventType": "review.created"}"#).unwrap_err();
    /// assert_eq!(err, EnvelopeError::MissingField("eventId"));
    /// ```
    pub fn from_slice(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let raw: RawEnvelope =
            serde_json::from_slice(bytes).map_err(|e| EnvelopeError::InvalidJson(e.to_string()))?;

        let event_id = non_empty(raw.event_id, "eventId")?;
        let event_type = non_empty(raw.event_type, "eventType")?;
        let product_id = ProductId::new(non_empty(raw.target_product_id, "targetProductId")?);
        let sequence = raw.sequence.ok_or(EnvelopeError::MissingField("sequence"))?;

        let correlation_id = raw.correlation_id.or_else(|| {
            raw.metadata
                .as_ref()
                .and_then(|m| m.get("correlationId"))
                .and_then(Value::as_str)
                .map(str::to_string)
        });

        Ok(Self {
            event_id,
            event_type,
            product_id,
            occurred_at: raw.occurred_at,
            sequence,
            correlation_id,
            data: raw.data.unwrap_or(Value::Null),
        })
    }

    /// Ledger stream the event belongs to.
    #[must_use]
    pub fn stream_name(&self) -> &'static str {
        stream_for(&self.event_type)
    }

    /// Decode the type-specific payload.
    ///
    /// # Errors
    ///
    /// - [`EnvelopeError::UnsupportedEventType`] for unknown event types
    /// - [`EnvelopeError::InvalidData`] when required `data` fields are absent
    ///   or a rating is outside 1..=5
    pub fn decode_event(&self) -> Result<ProductEvent, EnvelopeError> {
        use event_types as t;

        let event = match self.event_type.as_str() {
            t::REVIEW_CREATED => {
                let d: ReviewCreatedData = self.data_as()?;
                ProductEvent::ReviewCreated {
                    review_id: self.id_field(d.review_id, "reviewId")?,
                    rating: d.rating,
                    verified: d.is_verified_purchase,
                }
            }
            t::REVIEW_UPDATED => {
                let d: ReviewUpdatedData = self.data_as()?;
                ProductEvent::ReviewUpdated {
                    review_id: self.id_field(d.review_id, "reviewId")?,
                    old_rating: d.old_rating,
                    new_rating: d.new_rating,
                }
            }
            t::REVIEW_DELETED => {
                let d: ReviewDeletedData = self.data_as()?;
                ProductEvent::ReviewDeleted {
                    review_id: self.id_field(d.review_id, "reviewId")?,
                    rating: d.rating,
                    verified: d.is_verified_purchase,
                }
            }
            t::STOCK_UPDATED => {
                let d: StockUpdatedData = self.data_as()?;
                ProductEvent::StockUpdated {
                    available_quantity: d.available_quantity,
                }
            }
            t::INVENTORY_RESERVED => {
                let d: ReservationData = self.data_as()?;
                ProductEvent::InventoryReserved {
                    reserved_quantity: d.reserved_quantity,
                }
            }
            t::INVENTORY_RELEASED => {
                let d: ReservationData = self.data_as()?;
                ProductEvent::InventoryReleased {
                    reserved_quantity: d.reserved_quantity,
                }
            }
            t::SALES_UPDATED => {
                let d: SalesData = self.data_as()?;
                ProductEvent::SalesUpdated {
                    units_last_30_days: d.units_last_30_days,
                    category_rank: d.category_rank,
                }
            }
            t::VIEWS_UPDATED => {
                let d: ViewsData = self.data_as()?;
                ProductEvent::ViewsUpdated {
                    view_growth_percent: d.view_growth_percent,
                }
            }
            t::QUESTION_CREATED => {
                let d: QuestionData = self.data_as()?;
                ProductEvent::QuestionCreated {
                    question_id: self.id_field(d.question_id, "questionId")?,
                }
            }
            t::ANSWER_CREATED => {
                let d: QuestionData = self.data_as()?;
                ProductEvent::AnswerCreated {
                    question_id: self.id_field(d.question_id, "questionId")?,
                }
            }
            t::QUESTION_DELETED => {
                let d: QuestionDeletedData = self.data_as()?;
                ProductEvent::QuestionDeleted {
                    question_id: self.id_field(d.question_id, "questionId")?,
                    had_answer: d.had_answer,
                }
            }
            t::PRODUCT_CREATED => ProductEvent::ProductCreated,
            t::PRODUCT_DELETED => ProductEvent::ProductDeleted,
            other => return Err(EnvelopeError::UnsupportedEventType(other.to_string())),
        };

        Ok(event)
    }

    /// Decode the envelope and its payload in one go.
    ///
    /// # Errors
    ///
    /// Any error from [`Self::decode_event`].
    pub fn into_product_event(self) -> Result<(Self, ProductEvent), EnvelopeError> {
        let event = self.decode_event()?;
        Ok((self, event))
    }

    fn data_as<T: DeserializeOwned>(&self) -> Result<T, EnvelopeError> {
        if !self.data.is_object() {
            return Err(self.invalid("data must be a JSON object"));
        }
        serde_json::from_value(self.data.clone()).map_err(|e| self.invalid(e.to_string()))
    }

    fn id_field(&self, value: String, field: &str) -> Result<String, EnvelopeError> {
        if value.trim().is_empty() {
            return Err(self.invalid(format!("{field} must not be empty")));
        }
        Ok(value)
    }

    fn invalid(&self, reason: impl Into<String>) -> EnvelopeError {
        EnvelopeError::InvalidData {
            event_type: self.event_type.clone(),
            reason: reason.into(),
        }
    }
}

/// Every ledger stream name [`stream_for`] can produce for a supported type.
pub const STREAMS: [&str; 5] = ["reviews", "inventory", "analytics", "qa", "catalog"];

/// Ledger stream for an event type: its dotted prefix family.
#[must_use]
pub fn stream_for(event_type: &str) -> &'static str {
    match event_type.split('.').next() {
        Some("review") => "reviews",
        Some("inventory") => "inventory",
        Some("analytics") => "analytics",
        Some("question" | "answer") => "qa",
        Some("product") => "catalog",
        _ => "unknown",
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReviewCreatedData {
    review_id: String,
    rating: Rating,
    #[serde(default)]
    is_verified_purchase: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReviewUpdatedData {
    review_id: String,
    old_rating: Rating,
    new_rating: Rating,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReviewDeletedData {
    review_id: String,
    rating: Rating,
    #[serde(default)]
    is_verified_purchase: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StockUpdatedData {
    available_quantity: i64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReservationData {
    reserved_quantity: i64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SalesData {
    units_last_30_days: u64,
    category_rank: u32,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ViewsData {
    view_growth_percent: f64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct QuestionData {
    question_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct QuestionDeletedData {
    question_id: String,
    had_answer: bool,
}

/// A decoded inbound event.
///
/// Quantities stay signed here: a negative quantity is a well-formed event
/// carrying bad data, which the availability recalculator reports as an
/// invariant violation rather than a decode error.
#[derive(Clone, Debug, PartialEq)]
pub enum ProductEvent {
    /// `review.created`
    ReviewCreated {
        /// Review id.
        review_id: String,
        /// Star rating.
        rating: Rating,
        /// Verified purchase flag.
        verified: bool,
    },
    /// `review.updated`
    ReviewUpdated {
        /// Review id.
        review_id: String,
        /// Rating the producer believes was counted before.
        old_rating: Rating,
        /// Rating to count from now on.
        new_rating: Rating,
    },
    /// `review.deleted`
    ReviewDeleted {
        /// Review id.
        review_id: String,
        /// Rating of the deleted review.
        rating: Rating,
        /// Verified purchase flag.
        verified: bool,
    },
    /// `inventory.stock.updated`
    StockUpdated {
        /// Absolute available quantity.
        available_quantity: i64,
    },
    /// `inventory.reserved`
    InventoryReserved {
        /// Absolute reserved quantity.
        reserved_quantity: i64,
    },
    /// `inventory.released`
    InventoryReleased {
        /// Absolute reserved quantity.
        reserved_quantity: i64,
    },
    /// `analytics.sales.updated`
    SalesUpdated {
        /// Units sold over 30 days.
        units_last_30_days: u64,
        /// Category rank.
        category_rank: u32,
    },
    /// `analytics.views.updated`
    ViewsUpdated {
        /// View growth in percent.
        view_growth_percent: f64,
    },
    /// `question.created`
    QuestionCreated {
        /// Question id.
        question_id: String,
    },
    /// `answer.created`
    AnswerCreated {
        /// Question id the answer belongs to.
        question_id: String,
    },
    /// `question.deleted`
    QuestionDeleted {
        /// Question id.
        question_id: String,
        /// Whether the question had an answer when deleted.
        had_answer: bool,
    },
    /// `product.created`
    ProductCreated,
    /// `product.deleted`
    ProductDeleted,
}

impl ProductEvent {
    /// Dotted event type name.
    #[must_use]
    pub const fn event_type(&self) -> &'static str {
        use event_types as t;
        match self {
            Self::ReviewCreated { .. } => t::REVIEW_CREATED,
            Self::ReviewUpdated { .. } => t::REVIEW_UPDATED,
            Self::ReviewDeleted { .. } => t::REVIEW_DELETED,
            Self::StockUpdated { .. } => t::STOCK_UPDATED,
            Self::InventoryReserved { .. } => t::INVENTORY_RESERVED,
            Self::InventoryReleased { .. } => t::INVENTORY_RELEASED,
            Self::SalesUpdated { .. } => t::SALES_UPDATED,
            Self::ViewsUpdated { .. } => t::VIEWS_UPDATED,
            Self::QuestionCreated { .. } => t::QUESTION_CREATED,
            Self::AnswerCreated { .. } => t::ANSWER_CREATED,
            Self::QuestionDeleted { .. } => t::QUESTION_DELETED,
            Self::ProductCreated => t::PRODUCT_CREATED,
            Self::ProductDeleted => t::PRODUCT_DELETED,
        }
    }
}
