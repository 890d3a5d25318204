//! Event trait and the wire format shared by every bus implementation.
//!
//! Everything that crosses the broker in this system is JSON: inbound
//! envelopes are produced by other services, and the derived events we
//! publish are consumed by search indexing, notifications and caches that are
//! not necessarily written in Rust. [`SerializedEvent`] is the transport unit:
//! an event type, a partition key and the JSON payload bytes.
//!
//! # Example
//!
//! ```
//! use catalog_sync_core::event::{Event, SerializedEvent};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Clone, Debug, Serialize, Deserialize)]
//! struct PriceChanged {
//!     product_id: String,
//!     price_cents: u64,
//! }
//!
//! impl Event for PriceChanged {
//!     fn event_type(&self) -> &'static str {
//!         "price.changed"
//!     }
//!
//!     fn partition_key(&self) -> Option<&str> {
//!         Some(&self.product_id)
//!     }
//! }
//!
//! let event = PriceChanged { product_id: "p-1".into(), price_cents: 999 };
//! let serialized = SerializedEvent::from_event(&event, None).unwrap();
//! assert_eq!(serialized.key.as_deref(), Some("p-1"));
//! ```

use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Error types for event operations.
#[derive(Error, Debug)]
pub enum EventError {
    /// Failed to serialize event to bytes.
    #[error("Failed to serialize event: {0}")]
    SerializationError(String),

    /// Failed to deserialize event from bytes.
    #[error("Failed to deserialize event: {0}")]
    DeserializationError(String),
}

/// An event that can be published on the bus.
///
/// `event_type()` should return a stable dotted name such as
/// `"product.back.in.stock"`; consumers route on it.
pub trait Event: Send + Sync + 'static {
    /// Returns the event type identifier for this event.
    fn event_type(&self) -> &'static str;

    /// Key used to pick the broker partition.
    ///
    /// Events sharing a key are delivered in publication order. `None` lets
    /// the broker choose.
    fn partition_key(&self) -> Option<&str> {
        None
    }

    /// Serialize this event to JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns `EventError::SerializationError` if the event cannot be serialized,
    /// e.g. a map with non-string keys.
    fn to_json_bytes(&self) -> Result<Vec<u8>, EventError>
    where
        Self: Serialize,
    {
        serde_json::to_vec(self).map_err(|e| EventError::SerializationError(e.to_string()))
    }
}

/// A serialized event ready for the bus.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SerializedEvent {
    /// The event type identifier (e.g., "badge.assigned").
    pub event_type: String,

    /// Partition key, usually the product id.
    pub key: Option<String>,

    /// JSON payload.
    pub data: Vec<u8>,

    /// Optional transport metadata, published as message headers.
    pub metadata: Option<serde_json::Value>,
}

impl SerializedEvent {
    /// Create a new serialized event.
    #[must_use]
    pub const fn new(
        event_type: String,
        key: Option<String>,
        data: Vec<u8>,
        metadata: Option<serde_json::Value>,
    ) -> Self {
        Self {
            event_type,
            key,
            data,
            metadata,
        }
    }

    /// Create a serialized event from an `Event`.
    ///
    /// # Errors
    ///
    /// Returns `EventError::SerializationError` if the event cannot be serialized.
    pub fn from_event<E: Event + Serialize>(
        event: &E,
        metadata: Option<serde_json::Value>,
    ) -> Result<Self, EventError> {
        Ok(Self {
            event_type: event.event_type().to_string(),
            key: event.partition_key().map(str::to_string),
            data: event.to_json_bytes()?,
            metadata,
        })
    }

    /// Parse the payload as JSON.
    ///
    /// # Errors
    ///
    /// Returns `EventError::DeserializationError` if the payload is not JSON.
    pub fn payload(&self) -> Result<serde_json::Value, EventError> {
        serde_json::from_slice(&self.data)
            .map_err(|e| EventError::DeserializationError(e.to_string()))
    }
}

impl fmt::Display for SerializedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SerializedEvent {{ type: {}, key: {}, size: {} bytes }}",
            self.event_type,
            self.key.as_deref().unwrap_or("-"),
            self.data.len()
        )
    }
}
