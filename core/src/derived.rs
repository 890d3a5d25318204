//! Follow-on events produced as a side effect of recalculation.
//!
//! Derived events are notifications, not writes: by the time one exists the
//! aggregate change that caused it is already durable. They are published as
//! CloudEvents-style JSON documents:
//!
//! ```text
//! { "id": "...", "type": "badge.assigned", "source": "catalog-sync",
//!   "time": "...", "correlationId": "...",
//!   "data": { "productId": "...", "badgeType": "...", "criteriaSnapshot": {...} } }
//! ```

use crate::badge::{BadgeSource, BadgeTransition, CriteriaSnapshot, RemovalReason};
use crate::event::Event;
use crate::product::ProductId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Type names of derived events.
pub mod event_types {
    /// Product became purchasable again.
    pub const BACK_IN_STOCK: &str = "product.back.in.stock";
    /// A badge was attached.
    pub const BADGE_ASSIGNED: &str = "badge.assigned";
    /// A badge was detached.
    pub const BADGE_REMOVED: &str = "badge.removed";
}

/// Payload of a derived event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged, rename_all_fields = "camelCase")]
pub enum DerivedEvent {
    /// `product.back.in.stock`
    BackInStock {
        /// Product that was restocked.
        product_id: ProductId,
        /// New available quantity.
        available_quantity: u64,
    },
    /// `badge.assigned`
    BadgeAssigned {
        /// Product that gained the badge.
        product_id: ProductId,
        /// Badge type.
        badge_type: String,
        /// Manual or automatic.
        source: BadgeSource,
        /// Metrics that justified the assignment.
        criteria_snapshot: CriteriaSnapshot,
    },
    /// `badge.removed`
    BadgeRemoved {
        /// Product that lost the badge.
        product_id: ProductId,
        /// Badge type.
        badge_type: String,
        /// Why it was removed.
        reason: RemovalReason,
        /// Metrics observed at removal.
        criteria_snapshot: CriteriaSnapshot,
    },
}

impl DerivedEvent {
    /// Build the event for a badge transition.
    #[must_use]
    pub fn from_transition(product_id: &ProductId, transition: BadgeTransition) -> Self {
        match transition {
            BadgeTransition::Assigned {
                badge_type,
                source,
                criteria_snapshot,
            } => Self::BadgeAssigned {
                product_id: product_id.clone(),
                badge_type,
                source,
                criteria_snapshot,
            },
            BadgeTransition::Removed {
                badge_type,
                reason,
                criteria_snapshot,
            } => Self::BadgeRemoved {
                product_id: product_id.clone(),
                badge_type,
                reason,
                criteria_snapshot,
            },
        }
    }

    /// Dotted type name.
    #[must_use]
    pub const fn event_type(&self) -> &'static str {
        match self {
            Self::BackInStock { .. } => event_types::BACK_IN_STOCK,
            Self::BadgeAssigned { .. } => event_types::BADGE_ASSIGNED,
            Self::BadgeRemoved { .. } => event_types::BADGE_REMOVED,
        }
    }

    /// Product the event concerns.
    #[must_use]
    pub const fn product_id(&self) -> &ProductId {
        match self {
            Self::BackInStock { product_id, .. }
            | Self::BadgeAssigned { product_id, .. }
            | Self::BadgeRemoved { product_id, .. } => product_id,
        }
    }
}

/// CloudEvents-style wrapper published on the bus.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DerivedEnvelope {
    /// Unique id of this notification.
    pub id: String,
    /// Dotted type name, duplicated from `data` for routing.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Producing service.
    pub source: String,
    /// Publication time.
    pub time: DateTime<Utc>,
    /// Correlation id inherited from the triggering envelope.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Event payload.
    pub data: DerivedEvent,
}

impl DerivedEnvelope {
    /// Wrap a derived event.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        source: impl Into<String>,
        time: DateTime<Utc>,
        correlation_id: Option<String>,
        data: DerivedEvent,
    ) -> Self {
        Self {
            id: id.into(),
            event_type: data.event_type().to_string(),
            source: source.into(),
            time,
            correlation_id,
            data,
        }
    }
}

impl Event for DerivedEnvelope {
    fn event_type(&self) -> &'static str {
        self.data.event_type()
    }

    fn partition_key(&self) -> Option<&str> {
        Some(self.data.product_id().as_str())
    }
}
