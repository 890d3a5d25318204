//! Product identity and the denormalized aggregate document.
//!
//! [`ProductAggregateState`] is the read-optimized view that catalog readers
//! consume. Every field in it is derived from upstream events: the review
//! summary from review events, availability from inventory events, Q&A
//! counters from question/answer events, and sales metrics from analytics
//! snapshots. Badges are derived from all of the above by the
//! [`crate::badge::BadgeEngine`].
//!
//! Besides the public summary fields, each sub-aggregate keeps a small map of
//! per-item marks (`reviews`, `questions`). The marks record the last
//! sequence seen for an item and whether it is still live, which is what lets
//! the recalculators tell a duplicate or reordered event from a real change.
//! Live marks stay as long as the item does; tombstones are dropped once they
//! are older than the tombstone retention (see
//! [`crate::recalc::RecalcSettings::tombstone_retention`]).

use crate::badge::{Badge, BadgeSource};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error type for `ProductId` parsing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid product ID: {0}")]
pub struct ParseProductIdError(String);

/// Identifier of a catalog product.
///
/// All state in this system is partitioned by product: the router serializes
/// work per `ProductId`, the store keys documents by it and derived events are
/// published with it as the partition key.
///
/// # Validation
///
/// - `FromStr::from_str()`: rejects empty strings (external input)
/// - `From::from()` and `new()`: no validation (trusted input)
///
/// # Examples
///
/// ```
/// use catalog_sync_core::product::ProductId;
///
/// let id = ProductId::new("prod-42");
/// assert_eq!(id.as_str(), "prod-42");
///
/// assert!("".parse::<ProductId>().is_err());
/// ```
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProductId(String);

impl ProductId {
    /// Create a new `ProductId` from a string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the product ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProductId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ProductId {
    type Err = ParseProductIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            return Err(ParseProductIdError(
                "Product ID cannot be empty".to_string(),
            ));
        }
        Ok(Self(s.to_string()))
    }
}

impl From<String> for ProductId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ProductId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for ProductId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A star rating between 1 and 5 inclusive.
///
/// # Examples
///
/// ```
/// use catalog_sync_core::product::Rating;
///
/// assert!(Rating::new(5).is_some());
/// assert!(Rating::new(0).is_none());
/// assert!(Rating::new(6).is_none());
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Rating(u8);

impl Rating {
    /// Lowest valid rating.
    pub const MIN: u8 = 1;
    /// Highest valid rating.
    pub const MAX: u8 = 5;

    /// Create a rating, returning `None` outside `1..=5`.
    #[must_use]
    pub const fn new(stars: u8) -> Option<Self> {
        if stars >= Self::MIN && stars <= Self::MAX {
            Some(Self(stars))
        } else {
            None
        }
    }

    /// Number of stars.
    #[must_use]
    pub const fn stars(self) -> u8 {
        self.0
    }

    const fn index(self) -> usize {
        (self.0 - Self::MIN) as usize
    }
}

impl TryFrom<u8> for Rating {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value).ok_or_else(|| format!("rating {value} is outside 1..=5"))
    }
}

impl From<Rating> for u8 {
    fn from(rating: Rating) -> Self {
        rating.0
    }
}

impl fmt::Display for Rating {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Count of live reviews per star value.
///
/// Serialized as a `{"1": n, ..., "5": n}` mapping so readers see every star
/// value even when its count is zero.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "BTreeMap<String, u64>", try_from = "BTreeMap<String, u64>")]
pub struct RatingHistogram {
    counts: [u64; 5],
}

impl RatingHistogram {
    /// Count for a given star value.
    #[must_use]
    pub const fn count(&self, rating: Rating) -> u64 {
        self.counts[rating.index()]
    }

    /// Sum of all counts.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }

    /// Weighted mean of the histogram, `0.0` when empty.
    #[must_use]
    #[allow(clippy::cast_precision_loss)] // review counts stay far below 2^52
    pub fn mean(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        let weighted: u64 = self
            .counts
            .iter()
            .zip(1u64..)
            .map(|(count, stars)| count * stars)
            .sum();
        weighted as f64 / total as f64
    }

    /// Add one review at `rating`.
    pub const fn increment(&mut self, rating: Rating) {
        self.counts[rating.index()] += 1;
    }

    /// Remove one review at `rating`.
    ///
    /// Returns `false` (and leaves the histogram untouched) when the bucket is
    /// already empty.
    #[must_use]
    pub const fn decrement(&mut self, rating: Rating) -> bool {
        let idx = rating.index();
        if self.counts[idx] == 0 {
            return false;
        }
        self.counts[idx] -= 1;
        true
    }
}

impl From<RatingHistogram> for BTreeMap<String, u64> {
    fn from(histogram: RatingHistogram) -> Self {
        histogram
            .counts
            .iter()
            .zip(Rating::MIN..=Rating::MAX)
            .map(|(count, stars)| (stars.to_string(), *count))
            .collect()
    }
}

impl TryFrom<BTreeMap<String, u64>> for RatingHistogram {
    type Error = String;

    fn try_from(map: BTreeMap<String, u64>) -> Result<Self, Self::Error> {
        let mut histogram = Self::default();
        for (key, count) in map {
            let rating = key
                .parse::<u8>()
                .ok()
                .and_then(Rating::new)
                .ok_or_else(|| format!("invalid histogram bucket: {key}"))?;
            histogram.counts[rating.index()] = count;
        }
        Ok(histogram)
    }
}

/// Last known state of one review.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewMark {
    /// Rating currently counted for this review.
    pub rating: Rating,
    /// Whether the review came from a verified purchase.
    pub verified: bool,
    /// Sequence of the last event applied to this review.
    pub sequence: u64,
    /// Tombstone flag: the review was deleted.
    pub removed: bool,
    /// When the tombstone was first written; drives compaction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub removed_at: Option<DateTime<Utc>>,
}

/// Denormalized review summary.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewAggregate {
    /// Mean of the live ratings, `0.0` with no reviews.
    pub average_rating: f64,
    /// Number of live reviews.
    pub total_count: u64,
    /// Number of live reviews from verified purchases.
    pub verified_count: u64,
    /// Live reviews per star value.
    pub rating_histogram: RatingHistogram,
    /// Up to five most recently created live review ids, newest first.
    pub recent_reviews: Vec<String>,
    /// Occurrence time of the newest review seen.
    pub last_review_at: Option<DateTime<Utc>>,
    /// Highest sequence applied to this sub-aggregate.
    pub last_applied_event_seq: Option<u64>,
    /// Per-review marks used for ordering and deduplication.
    #[serde(default)]
    pub reviews: BTreeMap<String, ReviewMark>,
}

impl ReviewAggregate {
    /// Maximum number of ids kept in [`Self::recent_reviews`].
    pub const RECENT_LIMIT: usize = 5;

    /// Recompute the summary fields from the histogram.
    pub fn refresh_summary(&mut self) {
        self.total_count = self.rating_histogram.total();
        self.average_rating = self.rating_histogram.mean();
    }
}

/// Stock status derived from the available quantity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AvailabilityStatus {
    /// No inventory event has been seen yet.
    #[default]
    Unknown,
    /// At or above the low-stock threshold.
    InStock,
    /// Below the threshold but above zero.
    LowStock,
    /// Nothing available.
    OutOfStock,
}

impl AvailabilityStatus {
    /// Derive the status for an available quantity and a low-stock threshold.
    ///
    /// # Examples
    ///
    /// ```
    /// use catalog_sync_core::product::AvailabilityStatus;
    ///
    /// assert_eq!(AvailabilityStatus::derive(0, 10), AvailabilityStatus::OutOfStock);
    /// assert_eq!(AvailabilityStatus::derive(9, 10), AvailabilityStatus::LowStock);
    /// assert_eq!(AvailabilityStatus::derive(10, 10), AvailabilityStatus::InStock);
    /// ```
    #[must_use]
    pub const fn derive(available_quantity: u64, low_stock_threshold: u64) -> Self {
        if available_quantity == 0 {
            Self::OutOfStock
        } else if available_quantity < low_stock_threshold {
            Self::LowStock
        } else {
            Self::InStock
        }
    }

    /// Whether units can currently be purchased.
    #[must_use]
    pub const fn is_purchasable(self) -> bool {
        matches!(self, Self::InStock | Self::LowStock)
    }

    /// Wire name of the status.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::InStock => "in_stock",
            Self::LowStock => "low_stock",
            Self::OutOfStock => "out_of_stock",
        }
    }
}

impl fmt::Display for AvailabilityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Denormalized stock view.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Availability {
    /// Status derived from `available_quantity`.
    pub status: AvailabilityStatus,
    /// Units available for sale.
    pub available_quantity: u64,
    /// Units held by open reservations.
    pub reserved_quantity: u64,
    /// Highest sequence applied to this sub-aggregate.
    pub last_applied_event_seq: Option<u64>,
}

/// Last known state of one question.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionMark {
    /// Whether at least one answer has been counted.
    pub answered: bool,
    /// Sequence of the last event applied to this question.
    pub sequence: u64,
    /// Tombstone flag: the question was deleted.
    pub removed: bool,
    /// When the tombstone was first written; drives compaction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub removed_at: Option<DateTime<Utc>>,
}

/// Denormalized Q&A counters.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QaCounters {
    /// Number of live questions.
    pub total_questions: u64,
    /// Number of live questions with at least one answer.
    pub answered_questions: u64,
    /// Highest sequence applied to this sub-aggregate.
    pub last_applied_event_seq: Option<u64>,
    /// Per-question marks used for ordering and deduplication.
    #[serde(default)]
    pub questions: BTreeMap<String, QuestionMark>,
}

/// Latest analytics snapshot for the product.
///
/// Sales and view figures arrive on separate event types and are replaced
/// wholesale by the newest snapshot of each kind.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SalesMetrics {
    /// Units sold over the trailing 30 days.
    pub units_last_30_days: u64,
    /// Rank within the product's category, 1 being the best seller.
    pub category_rank: Option<u32>,
    /// Growth of product page views in percent.
    pub view_growth_percent: f64,
    /// Sequence of the last applied sales snapshot.
    pub last_sales_seq: Option<u64>,
    /// Sequence of the last applied views snapshot.
    pub last_views_seq: Option<u64>,
}

/// The denormalized read model of a single product.
///
/// `version` increases by exactly one on every applied mutation and is used
/// by [`crate::store::AggregateStore::save`] for optimistic concurrency.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductAggregateState {
    /// Product this document describes.
    pub product_id: ProductId,
    /// Review summary.
    pub review_aggregate: ReviewAggregate,
    /// Stock view.
    pub availability: Availability,
    /// Q&A counters.
    pub qa_counters: QaCounters,
    /// Latest analytics snapshot.
    #[serde(default)]
    pub sales_metrics: SalesMetrics,
    /// Active badges, ordered by descending priority.
    pub badges: Vec<Badge>,
    /// Optimistic concurrency version.
    pub version: u64,
    /// Logical deletion flag.
    #[serde(default)]
    pub removed: bool,
    /// When the product was created.
    pub created_at: DateTime<Utc>,
    /// When the document last changed.
    pub updated_at: DateTime<Utc>,
}

impl ProductAggregateState {
    /// Fresh aggregate for a newly created product, at version 1.
    #[must_use]
    pub fn new(product_id: ProductId, now: DateTime<Utc>) -> Self {
        Self {
            product_id,
            review_aggregate: ReviewAggregate::default(),
            availability: Availability::default(),
            qa_counters: QaCounters::default(),
            sales_metrics: SalesMetrics::default(),
            badges: Vec::new(),
            version: 1,
            removed: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Find an active badge by type, manual first when both sources hold it.
    #[must_use]
    pub fn badge(&self, badge_type: &str) -> Option<&Badge> {
        self.badges.iter().find(|b| b.badge_type == badge_type)
    }

    /// Find the badge of `badge_type` owned by `source`.
    #[must_use]
    pub fn badge_from(&self, badge_type: &str, source: BadgeSource) -> Option<&Badge> {
        self.badges
            .iter()
            .find(|b| b.badge_type == badge_type && b.source == source)
    }

    /// Earliest expiry among the automatic badges; the sweeper's index key.
    #[must_use]
    pub fn next_badge_expiry(&self) -> Option<DateTime<Utc>> {
        self.badges
            .iter()
            .filter(|b| b.is_auto())
            .filter_map(|b| b.expires_at)
            .min()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    fn rating(stars: u8) -> Rating {
        Rating::new(stars).unwrap()
    }

    #[test]
    fn histogram_mean_is_weighted() {
        let mut h = RatingHistogram::default();
        h.increment(rating(5));
        h.increment(rating(1));
        assert_eq!(h.total(), 2);
        assert!((h.mean() - 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn histogram_decrement_refuses_empty_bucket() {
        let mut h = RatingHistogram::default();
        assert!(!h.decrement(rating(3)));
        h.increment(rating(3));
        assert!(h.decrement(rating(3)));
        assert_eq!(h.total(), 0);
        assert!(h.mean().abs() < f64::EPSILON);
    }

    #[test]
    fn histogram_serializes_every_bucket() {
        let mut h = RatingHistogram::default();
        h.increment(rating(4));
        let json = serde_json::to_value(h).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"1": 0, "2": 0, "3": 0, "4": 1, "5": 0})
        );

        let back: RatingHistogram = serde_json::from_value(json).unwrap();
        assert_eq!(back, h);
    }

    #[test]
    fn histogram_rejects_unknown_bucket() {
        let result: Result<RatingHistogram, _> =
            serde_json::from_value(serde_json::json!({"6": 1}));
        assert!(result.is_err());
    }

    #[test]
    fn rating_rejects_out_of_range_on_deserialize() {
        assert!(serde_json::from_str::<Rating>("0").is_err());
        assert!(serde_json::from_str::<Rating>("6").is_err());
        assert_eq!(serde_json::from_str::<Rating>("3").unwrap(), rating(3));
    }

    #[test]
    fn status_wire_names() {
        let json = serde_json::to_string(&AvailabilityStatus::OutOfStock).unwrap();
        assert_eq!(json, "\"out_of_stock\"");
        assert_eq!(AvailabilityStatus::LowStock.to_string(), "low_stock");
        assert!(!AvailabilityStatus::Unknown.is_purchasable());
    }

    #[test]
    fn new_state_starts_at_version_one() {
        let state = ProductAggregateState::new(ProductId::new("p"), Utc::now());
        assert_eq!(state.version, 1);
        assert_eq!(state.availability.status, AvailabilityStatus::Unknown);
        assert!(state.badges.is_empty());
        assert!(!state.removed);
    }

    #[test]
    fn product_id_parse_rejects_blank() {
        assert!("   ".parse::<ProductId>().is_err());
        assert_eq!("p-1".parse::<ProductId>().unwrap(), ProductId::new("p-1"));
    }
}
