//! Product badges and the rule engine that assigns them.
//!
//! A badge is a merchandising label ("Best Seller", "Low Stock", ...) attached
//! to a product. Badges come from two places:
//!
//! - **Manual** badges are assigned by an administrator. The engine never
//!   touches them, and they may sit beside an auto badge of the same type;
//!   the two are tracked independently.
//! - **Auto** badges are owned by the [`BadgeEngine`]. After every change to a
//!   product's aggregate the engine re-evaluates each [`BadgeRule`] against the
//!   new state, assigning badges whose criterion now holds and removing those
//!   whose criterion no longer holds.
//!
//! ```text
//!                    criterion holds
//!   ┌─────────┐   ─────────────────────►   ┌──────────┐
//!   │ absent  │                            │ assigned │
//!   └─────────┘   ◄─────────────────────   └──────────┘
//!                 criterion fails / expired
//! ```
//!
//! Every transition is reported as a [`BadgeTransition`] carrying the metric
//! snapshot that justified it.

use crate::product::{AvailabilityStatus, ProductAggregateState};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Badge type for the best-seller rule.
pub const BEST_SELLER: &str = "best-seller";
/// Badge type for the trending rule.
pub const TRENDING: &str = "trending";
/// Badge type for the low-stock rule.
pub const LOW_STOCK: &str = "low-stock";
/// Badge type for the top-rated rule.
pub const TOP_RATED: &str = "top-rated";

/// Metric values observed when a badge decision was made.
pub type CriteriaSnapshot = BTreeMap<String, f64>;

/// Who owns a badge.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BadgeSource {
    /// Assigned by an administrator; only an administrator removes it.
    Manual,
    /// Assigned and removed by the [`BadgeEngine`].
    Auto,
}

/// A badge attached to a product.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Badge {
    /// Badge type, e.g. `best-seller`.
    pub badge_type: String,
    /// Display label.
    pub label: String,
    /// Ownership.
    pub source: BadgeSource,
    /// Display priority, higher first.
    pub priority: i32,
    /// When the badge was assigned.
    pub assigned_at: DateTime<Utc>,
    /// Optional expiry.
    pub expires_at: Option<DateTime<Utc>>,
    /// Metrics observed at assignment time.
    #[serde(default)]
    pub criteria_snapshot: CriteriaSnapshot,
}

impl Badge {
    /// Whether the badge has expired at `now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Whether the badge is owned by the engine.
    #[must_use]
    pub fn is_auto(&self) -> bool {
        self.source == BadgeSource::Auto
    }
}

/// The predicate a rule checks.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Criterion {
    /// Enough units sold and a good enough category rank.
    BestSeller {
        /// Minimum units sold over the trailing 30 days.
        min_units: u64,
        /// Worst category rank that still qualifies.
        max_rank: u32,
    },
    /// View growth above a cutoff.
    Trending {
        /// Minimum growth in percent.
        min_growth_percent: f64,
    },
    /// Availability status is `low_stock`.
    LowStock,
    /// High average rating over enough reviews.
    TopRated {
        /// Minimum average rating.
        min_average: f64,
        /// Minimum number of live reviews.
        min_reviews: u64,
    },
}

impl Criterion {
    /// Check the criterion against a state.
    ///
    /// Returns whether it holds together with the metric values consulted.
    #[must_use]
    #[allow(clippy::cast_precision_loss)] // counters are reported as f64 for readability
    pub fn check(&self, state: &ProductAggregateState) -> (bool, CriteriaSnapshot) {
        let mut snapshot = CriteriaSnapshot::new();
        let holds = match self {
            Self::BestSeller {
                min_units,
                max_rank,
            } => {
                let metrics = &state.sales_metrics;
                snapshot.insert(
                    "unitsLast30Days".to_string(),
                    metrics.units_last_30_days as f64,
                );
                if let Some(rank) = metrics.category_rank {
                    snapshot.insert("categoryRank".to_string(), f64::from(rank));
                }
                metrics.units_last_30_days >= *min_units
                    && metrics.category_rank.is_some_and(|rank| rank <= *max_rank)
            }
            Self::Trending { min_growth_percent } => {
                let growth = state.sales_metrics.view_growth_percent;
                snapshot.insert("viewGrowthPercent".to_string(), growth);
                growth >= *min_growth_percent
            }
            Self::LowStock => {
                let availability = &state.availability;
                snapshot.insert(
                    "availableQuantity".to_string(),
                    availability.available_quantity as f64,
                );
                availability.status == AvailabilityStatus::LowStock
            }
            Self::TopRated {
                min_average,
                min_reviews,
            } => {
                let reviews = &state.review_aggregate;
                snapshot.insert("averageRating".to_string(), reviews.average_rating);
                snapshot.insert("totalCount".to_string(), reviews.total_count as f64);
                reviews.total_count >= *min_reviews && reviews.average_rating >= *min_average
            }
        };
        (holds, snapshot)
    }
}

/// A rule the engine evaluates for one badge type.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BadgeRule {
    /// Badge type the rule controls.
    pub badge_type: String,
    /// Display label for assigned badges.
    pub label: String,
    /// Display priority for assigned badges.
    pub priority: i32,
    /// Lifetime of an assigned badge; `None` never expires.
    #[serde(default, with = "optional_hours")]
    pub ttl: Option<Duration>,
    /// Predicate that decides assignment.
    pub criterion: Criterion,
}

impl BadgeRule {
    /// Create a rule without a TTL.
    #[must_use]
    pub fn new(
        badge_type: impl Into<String>,
        label: impl Into<String>,
        priority: i32,
        criterion: Criterion,
    ) -> Self {
        Self {
            badge_type: badge_type.into(),
            label: label.into(),
            priority,
            ttl: None,
            criterion,
        }
    }

    /// Set the lifetime of badges assigned by this rule.
    #[must_use]
    pub const fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

mod optional_hours {
    use chrono::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(clippy::ref_option)] // serde `with` signature
    pub fn serialize<S: Serializer>(ttl: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match ttl {
            Some(d) => s.serialize_some(&d.num_hours()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<i64>::deserialize(d)?.map(Duration::hours))
    }
}

/// Why a badge was removed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalReason {
    /// The rule's criterion stopped holding.
    CriteriaNotMet,
    /// The badge's TTL elapsed.
    Expired,
    /// An administrator removed a manual badge.
    Manual,
}

impl RemovalReason {
    /// Wire name of the reason.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CriteriaNotMet => "criteria_not_met",
            Self::Expired => "expired",
            Self::Manual => "manual",
        }
    }
}

impl fmt::Display for RemovalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A change to a product's badge set.
#[derive(Clone, Debug, PartialEq)]
pub enum BadgeTransition {
    /// A badge was attached.
    Assigned {
        /// Badge type.
        badge_type: String,
        /// Who owns the new badge.
        source: BadgeSource,
        /// Metrics that justified the assignment.
        criteria_snapshot: CriteriaSnapshot,
    },
    /// A badge was detached.
    Removed {
        /// Badge type.
        badge_type: String,
        /// Why it was removed.
        reason: RemovalReason,
        /// Metrics observed at removal.
        criteria_snapshot: CriteriaSnapshot,
    },
}

impl BadgeTransition {
    /// Badge type affected by the transition.
    #[must_use]
    pub fn badge_type(&self) -> &str {
        match self {
            Self::Assigned { badge_type, .. } | Self::Removed { badge_type, .. } => badge_type,
        }
    }

    /// Metric label for the transition kind.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Assigned { .. } => "assigned",
            Self::Removed { .. } => "removed",
        }
    }
}

/// Evaluates badge rules against aggregate states.
///
/// The engine is deterministic: for a given state, rule set and `now`, it
/// always produces the same badge set and transitions.
///
/// # Examples
///
/// ```
/// use catalog_sync_core::badge::{BadgeEngine, BadgeRule, Criterion, LOW_STOCK};
/// use catalog_sync_core::product::{AvailabilityStatus, ProductAggregateState, ProductId};
/// use chrono::Utc;
///
/// let engine = BadgeEngine::new(vec![BadgeRule::new(
///     LOW_STOCK,
///     "Low Stock",
///     10,
///     Criterion::LowStock,
/// )]);
///
/// let now = Utc::now();
/// let mut state = ProductAggregateState::new(ProductId::new("p"), now);
/// state.availability.status = AvailabilityStatus::LowStock;
///
/// let transitions = engine.evaluate(&mut state, now);
/// assert_eq!(transitions.len(), 1);
/// assert!(state.badge(LOW_STOCK).is_some());
///
/// // Re-evaluating an unchanged state is a no-op.
/// assert!(engine.evaluate(&mut state, now).is_empty());
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct BadgeEngine {
    rules: Vec<BadgeRule>,
}

impl BadgeEngine {
    /// Create an engine over a rule set.
    #[must_use]
    pub const fn new(rules: Vec<BadgeRule>) -> Self {
        Self { rules }
    }

    /// Rules evaluated by this engine.
    #[must_use]
    pub fn rules(&self) -> &[BadgeRule] {
        &self.rules
    }

    /// Re-evaluate every rule against `state`, updating its badge set.
    ///
    /// Expired auto badges are removed first and are not re-assigned in the
    /// same pass. Only the auto badge of each rule's type is considered; a
    /// manual badge of the same type neither blocks nor replaces it.
    pub fn evaluate(
        &self,
        state: &mut ProductAggregateState,
        now: DateTime<Utc>,
    ) -> Vec<BadgeTransition> {
        let mut transitions = Self::remove_expired(state, now);
        let expired: Vec<String> = transitions
            .iter()
            .map(|t| t.badge_type().to_string())
            .collect();

        for rule in &self.rules {
            if expired.contains(&rule.badge_type) {
                continue;
            }
            let existing = state
                .badges
                .iter()
                .position(|b| b.badge_type == rule.badge_type && b.is_auto());

            let (holds, snapshot) = rule.criterion.check(state);
            match (holds, existing) {
                (true, None) => {
                    state.badges.push(Badge {
                        badge_type: rule.badge_type.clone(),
                        label: rule.label.clone(),
                        source: BadgeSource::Auto,
                        priority: rule.priority,
                        assigned_at: now,
                        expires_at: rule.ttl.map(|ttl| now + ttl),
                        criteria_snapshot: snapshot.clone(),
                    });
                    transitions.push(BadgeTransition::Assigned {
                        badge_type: rule.badge_type.clone(),
                        source: BadgeSource::Auto,
                        criteria_snapshot: snapshot,
                    });
                }
                (false, Some(idx)) => {
                    state.badges.remove(idx);
                    transitions.push(BadgeTransition::Removed {
                        badge_type: rule.badge_type.clone(),
                        reason: RemovalReason::CriteriaNotMet,
                        criteria_snapshot: snapshot,
                    });
                }
                _ => {}
            }
        }

        sort_badges(&mut state.badges);
        transitions
    }

    /// Remove auto badges whose expiry has passed.
    ///
    /// Used both at the start of [`Self::evaluate`] and by the periodic sweep,
    /// which must not re-assign anything.
    pub fn remove_expired(
        state: &mut ProductAggregateState,
        now: DateTime<Utc>,
    ) -> Vec<BadgeTransition> {
        let mut transitions = Vec::new();
        state.badges.retain(|badge| {
            if badge.is_auto() && badge.is_expired(now) {
                transitions.push(BadgeTransition::Removed {
                    badge_type: badge.badge_type.clone(),
                    reason: RemovalReason::Expired,
                    criteria_snapshot: badge.criteria_snapshot.clone(),
                });
                false
            } else {
                true
            }
        });
        transitions
    }
}

impl Default for BadgeEngine {
    /// Stock rule set: best-seller, trending, low-stock and top-rated.
    fn default() -> Self {
        Self::new(vec![
            BadgeRule::new(
                BEST_SELLER,
                "Best Seller",
                40,
                Criterion::BestSeller {
                    min_units: 100,
                    max_rank: 10,
                },
            )
            .with_ttl(Duration::hours(168)),
            BadgeRule::new(
                TOP_RATED,
                "Top Rated",
                30,
                Criterion::TopRated {
                    min_average: 4.5,
                    min_reviews: 10,
                },
            ),
            BadgeRule::new(
                TRENDING,
                "Trending",
                20,
                Criterion::Trending {
                    min_growth_percent: 50.0,
                },
            )
            .with_ttl(Duration::hours(168)),
            BadgeRule::new(LOW_STOCK, "Low Stock", 10, Criterion::LowStock),
        ])
    }
}

/// Order badges by descending priority, then by type, manual before auto.
pub fn sort_badges(badges: &mut [Badge]) {
    badges.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| a.badge_type.cmp(&b.badge_type))
            .then_with(|| a.is_auto().cmp(&b.is_auto()))
    });
}
