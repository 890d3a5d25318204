//! Aggregate recalculation: fold one mutation into a product's state.
//!
//! [`apply`] is a pure function. It never touches storage; the router loads
//! the current document, calls [`apply`] while holding the product's lane and
//! persists the result. A mutation either produces a complete new state or
//! leaves the old one untouched:
//!
//! ```text
//!            ┌──────────────┐   Applied { state', derived }
//! state ───► │ recalc::apply│ ─────────────────────────────►  persist + emit
//! mutation ─►│              │   Stale(reason)
//!            └──────────────┘ ─────────────────────────────►  no-op
//!                    │            Err(RecalcError)
//!                    └────────────────────────────────────►  prior state kept
//! ```
//!
//! Each sub-aggregate has its own fold module. They share the [`Step`]
//! vocabulary and are guarded differently:
//!
//! - [`review`] and [`qa`] apply count deltas, guarded by per-item marks
//! - [`availability`] and [`analytics`] replace absolute values, guarded by a
//!   last-write-wins sequence marker
//!
//! After any change the [`crate::badge::BadgeEngine`] re-evaluates the badge
//! set, and a transition out of `out_of_stock` produces a restock event.

pub mod analytics;
pub mod availability;
pub mod qa;
pub mod review;

use crate::badge::{Badge, BadgeEngine, BadgeSource, BadgeTransition, RemovalReason, sort_badges};
use crate::derived::DerivedEvent;
use crate::envelope::ProductEvent;
use crate::product::{AvailabilityStatus, ProductAggregateState, ProductId};
use chrono::{DateTime, Duration, Utc};
use std::fmt;
use thiserror::Error;

/// Default low-stock threshold.
pub const DEFAULT_LOW_STOCK_THRESHOLD: u64 = 10;

/// Errors that abort a mutation and keep the prior state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecalcError {
    /// Applying the event would break an aggregate invariant.
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// The product has no aggregate yet.
    #[error("Product not found: {0}")]
    UnknownProduct(ProductId),
}

/// Why a mutation was a no-op.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StaleReason {
    /// An event with an equal or newer sequence was already applied.
    OlderSequence {
        /// Sequence already applied.
        applied: u64,
        /// Sequence of the rejected event.
        received: u64,
    },
    /// The event's effect is already in the state.
    AlreadyReflected,
    /// The item the event targets was deleted by a newer event.
    Superseded,
    /// The product was logically deleted.
    ProductRemoved,
    /// Nothing needed doing.
    NothingToDo,
}

impl fmt::Display for StaleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OlderSequence { applied, received } => {
                write!(f, "sequence {received} not newer than applied {applied}")
            }
            Self::AlreadyReflected => f.write_str("already reflected"),
            Self::Superseded => f.write_str("superseded by a later deletion"),
            Self::ProductRemoved => f.write_str("product removed"),
            Self::NothingToDo => f.write_str("nothing to do"),
        }
    }
}

/// Result of a sub-aggregate fold.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Step {
    /// The sub-aggregate changed.
    Changed,
    /// The sub-aggregate is untouched.
    Stale(StaleReason),
}

/// Sequence guard shared by every fold: `Some(stale)` if `received` is not
/// newer than `applied`.
pub(crate) fn older_than(applied: Option<u64>, received: u64) -> Option<Step> {
    match applied {
        Some(applied) if received <= applied => {
            Some(Step::Stale(StaleReason::OlderSequence { applied, received }))
        }
        _ => None,
    }
}

/// Default age after which review and question tombstones are dropped.
pub const DEFAULT_TOMBSTONE_RETENTION_HOURS: i64 = 168;

/// Tunables consulted by the folds.
#[derive(Clone, Debug, PartialEq)]
pub struct RecalcSettings {
    /// Quantities below this (and above zero) are `low_stock`.
    pub low_stock_threshold: u64,
    /// Badge rules.
    pub badge_engine: BadgeEngine,
    /// How long a deleted review or question keeps its tombstone. `None`
    /// keeps tombstones forever.
    ///
    /// A tombstone only matters while a late `created` for the same item can
    /// still arrive, so this should not be shorter than the processed-event
    /// ledger's retention.
    pub tombstone_retention: Option<Duration>,
}

impl Default for RecalcSettings {
    fn default() -> Self {
        Self {
            low_stock_threshold: DEFAULT_LOW_STOCK_THRESHOLD,
            badge_engine: BadgeEngine::default(),
            tombstone_retention: Some(Duration::hours(DEFAULT_TOMBSTONE_RETENTION_HOURS)),
        }
    }
}

/// Per-call inputs besides the state and the mutation.
#[derive(Clone, Copy, Debug)]
pub struct RecalcContext<'a> {
    /// Tunables.
    pub settings: &'a RecalcSettings,
    /// Current time, for badge timestamps and expiry.
    pub now: DateTime<Utc>,
}

impl<'a> RecalcContext<'a> {
    /// Create a context.
    #[must_use]
    pub const fn new(settings: &'a RecalcSettings, now: DateTime<Utc>) -> Self {
        Self { settings, now }
    }
}

/// A badge an administrator wants to attach.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManualBadge {
    /// Badge type.
    pub badge_type: String,
    /// Display label.
    pub label: String,
    /// Display priority.
    pub priority: i32,
    /// Optional expiry.
    pub expires_at: Option<DateTime<Utc>>,
}

/// Everything that can change a product's aggregate.
#[derive(Clone, Debug, PartialEq)]
pub enum Mutation {
    /// An inbound domain event.
    Event {
        /// Decoded event.
        event: ProductEvent,
        /// Producer sequence.
        sequence: u64,
        /// Upstream occurrence time.
        occurred_at: Option<DateTime<Utc>>,
    },
    /// Admin: attach a manual badge.
    AssignManualBadge(ManualBadge),
    /// Admin: detach a manual badge.
    RemoveManualBadge {
        /// Badge type.
        badge_type: String,
    },
    /// Periodic removal of expired automatic badges.
    SweepExpiredBadges,
}

impl Mutation {
    /// Wrap an inbound event.
    #[must_use]
    pub const fn event(
        event: ProductEvent,
        sequence: u64,
        occurred_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self::Event {
            event,
            sequence,
            occurred_at,
        }
    }

    /// Short name for logs.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Event { event, .. } => event.event_type(),
            Self::AssignManualBadge(_) => "admin.badge.assign",
            Self::RemoveManualBadge { .. } => "admin.badge.remove",
            Self::SweepExpiredBadges => "badge.sweep",
        }
    }
}

/// Outcome of a successful fold.
#[derive(Clone, Debug, PartialEq)]
pub enum FoldOutcome {
    /// The state changed; persist it, then publish `derived`.
    Applied {
        /// New state, version already bumped.
        state: ProductAggregateState,
        /// Follow-on events.
        derived: Vec<DerivedEvent>,
    },
    /// Nothing changed.
    Stale(StaleReason),
}

/// Fold one mutation into a product's state.
///
/// `current` is `None` when the product has no aggregate yet; only
/// `product.created` is accepted then.
///
/// # Errors
///
/// - [`RecalcError::UnknownProduct`] for anything but `product.created` on a
///   product without an aggregate
/// - [`RecalcError::InvariantViolation`] if the mutation would break an
///   aggregate invariant; the caller keeps `current` unchanged
pub fn apply(
    current: Option<&ProductAggregateState>,
    product_id: &ProductId,
    mutation: &Mutation,
    ctx: &RecalcContext<'_>,
) -> Result<FoldOutcome, RecalcError> {
    let Some(current) = current else {
        return match mutation {
            Mutation::Event {
                event: ProductEvent::ProductCreated,
                ..
            } => Ok(FoldOutcome::Applied {
                state: ProductAggregateState::new(product_id.clone(), ctx.now),
                derived: Vec::new(),
            }),
            Mutation::SweepExpiredBadges => Ok(FoldOutcome::Stale(StaleReason::NothingToDo)),
            _ => Err(RecalcError::UnknownProduct(product_id.clone())),
        };
    };

    if current.removed {
        return Ok(FoldOutcome::Stale(StaleReason::ProductRemoved));
    }

    let mut next = current.clone();
    let mut derived = Vec::new();

    let step = match mutation {
        Mutation::Event {
            event,
            sequence,
            occurred_at,
        } => apply_event(&mut next, event, *sequence, *occurred_at, ctx, &mut derived)?,
        Mutation::AssignManualBadge(badge) => assign_manual(&mut next, badge, ctx.now, &mut derived),
        Mutation::RemoveManualBadge { badge_type } => {
            remove_manual(&mut next, badge_type, &mut derived)
        }
        Mutation::SweepExpiredBadges => {
            let transitions = BadgeEngine::remove_expired(&mut next, ctx.now);
            if transitions.is_empty() {
                Step::Stale(StaleReason::NothingToDo)
            } else {
                push_transitions(product_id, transitions, &mut derived);
                Step::Changed
            }
        }
    };

    match step {
        Step::Stale(reason) => Ok(FoldOutcome::Stale(reason)),
        Step::Changed => {
            check_invariants(&next)?;
            compact_tombstones(&mut next, ctx.now, ctx.settings.tombstone_retention);
            next.version = current.version + 1;
            next.updated_at = ctx.now;
            Ok(FoldOutcome::Applied {
                state: next,
                derived,
            })
        }
    }
}

fn apply_event(
    next: &mut ProductAggregateState,
    event: &ProductEvent,
    sequence: u64,
    occurred_at: Option<DateTime<Utc>>,
    ctx: &RecalcContext<'_>,
    derived: &mut Vec<DerivedEvent>,
) -> Result<Step, RecalcError> {
    let previous_status = next.availability.status;
    let threshold = ctx.settings.low_stock_threshold;

    let step = match event {
        ProductEvent::ProductCreated => Step::Stale(StaleReason::AlreadyReflected),
        ProductEvent::ProductDeleted => {
            next.removed = true;
            return Ok(Step::Changed);
        }
        ProductEvent::ReviewCreated {
            review_id,
            rating,
            verified,
        } => review::apply_created(
            &mut next.review_aggregate,
            review_id,
            *rating,
            *verified,
            sequence,
            occurred_at,
        ),
        ProductEvent::ReviewUpdated {
            review_id,
            old_rating,
            new_rating,
        } => review::apply_updated(
            &mut next.review_aggregate,
            review_id,
            *old_rating,
            *new_rating,
            sequence,
        )?,
        ProductEvent::ReviewDeleted {
            review_id,
            rating,
            verified,
        } => review::apply_deleted(
            &mut next.review_aggregate,
            review_id,
            *rating,
            *verified,
            sequence,
        )?,
        ProductEvent::StockUpdated { available_quantity } => availability::apply_stock_updated(
            &mut next.availability,
            *available_quantity,
            sequence,
            threshold,
        )?,
        ProductEvent::InventoryReserved { reserved_quantity }
        | ProductEvent::InventoryReleased { reserved_quantity } => {
            availability::apply_reservation(&mut next.availability, *reserved_quantity, sequence)?
        }
        ProductEvent::SalesUpdated {
            units_last_30_days,
            category_rank,
        } => analytics::apply_sales(
            &mut next.sales_metrics,
            *units_last_30_days,
            *category_rank,
            sequence,
        ),
        ProductEvent::ViewsUpdated {
            view_growth_percent,
        } => analytics::apply_views(&mut next.sales_metrics, *view_growth_percent, sequence),
        ProductEvent::QuestionCreated { question_id } => {
            qa::apply_question_created(&mut next.qa_counters, question_id, sequence)
        }
        ProductEvent::AnswerCreated { question_id } => {
            qa::apply_answer_created(&mut next.qa_counters, question_id, sequence)
        }
        ProductEvent::QuestionDeleted {
            question_id,
            had_answer,
        } => qa::apply_question_deleted(
            &mut next.qa_counters,
            question_id,
            *had_answer,
            sequence,
        )?,
    };

    if step == Step::Changed {
        let product_id = next.product_id.clone();
        if previous_status == AvailabilityStatus::OutOfStock
            && next.availability.status.is_purchasable()
        {
            derived.push(DerivedEvent::BackInStock {
                product_id: product_id.clone(),
                available_quantity: next.availability.available_quantity,
            });
        }
        let transitions = ctx.settings.badge_engine.evaluate(next, ctx.now);
        push_transitions(&product_id, transitions, derived);
    }

    Ok(step)
}

fn assign_manual(
    next: &mut ProductAggregateState,
    badge: &ManualBadge,
    now: DateTime<Utc>,
    derived: &mut Vec<DerivedEvent>,
) -> Step {
    let held_manually = next
        .badges
        .iter()
        .any(|b| b.badge_type == badge.badge_type && b.source == BadgeSource::Manual);
    if held_manually {
        return Step::Stale(StaleReason::AlreadyReflected);
    }

    // Any auto badge of the same type stays; the engine keeps owning it.
    next.badges.push(Badge {
        badge_type: badge.badge_type.clone(),
        label: badge.label.clone(),
        source: BadgeSource::Manual,
        priority: badge.priority,
        assigned_at: now,
        expires_at: badge.expires_at,
        criteria_snapshot: crate::badge::CriteriaSnapshot::new(),
    });
    sort_badges(&mut next.badges);

    let product_id = next.product_id.clone();
    push_transitions(
        &product_id,
        vec![BadgeTransition::Assigned {
            badge_type: badge.badge_type.clone(),
            source: BadgeSource::Manual,
            criteria_snapshot: crate::badge::CriteriaSnapshot::new(),
        }],
        derived,
    );
    Step::Changed
}

fn remove_manual(
    next: &mut ProductAggregateState,
    badge_type: &str,
    derived: &mut Vec<DerivedEvent>,
) -> Step {
    let Some(idx) = next
        .badges
        .iter()
        .position(|b| b.badge_type == badge_type && b.source == BadgeSource::Manual)
    else {
        return Step::Stale(StaleReason::NothingToDo);
    };

    let removed = next.badges.remove(idx);
    let product_id = next.product_id.clone();
    push_transitions(
        &product_id,
        vec![BadgeTransition::Removed {
            badge_type: removed.badge_type,
            reason: RemovalReason::Manual,
            criteria_snapshot: removed.criteria_snapshot,
        }],
        derived,
    );
    Step::Changed
}

/// Stamp fresh review and question tombstones with `now` and drop those
/// older than `retention`. Live marks are never touched.
fn compact_tombstones(
    state: &mut ProductAggregateState,
    now: DateTime<Utc>,
    retention: Option<Duration>,
) {
    let cutoff = retention.map(|r| now - r);
    let keep = |removed: bool, removed_at: &mut Option<DateTime<Utc>>| {
        if !removed {
            return true;
        }
        let at = *removed_at.get_or_insert(now);
        cutoff.is_none_or(|cutoff| at > cutoff)
    };

    state
        .review_aggregate
        .reviews
        .retain(|_, mark| keep(mark.removed, &mut mark.removed_at));
    state
        .qa_counters
        .questions
        .retain(|_, mark| keep(mark.removed, &mut mark.removed_at));
}

fn push_transitions(
    product_id: &ProductId,
    transitions: Vec<BadgeTransition>,
    derived: &mut Vec<DerivedEvent>,
) {
    derived.extend(
        transitions
            .into_iter()
            .map(|t| DerivedEvent::from_transition(product_id, t)),
    );
}

/// Verify the invariants every persisted state must satisfy.
///
/// # Errors
///
/// Returns [`RecalcError::InvariantViolation`] naming the first broken invariant.
pub fn check_invariants(state: &ProductAggregateState) -> Result<(), RecalcError> {
    let reviews = &state.review_aggregate;
    if reviews.rating_histogram.total() != reviews.total_count {
        return Err(RecalcError::InvariantViolation(format!(
            "histogram sums to {} but totalCount is {}",
            reviews.rating_histogram.total(),
            reviews.total_count
        )));
    }
    if reviews.verified_count > reviews.total_count {
        return Err(RecalcError::InvariantViolation(format!(
            "verifiedCount {} exceeds totalCount {}",
            reviews.verified_count, reviews.total_count
        )));
    }
    if !(0.0..=5.0).contains(&reviews.average_rating) {
        return Err(RecalcError::InvariantViolation(format!(
            "averageRating {} outside [0, 5]",
            reviews.average_rating
        )));
    }
    let qa = &state.qa_counters;
    if qa.answered_questions > qa.total_questions {
        return Err(RecalcError::InvariantViolation(format!(
            "answeredQuestions {} exceeds totalQuestions {}",
            qa.answered_questions, qa.total_questions
        )));
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::badge::{LOW_STOCK, TRENDING};
    use crate::product::Rating;
    use chrono::Duration;

    fn pid() -> ProductId {
        ProductId::new("p-1")
    }

    fn fresh() -> ProductAggregateState {
        ProductAggregateState::new(pid(), Utc::now())
    }

    fn fold(
        state: &ProductAggregateState,
        event: ProductEvent,
        sequence: u64,
        settings: &RecalcSettings,
    ) -> Result<FoldOutcome, RecalcError> {
        let ctx = RecalcContext::new(settings, Utc::now());
        apply(
            Some(state),
            &pid(),
            &Mutation::event(event, sequence, None),
            &ctx,
        )
    }

    fn applied(outcome: FoldOutcome) -> (ProductAggregateState, Vec<DerivedEvent>) {
        match outcome {
            FoldOutcome::Applied { state, derived } => (state, derived),
            FoldOutcome::Stale(reason) => panic!("expected applied, got stale: {reason}"),
        }
    }

    fn stock(q: i64) -> ProductEvent {
        ProductEvent::StockUpdated {
            available_quantity: q,
        }
    }

    fn created(id: &str, stars: u8) -> ProductEvent {
        ProductEvent::ReviewCreated {
            review_id: id.into(),
            rating: Rating::new(stars).unwrap(),
            verified: false,
        }
    }

    #[test]
    fn review_scenario_matches_weighted_mean() {
        let settings = RecalcSettings::default();
        let s0 = fresh();
        let (s1, _) = applied(fold(&s0, created("r1", 5), 1, &settings).unwrap());
        assert_eq!(s1.review_aggregate.total_count, 1);
        assert!((s1.review_aggregate.average_rating - 5.0).abs() < f64::EPSILON);

        let (s2, _) = applied(fold(&s1, created("r2", 1), 2, &settings).unwrap());
        assert_eq!(s2.review_aggregate.total_count, 2);
        assert!((s2.review_aggregate.average_rating - 3.0).abs() < f64::EPSILON);

        let delete = ProductEvent::ReviewDeleted {
            review_id: "r1".into(),
            rating: Rating::new(5).unwrap(),
            verified: false,
        };
        let (s3, _) = applied(fold(&s2, delete, 3, &settings).unwrap());
        assert_eq!(s3.review_aggregate.total_count, 1);
        assert!((s3.review_aggregate.average_rating - 1.0).abs() < f64::EPSILON);
        assert_eq!(s3.version, s0.version + 3);
    }

    #[test]
    fn restock_fires_once_per_transition() {
        let settings = RecalcSettings::default();
        let s0 = fresh();
        let (s1, d1) = applied(fold(&s0, stock(0), 1, &settings).unwrap());
        assert!(d1.iter().all(|e| !matches!(e, DerivedEvent::BackInStock { .. })));

        let (s2, d2) = applied(fold(&s1, stock(5), 2, &settings).unwrap());
        let restocks: Vec<_> = d2
            .iter()
            .filter(|e| matches!(e, DerivedEvent::BackInStock { .. }))
            .collect();
        assert_eq!(restocks.len(), 1);

        // Redelivering the same event is stale and emits nothing.
        assert_eq!(
            fold(&s2, stock(5), 2, &settings).unwrap(),
            FoldOutcome::Stale(StaleReason::OlderSequence {
                applied: 2,
                received: 2
            })
        );

        // A newer event at the same level changes nothing about status.
        let (_, d3) = applied(fold(&s2, stock(5), 3, &settings).unwrap());
        assert!(d3.is_empty());
    }

    #[test]
    fn unknown_status_never_fires_restock() {
        let settings = RecalcSettings::default();
        let (_, derived) = applied(fold(&fresh(), stock(50), 1, &settings).unwrap());
        assert!(derived.is_empty());
    }

    #[test]
    fn stock_walk_with_default_threshold() {
        let settings = RecalcSettings::default();
        let mut state = fresh();
        let mut statuses = Vec::new();
        let mut restocks = 0;
        for (seq, q) in [50, 8, 0, 12].into_iter().enumerate() {
            let (next, derived) = applied(fold(&state, stock(q), seq as u64 + 1, &settings).unwrap());
            statuses.push(next.availability.status);
            restocks += derived
                .iter()
                .filter(|e| matches!(e, DerivedEvent::BackInStock { .. }))
                .count();
            state = next;
        }
        assert_eq!(
            statuses,
            vec![
                AvailabilityStatus::InStock,
                AvailabilityStatus::LowStock,
                AvailabilityStatus::OutOfStock,
                AvailabilityStatus::InStock,
            ]
        );
        assert_eq!(restocks, 1);
    }

    #[test]
    fn stock_walk_reaching_low_stock_after_restock() {
        let settings = RecalcSettings {
            low_stock_threshold: 15,
            ..RecalcSettings::default()
        };
        let mut state = fresh();
        let mut statuses = Vec::new();
        let mut restocks = 0;
        for (seq, q) in [50, 8, 0, 12].into_iter().enumerate() {
            let (next, derived) = applied(fold(&state, stock(q), seq as u64 + 1, &settings).unwrap());
            statuses.push(next.availability.status);
            restocks += derived
                .iter()
                .filter(|e| matches!(e, DerivedEvent::BackInStock { .. }))
                .count();
            state = next;
        }
        assert_eq!(
            statuses,
            vec![
                AvailabilityStatus::InStock,
                AvailabilityStatus::LowStock,
                AvailabilityStatus::OutOfStock,
                AvailabilityStatus::LowStock,
            ]
        );
        assert_eq!(restocks, 1);
        assert!(state.badge(LOW_STOCK).is_some());
    }

    #[test]
    fn negative_quantity_is_invariant_violation() {
        let settings = RecalcSettings::default();
        let err = fold(&fresh(), stock(-1), 1, &settings).unwrap_err();
        assert!(matches!(err, RecalcError::InvariantViolation(_)));
    }

    #[test]
    fn unknown_product_only_accepts_creation() {
        let settings = RecalcSettings::default();
        let ctx = RecalcContext::new(&settings, Utc::now());

        let err = apply(None, &pid(), &Mutation::event(stock(3), 1, None), &ctx).unwrap_err();
        assert_eq!(err, RecalcError::UnknownProduct(pid()));

        let (state, derived) = applied(
            apply(
                None,
                &pid(),
                &Mutation::event(ProductEvent::ProductCreated, 1, None),
                &ctx,
            )
            .unwrap(),
        );
        assert_eq!(state.version, 1);
        assert!(derived.is_empty());
    }

    #[test]
    fn removed_product_is_stale() {
        let settings = RecalcSettings::default();
        let (removed, _) = applied(fold(&fresh(), ProductEvent::ProductDeleted, 1, &settings).unwrap());
        assert!(removed.removed);
        assert_eq!(
            fold(&removed, stock(5), 2, &settings).unwrap(),
            FoldOutcome::Stale(StaleReason::ProductRemoved)
        );
    }

    #[test]
    fn manual_badge_lifecycle() {
        let settings = RecalcSettings::default();
        let now = Utc::now();
        let ctx = RecalcContext::new(&settings, now);
        let badge = ManualBadge {
            badge_type: TRENDING.into(),
            label: "Editor's Pick".into(),
            priority: 99,
            expires_at: None,
        };

        let (with_badge, derived) = applied(
            apply(
                Some(&fresh()),
                &pid(),
                &Mutation::AssignManualBadge(badge.clone()),
                &ctx,
            )
            .unwrap(),
        );
        assert_eq!(derived.len(), 1);
        assert_eq!(with_badge.badge(TRENDING).unwrap().source, BadgeSource::Manual);

        // Analytics never dislodge it.
        let views = ProductEvent::ViewsUpdated {
            view_growth_percent: 0.0,
        };
        let (after_views, derived) = applied(fold(&with_badge, views, 1, &settings).unwrap());
        assert!(derived.is_empty());
        assert!(after_views.badge(TRENDING).is_some());

        assert_eq!(
            apply(
                Some(&after_views),
                &pid(),
                &Mutation::AssignManualBadge(badge),
                &ctx
            )
            .unwrap(),
            FoldOutcome::Stale(StaleReason::AlreadyReflected)
        );

        let (cleared, derived) = applied(
            apply(
                Some(&after_views),
                &pid(),
                &Mutation::RemoveManualBadge {
                    badge_type: TRENDING.into(),
                },
                &ctx,
            )
            .unwrap(),
        );
        assert!(cleared.badges.is_empty());
        assert!(matches!(
            &derived[0],
            DerivedEvent::BadgeRemoved {
                reason: RemovalReason::Manual,
                ..
            }
        ));
    }

    #[test]
    fn manual_and_auto_badges_of_one_type_are_independent() {
        let settings = RecalcSettings::default();
        let ctx = RecalcContext::new(&settings, Utc::now());
        let hot = ProductEvent::ViewsUpdated {
            view_growth_percent: 200.0,
        };
        let (auto, _) = applied(fold(&fresh(), hot, 1, &settings).unwrap());
        assert!(auto.badge_from(TRENDING, BadgeSource::Auto).is_some());

        let (both, derived) = applied(
            apply(
                Some(&auto),
                &pid(),
                &Mutation::AssignManualBadge(ManualBadge {
                    badge_type: TRENDING.into(),
                    label: "Editor's Pick".into(),
                    priority: 99,
                    expires_at: None,
                }),
                &ctx,
            )
            .unwrap(),
        );
        assert_eq!(both.badges.len(), 2);
        assert!(both.badge_from(TRENDING, BadgeSource::Auto).is_some());
        assert_eq!(derived.len(), 1);
        assert!(matches!(
            &derived[0],
            DerivedEvent::BadgeAssigned {
                source: BadgeSource::Manual,
                ..
            }
        ));

        let cold = ProductEvent::ViewsUpdated {
            view_growth_percent: 5.0,
        };
        let (manual_only, derived) = applied(fold(&both, cold, 2, &settings).unwrap());
        assert_eq!(derived.len(), 1);
        assert!(matches!(
            &derived[0],
            DerivedEvent::BadgeRemoved {
                reason: RemovalReason::CriteriaNotMet,
                ..
            }
        ));
        assert!(manual_only.badge_from(TRENDING, BadgeSource::Manual).is_some());
        assert!(manual_only.badge_from(TRENDING, BadgeSource::Auto).is_none());

        let (cleared, derived) = applied(
            apply(
                Some(&both),
                &pid(),
                &Mutation::RemoveManualBadge {
                    badge_type: TRENDING.into(),
                },
                &ctx,
            )
            .unwrap(),
        );
        assert_eq!(derived.len(), 1);
        assert!(cleared.badge_from(TRENDING, BadgeSource::Auto).is_some());
        assert!(cleared.badge_from(TRENDING, BadgeSource::Manual).is_none());
    }

    #[test]
    fn sweep_removes_only_expired_auto_badges() {
        let settings = RecalcSettings::default();
        let now = Utc::now();
        let views = ProductEvent::ViewsUpdated {
            view_growth_percent: 120.0,
        };
        let (trending, _) = applied(fold(&fresh(), views, 1, &settings).unwrap());
        assert!(trending.badge(TRENDING).is_some());

        let early = RecalcContext::new(&settings, now);
        assert_eq!(
            apply(Some(&trending), &pid(), &Mutation::SweepExpiredBadges, &early).unwrap(),
            FoldOutcome::Stale(StaleReason::NothingToDo)
        );

        let later = RecalcContext::new(&settings, now + Duration::days(30));
        let (swept, derived) = applied(
            apply(Some(&trending), &pid(), &Mutation::SweepExpiredBadges, &later).unwrap(),
        );
        assert!(swept.badge(TRENDING).is_none());
        assert_eq!(derived.len(), 1);
        assert_eq!(swept.version, trending.version + 1);
    }

    #[test]
    fn tombstones_are_dropped_after_retention_and_live_marks_kept() {
        let settings = RecalcSettings {
            tombstone_retention: Some(Duration::hours(24)),
            ..RecalcSettings::default()
        };
        let start = Utc::now();
        let at = |hours: i64, state: &ProductAggregateState, event: ProductEvent, seq: u64| {
            let ctx = RecalcContext::new(&settings, start + Duration::hours(hours));
            applied(
                apply(
                    Some(state),
                    &pid(),
                    &Mutation::event(event, seq, None),
                    &ctx,
                )
                .unwrap(),
            )
            .0
        };
        let created = |id: &str| ProductEvent::ReviewCreated {
            review_id: id.into(),
            rating: Rating::new(4).unwrap(),
            verified: false,
        };

        let state = at(0, &fresh(), created("r-1"), 1);
        let state = at(0, &state, created("r-2"), 1);
        let state = at(
            1,
            &state,
            ProductEvent::ReviewDeleted {
                review_id: "r-1".into(),
                rating: Rating::new(4).unwrap(),
                verified: false,
            },
            2,
        );
        let tombstone = state.review_aggregate.reviews["r-1"];
        assert!(tombstone.removed);
        assert_eq!(tombstone.removed_at, Some(start + Duration::hours(1)));

        // Still inside the window: a redelivered create stays stale.
        assert_eq!(
            apply(
                Some(&state),
                &pid(),
                &Mutation::event(created("r-1"), 1, None),
                &RecalcContext::new(&settings, start + Duration::hours(2)),
            )
            .unwrap(),
            FoldOutcome::Stale(StaleReason::OlderSequence {
                applied: 2,
                received: 1
            })
        );

        let state = at(30, &state, ProductEvent::QuestionCreated { question_id: "q-1".into() }, 1);
        assert!(!state.review_aggregate.reviews.contains_key("r-1"));
        assert!(state.review_aggregate.reviews.contains_key("r-2"));
        assert_eq!(state.review_aggregate.total_count, 1);
        assert!(state.qa_counters.questions.contains_key("q-1"));
    }

    #[test]
    fn tombstones_kept_forever_without_retention() {
        let settings = RecalcSettings {
            tombstone_retention: None,
            ..RecalcSettings::default()
        };
        let deleted = ProductEvent::QuestionDeleted {
            question_id: "q-1".into(),
            had_answer: false,
        };
        let (state, _) = applied(fold(&fresh(), deleted, 1, &settings).unwrap());
        let later = RecalcContext::new(&settings, Utc::now() + Duration::days(3650));
        let (state, _) = applied(
            apply(
                Some(&state),
                &pid(),
                &Mutation::event(ProductEvent::StockUpdated { available_quantity: 3 }, 1, None),
                &later,
            )
            .unwrap(),
        );
        assert!(state.qa_counters.questions["q-1"].removed);
    }

    #[test]
    fn invariants_detect_histogram_drift() {
        let mut state = fresh();
        state.review_aggregate.total_count = 3;
        assert!(matches!(
            check_invariants(&state),
            Err(RecalcError::InvariantViolation(_))
        ));
    }
}
