//! Property tests for the review aggregate under reordering and redelivery.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use catalog_sync_core::envelope::ProductEvent;
use catalog_sync_core::product::{ProductAggregateState, ProductId, Rating, RatingHistogram};
use catalog_sync_core::recalc::{self, FoldOutcome, Mutation, RecalcContext, RecalcSettings};
use chrono::{TimeZone, Utc};
use proptest::prelude::*;

#[derive(Clone, Debug)]
struct Lifecycle {
    rating: u8,
    updated_to: Option<u8>,
    deleted: bool,
}

fn lifecycle() -> impl Strategy<Value = Lifecycle> {
    (1u8..=5, proptest::option::of(1u8..=5), any::<bool>()).prop_map(
        |(rating, updated_to, deleted)| Lifecycle {
            rating,
            updated_to,
            deleted,
        },
    )
}

fn rating(stars: u8) -> Rating {
    Rating::new(stars).unwrap()
}

/// Expand lifecycles into sequenced events, sequence increasing per review.
fn events(reviews: &[Lifecycle]) -> Vec<(ProductEvent, u64)> {
    let mut out = Vec::new();
    let mut seq = 0;
    for (i, review) in reviews.iter().enumerate() {
        let id = format!("r-{i}");
        seq += 1;
        out.push((
            ProductEvent::ReviewCreated {
                review_id: id.clone(),
                rating: rating(review.rating),
                verified: false,
            },
            seq,
        ));
        let mut current = review.rating;
        if let Some(new) = review.updated_to {
            seq += 1;
            out.push((
                ProductEvent::ReviewUpdated {
                    review_id: id.clone(),
                    old_rating: rating(current),
                    new_rating: rating(new),
                },
                seq,
            ));
            current = new;
        }
        if review.deleted {
            seq += 1;
            out.push((
                ProductEvent::ReviewDeleted {
                    review_id: id.clone(),
                    rating: rating(current),
                    verified: false,
                },
                seq,
            ));
        }
    }
    out
}

fn expected_histogram(reviews: &[Lifecycle]) -> RatingHistogram {
    let mut h = RatingHistogram::default();
    for review in reviews.iter().filter(|r| !r.deleted) {
        h.increment(rating(review.updated_to.unwrap_or(review.rating)));
    }
    h
}

fn fold_all(events: &[(ProductEvent, u64)], redeliver: bool) -> ProductAggregateState {
    let settings = RecalcSettings::default();
    let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
    let ctx = RecalcContext::new(&settings, now);
    let id = ProductId::new("p");
    let mut state = ProductAggregateState::new(id.clone(), now);
    for (event, seq) in events {
        let times = if redeliver { 2 } else { 1 };
        for _ in 0..times {
            let mutation = Mutation::event(event.clone(), *seq, None);
            match recalc::apply(Some(&state), &id, &mutation, &ctx).unwrap() {
                FoldOutcome::Applied { state: next, .. } => state = next,
                FoldOutcome::Stale(_) => {}
            }
        }
    }
    state
}

proptest! {
    #[test]
    fn average_is_exact_weighted_mean_in_any_order(
        (reviews, order) in prop::collection::vec(lifecycle(), 0..12)
            .prop_flat_map(|reviews| {
                let n = events(&reviews).len();
                let order = Just((0..n).collect::<Vec<_>>()).prop_shuffle();
                (Just(reviews), order)
            })
    ) {
        let in_order = events(&reviews);
        let shuffled: Vec<_> = order.iter().map(|&i| in_order[i].clone()).collect();

        let state = fold_all(&shuffled, false);
        let agg = &state.review_aggregate;

        prop_assert_eq!(agg.rating_histogram, expected_histogram(&reviews));
        prop_assert_eq!(agg.total_count, agg.rating_histogram.total());
        prop_assert!((agg.average_rating - agg.rating_histogram.mean()).abs() < f64::EPSILON);
        prop_assert!((0.0..=5.0).contains(&agg.average_rating));
    }

    #[test]
    fn redelivery_changes_nothing(reviews in prop::collection::vec(lifecycle(), 0..8)) {
        let evs = events(&reviews);
        let once = fold_all(&evs, false);
        let twice = fold_all(&evs, true);
        prop_assert_eq!(once.review_aggregate.rating_histogram, twice.review_aggregate.rating_histogram);
        prop_assert_eq!(once.review_aggregate.reviews, twice.review_aggregate.reviews);
        prop_assert_eq!(once.version, twice.version);
    }
}
