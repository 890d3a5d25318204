//! Review aggregate fold.
//!
//! Reviews are counted as deltas into a star histogram. Each review id has a
//! [`ReviewMark`] remembering the rating currently counted for it, the last
//! sequence applied and whether it was deleted. That mark is what makes the
//! fold safe under redelivery and reordering:
//!
//! | Event              | Unknown id              | Live mark                | Tombstone        |
//! |--------------------|-------------------------|--------------------------|------------------|
//! | `review.created`   | count `rating`          | stale (already counted)  | count if newer   |
//! | `review.updated`   | count `newRating`       | move stored → new        | superseded       |
//! | `review.deleted`   | tombstone, no count     | uncount stored rating    | already reflected|
//!
//! Any event whose sequence is not newer than the mark's is stale. The
//! average is recomputed from the histogram after every change.

use super::{RecalcError, StaleReason, Step, older_than};
use crate::product::{Rating, ReviewAggregate, ReviewMark};
use chrono::{DateTime, Utc};

/// Apply `review.created`.
pub fn apply_created(
    agg: &mut ReviewAggregate,
    review_id: &str,
    rating: Rating,
    verified: bool,
    sequence: u64,
    occurred_at: Option<DateTime<Utc>>,
) -> Step {
    if let Some(mark) = agg.reviews.get(review_id) {
        if let Some(stale) = older_than(Some(mark.sequence), sequence) {
            return stale;
        }
        if !mark.removed {
            return Step::Stale(StaleReason::AlreadyReflected);
        }
    }

    agg.rating_histogram.increment(rating);
    if verified {
        agg.verified_count += 1;
    }
    agg.reviews.insert(
        review_id.to_string(),
        ReviewMark {
            rating,
            verified,
            sequence,
            removed: false,
            removed_at: None,
        },
    );

    agg.recent_reviews.retain(|id| id != review_id);
    agg.recent_reviews.insert(0, review_id.to_string());
    agg.recent_reviews.truncate(ReviewAggregate::RECENT_LIMIT);

    if let Some(at) = occurred_at {
        agg.last_review_at = Some(agg.last_review_at.map_or(at, |prev| prev.max(at)));
    }

    finish(agg, sequence);
    Step::Changed
}

/// Apply `review.updated`.
///
/// The rating stored in the mark wins over `old_rating`; a mismatch is logged.
///
/// # Errors
///
/// Returns [`RecalcError::InvariantViolation`] if the stored rating's bucket
/// is empty.
pub fn apply_updated(
    agg: &mut ReviewAggregate,
    review_id: &str,
    old_rating: Rating,
    new_rating: Rating,
    sequence: u64,
) -> Result<Step, RecalcError> {
    match agg.reviews.get(review_id).copied() {
        Some(mark) => {
            if let Some(stale) = older_than(Some(mark.sequence), sequence) {
                return Ok(stale);
            }
            if mark.removed {
                return Ok(Step::Stale(StaleReason::Superseded));
            }
            if mark.rating != old_rating {
                tracing::warn!(
                    review_id,
                    stored_rating = %mark.rating,
                    old_rating = %old_rating,
                    "review.updated oldRating differs from counted rating, using counted rating"
                );
            }
            if mark.rating != new_rating {
                take(agg, mark.rating, review_id)?;
                agg.rating_histogram.increment(new_rating);
            }
            agg.reviews.insert(
                review_id.to_string(),
                ReviewMark {
                    rating: new_rating,
                    sequence,
                    ..mark
                },
            );
        }
        None => {
            agg.rating_histogram.increment(new_rating);
            agg.reviews.insert(
                review_id.to_string(),
                ReviewMark {
                    rating: new_rating,
                    verified: false,
                    sequence,
                    removed: false,
                    removed_at: None,
                },
            );
        }
    }

    finish(agg, sequence);
    Ok(Step::Changed)
}

/// Apply `review.deleted`.
///
/// # Errors
///
/// Returns [`RecalcError::InvariantViolation`] if the stored rating's bucket
/// is empty or the verified count would go negative.
pub fn apply_deleted(
    agg: &mut ReviewAggregate,
    review_id: &str,
    rating: Rating,
    verified: bool,
    sequence: u64,
) -> Result<Step, RecalcError> {
    match agg.reviews.get(review_id).copied() {
        Some(mark) => {
            if let Some(stale) = older_than(Some(mark.sequence), sequence) {
                return Ok(stale);
            }
            if mark.removed {
                return Ok(Step::Stale(StaleReason::AlreadyReflected));
            }
            if mark.rating != rating {
                tracing::warn!(
                    review_id,
                    stored_rating = %mark.rating,
                    event_rating = %rating,
                    "review.deleted rating differs from counted rating, using counted rating"
                );
            }
            take(agg, mark.rating, review_id)?;
            if mark.verified {
                agg.verified_count = agg.verified_count.checked_sub(1).ok_or_else(|| {
                    RecalcError::InvariantViolation(format!(
                        "verified count underflow deleting review {review_id}"
                    ))
                })?;
            }
            agg.reviews.insert(
                review_id.to_string(),
                ReviewMark {
                    sequence,
                    removed: true,
                    removed_at: None,
                    ..mark
                },
            );
            agg.recent_reviews.retain(|id| id != review_id);
        }
        None => {
            agg.reviews.insert(
                review_id.to_string(),
                ReviewMark {
                    rating,
                    verified,
                    sequence,
                    removed: true,
                    removed_at: None,
                },
            );
        }
    }

    finish(agg, sequence);
    Ok(Step::Changed)
}

fn take(agg: &mut ReviewAggregate, rating: Rating, review_id: &str) -> Result<(), RecalcError> {
    if agg.rating_histogram.decrement(rating) {
        Ok(())
    } else {
        Err(RecalcError::InvariantViolation(format!(
            "histogram bucket {rating} empty while removing review {review_id}"
        )))
    }
}

fn finish(agg: &mut ReviewAggregate, sequence: u64) {
    agg.last_applied_event_seq = Some(agg.last_applied_event_seq.map_or(sequence, |s| s.max(sequence)));
    agg.refresh_summary();
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn r(stars: u8) -> Rating {
        Rating::new(stars).unwrap()
    }

    #[test]
    fn duplicate_create_is_stale() {
        let mut agg = ReviewAggregate::default();
        assert_eq!(apply_created(&mut agg, "a", r(4), true, 1, None), Step::Changed);
        let before = agg.clone();
        assert!(matches!(
            apply_created(&mut agg, "a", r(4), true, 1, None),
            Step::Stale(StaleReason::OlderSequence { .. })
        ));
        assert_eq!(
            apply_created(&mut agg, "a", r(4), true, 2, None),
            Step::Stale(StaleReason::AlreadyReflected)
        );
        assert_eq!(agg, before);
        assert_eq!(agg.verified_count, 1);
    }

    #[test]
    fn update_moves_from_stored_rating() {
        let mut agg = ReviewAggregate::default();
        apply_created(&mut agg, "a", r(2), false, 1, None);
        // Producer claims the old rating was 3; the counted 2 wins.
        assert_eq!(apply_updated(&mut agg, "a", r(3), r(5), 2).unwrap(), Step::Changed);
        assert_eq!(agg.rating_histogram.count(r(2)), 0);
        assert_eq!(agg.rating_histogram.count(r(5)), 1);
        assert!((agg.average_rating - 5.0).abs() < f64::EPSILON);
    }

    #[test]
    fn update_before_create_counts_once() {
        let mut agg = ReviewAggregate::default();
        apply_updated(&mut agg, "a", r(1), r(4), 5).unwrap();
        assert!(matches!(
            apply_created(&mut agg, "a", r(1), false, 3, None),
            Step::Stale(StaleReason::OlderSequence { .. })
        ));
        assert_eq!(agg.total_count, 1);
        assert_eq!(agg.rating_histogram.count(r(4)), 1);
        assert_eq!(agg.last_applied_event_seq, Some(5));
    }

    #[test]
    fn delete_before_create_leaves_tombstone() {
        let mut agg = ReviewAggregate::default();
        apply_deleted(&mut agg, "a", r(3), false, 4).unwrap();
        assert_eq!(agg.total_count, 0);
        assert!(matches!(
            apply_created(&mut agg, "a", r(3), false, 2, None),
            Step::Stale(StaleReason::OlderSequence { .. })
        ));
        assert_eq!(agg.total_count, 0);
        assert!(agg.reviews["a"].removed);
    }

    #[test]
    fn update_after_delete_is_superseded() {
        let mut agg = ReviewAggregate::default();
        apply_created(&mut agg, "a", r(3), false, 1, None);
        apply_deleted(&mut agg, "a", r(3), false, 2).unwrap();
        assert_eq!(
            apply_updated(&mut agg, "a", r(3), r(4), 3).unwrap(),
            Step::Stale(StaleReason::Superseded)
        );
        assert_eq!(agg.total_count, 0);
    }

    #[test]
    fn recent_reviews_keep_five_newest_live() {
        let mut agg = ReviewAggregate::default();
        for (i, id) in ["a", "b", "c", "d", "e", "f"].into_iter().enumerate() {
            apply_created(&mut agg, id, r(5), false, i as u64 + 1, None);
        }
        assert_eq!(agg.recent_reviews, vec!["f", "e", "d", "c", "b"]);
        apply_deleted(&mut agg, "d", r(5), false, 10).unwrap();
        assert_eq!(agg.recent_reviews, vec!["f", "e", "c", "b"]);
    }

    #[test]
    fn verified_count_follows_deletes() {
        let mut agg = ReviewAggregate::default();
        apply_created(&mut agg, "a", r(5), true, 1, None);
        apply_created(&mut agg, "b", r(4), false, 2, None);
        assert_eq!(agg.verified_count, 1);
        apply_deleted(&mut agg, "a", r(5), true, 3).unwrap();
        assert_eq!(agg.verified_count, 0);
        assert_eq!(agg.total_count, 1);
    }

    #[test]
    fn last_review_at_tracks_newest_occurrence() {
        let mut agg = ReviewAggregate::default();
        let t1 = Utc::now();
        let t0 = t1 - chrono::Duration::hours(1);
        apply_created(&mut agg, "a", r(5), false, 2, Some(t1));
        apply_created(&mut agg, "b", r(5), false, 3, Some(t0));
        assert_eq!(agg.last_review_at, Some(t1));
    }
}
