//! Availability fold.
//!
//! The inventory service is authoritative for absolute quantities, so these
//! events replace values instead of applying deltas. A single sequence marker
//! covers all inventory events for the product: last write wins, older or
//! equal sequences are stale.

use super::{RecalcError, Step, older_than};
use crate::product::{Availability, AvailabilityStatus};

fn quantity(value: i64, field: &str) -> Result<u64, RecalcError> {
    u64::try_from(value)
        .map_err(|_| RecalcError::InvariantViolation(format!("{field} is negative: {value}")))
}

/// Apply `inventory.stock.updated`.
///
/// # Errors
///
/// Returns [`RecalcError::InvariantViolation`] for a negative quantity.
pub fn apply_stock_updated(
    availability: &mut Availability,
    available_quantity: i64,
    sequence: u64,
    low_stock_threshold: u64,
) -> Result<Step, RecalcError> {
    if let Some(stale) = older_than(availability.last_applied_event_seq, sequence) {
        return Ok(stale);
    }
    let available = quantity(available_quantity, "availableQuantity")?;

    availability.available_quantity = available;
    availability.status = AvailabilityStatus::derive(available, low_stock_threshold);
    availability.last_applied_event_seq = Some(sequence);
    Ok(Step::Changed)
}

/// Apply `inventory.reserved` or `inventory.released`.
///
/// Only the reserved quantity changes; status follows available quantity.
///
/// # Errors
///
/// Returns [`RecalcError::InvariantViolation`] for a negative quantity.
pub fn apply_reservation(
    availability: &mut Availability,
    reserved_quantity: i64,
    sequence: u64,
) -> Result<Step, RecalcError> {
    if let Some(stale) = older_than(availability.last_applied_event_seq, sequence) {
        return Ok(stale);
    }
    availability.reserved_quantity = quantity(reserved_quantity, "reservedQuantity")?;
    availability.last_applied_event_seq = Some(sequence);
    Ok(Step::Changed)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::recalc::StaleReason;

    #[test]
    fn out_of_order_update_is_rejected() {
        let mut av = Availability::default();
        apply_stock_updated(&mut av, 20, 5, 10).unwrap();
        assert_eq!(
            apply_stock_updated(&mut av, 0, 4, 10).unwrap(),
            Step::Stale(StaleReason::OlderSequence {
                applied: 5,
                received: 4
            })
        );
        assert_eq!(av.available_quantity, 20);
        assert_eq!(av.status, AvailabilityStatus::InStock);
    }

    #[test]
    fn negative_values_leave_state_untouched() {
        let mut av = Availability::default();
        apply_stock_updated(&mut av, 3, 1, 10).unwrap();
        let before = av.clone();
        assert!(apply_stock_updated(&mut av, -5, 2, 10).is_err());
        assert!(apply_reservation(&mut av, -1, 2).is_err());
        assert_eq!(av, before);
    }

    #[test]
    fn reservation_keeps_status() {
        let mut av = Availability::default();
        apply_stock_updated(&mut av, 4, 1, 10).unwrap();
        apply_reservation(&mut av, 2, 2).unwrap();
        assert_eq!(av.reserved_quantity, 2);
        assert_eq!(av.status, AvailabilityStatus::LowStock);
        assert_eq!(av.last_applied_event_seq, Some(2));
    }
}
