//! Outcome of handing one inbound event to the ingestion gate.

use serde::{Deserialize, Serialize};
use std::fmt;

/// What happened to an inbound event.
///
/// The gate never surfaces per-event problems as Rust errors; it classifies
/// them. The classification decides two things:
///
/// | Disposition          | Ledger record | Acknowledge | Redelivery helps |
/// |----------------------|---------------|-------------|------------------|
/// | `Applied`            | yes           | yes         | -                |
/// | `Duplicate`          | already there | yes         | -                |
/// | `Stale`              | yes           | yes         | no               |
/// | `Malformed`          | no            | yes         | no               |
/// | `TransientFailure`   | no            | no          | yes              |
/// | `InvariantViolation` | no            | yes         | no               |
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// The event changed the aggregate.
    Applied,
    /// The event id was already in the ledger.
    Duplicate,
    /// The event's effect is already reflected or superseded.
    Stale,
    /// The envelope or its payload could not be decoded.
    Malformed,
    /// Infrastructure was unavailable; redeliver later.
    TransientFailure,
    /// The event would break an aggregate invariant; prior state kept.
    InvariantViolation,
}

impl Disposition {
    /// Metric/log label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::Duplicate => "duplicate",
            Self::Stale => "stale",
            Self::Malformed => "malformed",
            Self::TransientFailure => "transient_failure",
            Self::InvariantViolation => "invariant_violation",
        }
    }

    /// Whether the broker message can be acknowledged.
    #[must_use]
    pub const fn should_ack(self) -> bool {
        !matches!(self, Self::TransientFailure)
    }

    /// Whether the event id goes into the idempotency ledger.
    #[must_use]
    pub const fn records_in_ledger(self) -> bool {
        matches!(self, Self::Applied | Self::Stale)
    }
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_failures_are_redelivered() {
        for d in [
            Disposition::Applied,
            Disposition::Duplicate,
            Disposition::Stale,
            Disposition::Malformed,
            Disposition::InvariantViolation,
        ] {
            assert!(d.should_ack(), "{d} should be acknowledged");
        }
        assert!(!Disposition::TransientFailure.should_ack());
    }

    #[test]
    fn ledger_records_only_for_processed_events() {
        assert!(Disposition::Applied.records_in_ledger());
        assert!(Disposition::Stale.records_in_ledger());
        assert!(!Disposition::Duplicate.records_in_ledger());
        assert!(!Disposition::Malformed.records_in_ledger());
        assert!(!Disposition::InvariantViolation.records_in_ledger());
        assert!(!Disposition::TransientFailure.records_in_ledger());
    }
}
