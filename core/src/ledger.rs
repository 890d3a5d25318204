//! Idempotency ledger: which inbound events have already been handled.
//!
//! The broker delivers at least once, so the same `eventId` may arrive many
//! times. The gate checks the ledger before dispatching and writes a
//! [`ProcessedEventRecord`] only after the aggregate change is durable:
//!
//! ```text
//! is_processed(id)? ── yes ──► Duplicate (ack, no work)
//!        │ no
//!        ▼
//!   route + apply ──► record(id)
//! ```
//!
//! A crash between apply and record is safe because the recalculators guard
//! every change with per-item sequence marks; redelivery then folds into a
//! stale no-op.

use crate::product::ProductId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// A handled inbound event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessedEventRecord {
    /// Globally unique event id.
    pub event_id: String,
    /// Logical stream, e.g. `reviews`.
    pub stream_name: String,
    /// Event type that was handled.
    pub event_type: String,
    /// Product the event targeted.
    pub product_id: ProductId,
    /// When handling finished.
    pub processed_at: DateTime<Utc>,
}

/// Errors that can occur during ledger operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// The backing store could not be reached or the query failed.
    #[error("Ledger unavailable: {0}")]
    Unavailable(String),

    /// The operation did not finish in time.
    #[error("Ledger operation timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// Durable record of processed event ids.
///
/// # Dyn Compatibility
///
/// This trait uses explicit `Pin<Box<dyn Future>>` returns instead of `async fn`
/// so it can be shared as `Arc<dyn IdempotencyLedger>`.
pub trait IdempotencyLedger: Send + Sync {
    /// Whether `event_id` has been recorded.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Unavailable`] if the store cannot be queried.
    fn is_processed(
        &self,
        event_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<bool, LedgerError>> + Send + '_>>;

    /// Write a record. Write-once: returns `false` if the id was already present.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Unavailable`] if the write fails.
    fn record(
        &self,
        record: ProcessedEventRecord,
    ) -> Pin<Box<dyn Future<Output = Result<bool, LedgerError>> + Send + '_>>;

    /// Delete records of `stream_name` processed before `cutoff`.
    ///
    /// Returns the number of records removed.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Unavailable`] if the delete fails.
    fn purge_older_than(
        &self,
        stream_name: &str,
        cutoff: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<u64, LedgerError>> + Send + '_>>;
}
