//! In-memory idempotency ledger.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)]

use catalog_sync_core::ledger::{IdempotencyLedger, LedgerError, ProcessedEventRecord};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// `HashMap`-backed ledger with failure injection.
///
/// # Example
///
/// ```
/// use catalog_sync_testing::InMemoryLedger;
/// use catalog_sync_core::ledger::{IdempotencyLedger, ProcessedEventRecord};
/// use catalog_sync_core::product::ProductId;
/// use chrono::Utc;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let ledger = InMemoryLedger::new();
/// let record = ProcessedEventRecord {
///     event_id: "evt-1".into(),
///     stream_name: "reviews".into(),
///     event_type: "review.created".into(),
///     product_id: ProductId::new("p-1"),
///     processed_at: Utc::now(),
/// };
/// assert!(ledger.record(record.clone()).await?);
/// assert!(!ledger.record(record).await?);
/// assert!(ledger.is_processed("evt-1").await?);
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryLedger {
    records: Arc<RwLock<HashMap<String, ProcessedEventRecord>>>,
    unavailable: Arc<AtomicBool>,
    delay: Arc<RwLock<Option<Duration>>>,
}

impl InMemoryLedger {
    /// Create an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail with [`LedgerError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Sleep before answering each operation.
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.write().unwrap() = delay;
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().unwrap().len()
    }

    /// Whether the ledger is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.read().unwrap().is_empty()
    }

    /// Record for an event id, if any.
    #[must_use]
    pub fn get(&self, event_id: &str) -> Option<ProcessedEventRecord> {
        self.records.read().unwrap().get(event_id).cloned()
    }

    async fn gate(&self) -> Result<(), LedgerError> {
        let delay = *self.delay.read().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(LedgerError::Unavailable("injected failure".to_string()));
        }
        Ok(())
    }
}

impl IdempotencyLedger for InMemoryLedger {
    fn is_processed(
        &self,
        event_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<bool, LedgerError>> + Send + '_>> {
        let event_id = event_id.to_string();
        Box::pin(async move {
            self.gate().await?;
            Ok(self.records.read().unwrap().contains_key(&event_id))
        })
    }

    fn record(
        &self,
        record: ProcessedEventRecord,
    ) -> Pin<Box<dyn Future<Output = Result<bool, LedgerError>> + Send + '_>> {
        Box::pin(async move {
            self.gate().await?;
            let mut records = self.records.write().unwrap();
            if records.contains_key(&record.event_id) {
                return Ok(false);
            }
            records.insert(record.event_id.clone(), record);
            Ok(true)
        })
    }

    fn purge_older_than(
        &self,
        stream_name: &str,
        cutoff: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<u64, LedgerError>> + Send + '_>> {
        let stream_name = stream_name.to_string();
        Box::pin(async move {
            self.gate().await?;
            let mut records = self.records.write().unwrap();
            let before = records.len();
            records.retain(|_, r| r.stream_name != stream_name || r.processed_at >= cutoff);
            Ok((before - records.len()) as u64)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use catalog_sync_core::product::ProductId;

    fn record(id: &str, stream: &str, at: DateTime<Utc>) -> ProcessedEventRecord {
        ProcessedEventRecord {
            event_id: id.to_string(),
            stream_name: stream.to_string(),
            event_type: "x".to_string(),
            product_id: ProductId::new("p"),
            processed_at: at,
        }
    }

    #[tokio::test]
    async fn purge_is_scoped_to_stream() {
        let ledger = InMemoryLedger::new();
        let now = Utc::now();
        let old = now - chrono::Duration::days(10);
        ledger.record(record("a", "reviews", old)).await.unwrap();
        ledger.record(record("b", "inventory", old)).await.unwrap();
        ledger.record(record("c", "reviews", now)).await.unwrap();

        let purged = ledger
            .purge_older_than("reviews", now - chrono::Duration::days(1))
            .await
            .unwrap();
        assert_eq!(purged, 1);
        assert!(!ledger.is_processed("a").await.unwrap());
        assert!(ledger.is_processed("b").await.unwrap());
        assert!(ledger.is_processed("c").await.unwrap());
    }

    #[tokio::test]
    async fn injected_failure() {
        let ledger = InMemoryLedger::new();
        ledger.set_unavailable(true);
        assert!(matches!(
            ledger.is_processed("a").await,
            Err(LedgerError::Unavailable(_))
        ));
        ledger.set_unavailable(false);
        assert!(!ledger.is_processed("a").await.unwrap());
    }
}
