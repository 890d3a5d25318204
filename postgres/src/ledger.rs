//! Idempotency ledger on the `processed_events` table.

use catalog_sync_core::ledger::{IdempotencyLedger, LedgerError, ProcessedEventRecord};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::future::Future;
use std::pin::Pin;

/// `PostgreSQL`-backed [`IdempotencyLedger`].
///
/// Records are write-once: `INSERT .. ON CONFLICT DO NOTHING` makes a
/// concurrent second writer a no-op instead of an error.
#[derive(Clone, Debug)]
pub struct PostgresLedger {
    pool: PgPool,
}

impl PostgresLedger {
    /// Create a ledger on an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get the underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn unavailable(e: &sqlx::Error) -> LedgerError {
    LedgerError::Unavailable(e.to_string())
}

impl IdempotencyLedger for PostgresLedger {
    fn is_processed(
        &self,
        event_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<bool, LedgerError>> + Send + '_>> {
        let event_id = event_id.to_string();
        Box::pin(async move {
            let (exists,): (bool,) =
                sqlx::query_as("SELECT EXISTS (SELECT 1 FROM processed_events WHERE event_id = $1)")
                    .bind(&event_id)
                    .fetch_one(&self.pool)
                    .await
                    .map_err(|e| unavailable(&e))?;
            Ok(exists)
        })
    }

    fn record(
        &self,
        record: ProcessedEventRecord,
    ) -> Pin<Box<dyn Future<Output = Result<bool, LedgerError>> + Send + '_>> {
        Box::pin(async move {
            let result = sqlx::query(
                r"
                INSERT INTO processed_events
                    (event_id, stream_name, event_type, product_id, processed_at)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (event_id) DO NOTHING
                ",
            )
            .bind(&record.event_id)
            .bind(&record.stream_name)
            .bind(&record.event_type)
            .bind(record.product_id.as_str())
            .bind(record.processed_at)
            .execute(&self.pool)
            .await
            .map_err(|e| unavailable(&e))?;

            Ok(result.rows_affected() == 1)
        })
    }

    fn purge_older_than(
        &self,
        stream_name: &str,
        cutoff: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<u64, LedgerError>> + Send + '_>> {
        let stream_name = stream_name.to_string();
        Box::pin(async move {
            let result = sqlx::query(
                "DELETE FROM processed_events WHERE stream_name = $1 AND processed_at < $2",
            )
            .bind(&stream_name)
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(|e| unavailable(&e))?;

            tracing::debug!(
                stream = %stream_name,
                purged = result.rows_affected(),
                "Purged processed events"
            );
            Ok(result.rows_affected())
        })
    }
}
