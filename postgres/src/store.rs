//! Aggregate documents on the `product_aggregates` table.

use catalog_sync_core::product::{ProductAggregateState, ProductId};
use catalog_sync_core::store::{AggregateStore, StoreError};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::types::Json;
use std::future::Future;
use std::pin::Pin;

/// `PostgreSQL`-backed [`AggregateStore`].
///
/// The document is stored whole as `JSONB`. `version`, `removed` and
/// `next_badge_expiry` are duplicated into columns so the version check and
/// the expiry sweep run without reading the document.
#[derive(Clone, Debug)]
pub struct PostgresAggregateStore {
    pool: PgPool,
}

impl PostgresAggregateStore {
    /// Create a store on an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get the underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn stored_version(&self, product_id: &ProductId) -> Result<Option<u64>, StoreError> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT version FROM product_aggregates WHERE product_id = $1")
                .bind(product_id.as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(db_error)?;
        row.map(|(v,)| from_db_version(v)).transpose()
    }
}

#[allow(clippy::needless_pass_by_value)] // used as `map_err(db_error)`
fn db_error(e: sqlx::Error) -> StoreError {
    StoreError::DatabaseError(e.to_string())
}

fn to_db_version(version: u64) -> Result<i64, StoreError> {
    i64::try_from(version)
        .map_err(|_| StoreError::SerializationError(format!("version {version} out of range")))
}

fn from_db_version(version: i64) -> Result<u64, StoreError> {
    u64::try_from(version)
        .map_err(|_| StoreError::SerializationError(format!("negative version {version}")))
}

impl AggregateStore for PostgresAggregateStore {
    fn load(
        &self,
        product_id: &ProductId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<ProductAggregateState>, StoreError>> + Send + '_>>
    {
        let product_id = product_id.clone();
        Box::pin(async move {
            let row: Option<(Json<ProductAggregateState>,)> =
                sqlx::query_as("SELECT state FROM product_aggregates WHERE product_id = $1")
                    .bind(product_id.as_str())
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(|e| match e {
                        sqlx::Error::ColumnDecode { source, .. } => {
                            StoreError::SerializationError(source.to_string())
                        }
                        other => db_error(other),
                    })?;
            Ok(row.map(|(Json(state),)| state))
        })
    }

    fn insert(
        &self,
        state: &ProductAggregateState,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>> {
        let state = state.clone();
        Box::pin(async move {
            let result = sqlx::query(
                r"
                INSERT INTO product_aggregates
                    (product_id, version, state, removed, next_badge_expiry, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (product_id) DO NOTHING
                ",
            )
            .bind(state.product_id.as_str())
            .bind(to_db_version(state.version)?)
            .bind(Json(&state))
            .bind(state.removed)
            .bind(state.next_badge_expiry())
            .bind(state.updated_at)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;

            if result.rows_affected() == 0 {
                return Err(StoreError::AlreadyExists(state.product_id));
            }
            Ok(())
        })
    }

    fn save(
        &self,
        state: &ProductAggregateState,
        expected_version: u64,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>> {
        let state = state.clone();
        Box::pin(async move {
            let result = sqlx::query(
                r"
                UPDATE product_aggregates
                SET version = $2, state = $3, removed = $4,
                    next_badge_expiry = $5, updated_at = $6
                WHERE product_id = $1 AND version = $7
                ",
            )
            .bind(state.product_id.as_str())
            .bind(to_db_version(state.version)?)
            .bind(Json(&state))
            .bind(state.removed)
            .bind(state.next_badge_expiry())
            .bind(state.updated_at)
            .bind(to_db_version(expected_version)?)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;

            if result.rows_affected() == 0 {
                let actual = self.stored_version(&state.product_id).await?;
                metrics::counter!("aggregate_store_conflicts_total").increment(1);
                tracing::warn!(
                    product_id = %state.product_id,
                    expected = expected_version,
                    actual = ?actual,
                    "Aggregate version conflict"
                );
                return Err(StoreError::ConcurrencyConflict {
                    product_id: state.product_id,
                    expected: expected_version,
                    actual,
                });
            }
            Ok(())
        })
    }

    fn products_with_expired_badges(
        &self,
        now: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<ProductId>, StoreError>> + Send + '_>> {
        Box::pin(async move {
            let rows: Vec<(String,)> = sqlx::query_as(
                r"
                SELECT product_id FROM product_aggregates
                WHERE NOT removed AND next_badge_expiry <= $1
                ORDER BY product_id
                ",
            )
            .bind(now)
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)?;

            Ok(rows.into_iter().map(|(id,)| ProductId::new(id)).collect())
        })
    }
}
