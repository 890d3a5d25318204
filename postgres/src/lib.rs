//! `PostgreSQL` persistence for catalog sync.
//!
//! - [`PostgresLedger`]: the idempotency ledger, one row per processed event
//! - [`PostgresAggregateStore`]: aggregate documents as `JSONB` with a
//!   `version` column for optimistic concurrency
//!
//! Both share a pool; [`migrate`] creates their tables.
//!
//! # Example
//!
//! ```ignore
//! use catalog_sync_postgres::{PostgresAggregateStore, PostgresLedger, migrate};
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let pool = sqlx::PgPool::connect("postgres://localhost/catalog").await?;
//!     migrate(&pool).await?;
//!     let ledger = PostgresLedger::new(pool.clone());
//!     let store = PostgresAggregateStore::new(pool);
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod ledger;
mod store;

pub use ledger::PostgresLedger;
pub use store::PostgresAggregateStore;

/// Create or upgrade the ledger and aggregate tables.
///
/// # Errors
///
/// Returns the migrator's error if a migration fails to apply.
pub async fn migrate(pool: &sqlx::PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}
