//! Postgres access layer for the tally warehouse.
//!
//! Everything the ingest worker persists lives behind this crate: the
//! sync-run queue, per-integration cursors, the raw landing tables, the fact
//! tables, and the daily aggregate rebuilds. Statement-level functions are
//! generic over [`sqlx::Executor`] so they compose under a caller-owned
//! transaction; multi-statement routines own their transaction here.

use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use chrono::{DateTime, Utc};
use sqlx::{
    Pool, Postgres,
    migrate::Migrator,
    postgres::PgPoolOptions,
};

pub mod accounts;
pub mod cursors;
mod error;
pub mod ingest;
pub mod integrations;
pub mod sync_runs;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use self::{
    error::Error,
    sync_runs::{JobType, RunStatus, SyncRun, Trigger},
};

/// Default connection pool size.
pub const DEFAULT_POOL_SIZE: u32 = 5;

static MIGRATOR: Migrator = sqlx::migrate!();

/// A connection pool to the warehouse database.
#[derive(Debug, Clone)]
pub struct WarehouseDb(Pool<Postgres>);

impl WarehouseDb {
    /// Set up a connection pool to the warehouse database.
    pub async fn connect(url: &str, pool_size: u32) -> Result<Self, Error> {
        PgPoolOptions::new()
            .max_connections(pool_size)
            .acquire_timeout(Duration::from_secs(5))
            .connect(url)
            .await
            .map(Self)
            .map_err(Error::Connection)
    }

    /// Set up a connection pool, retrying transient connection failures with
    /// exponential backoff.
    pub async fn connect_with_retry(url: &str, pool_size: u32) -> Result<Self, Error> {
        (|| Self::connect(url, pool_size))
            .retry(ExponentialBuilder::default())
            .when(Error::is_connection_error)
            .notify(|err, dur| {
                tracing::warn!(
                    error = %err,
                    "failed to connect to warehouse db, retrying in {:.1}s",
                    dur.as_secs_f32()
                );
            })
            .await
    }

    /// Runs migrations on the database.
    ///
    /// sqlx does the right things: locks the DB before running migrations,
    /// never runs the same migration twice, errors on changes to old
    /// migrations.
    pub async fn run_migrations(&self) -> Result<(), Error> {
        MIGRATOR.run(&self.0).await.map_err(Error::Migration)
    }

    /// One round-trip liveness probe. The health endpoint reports ready after
    /// the first success since process start.
    pub async fn probe(&self) -> Result<DateTime<Utc>, Error> {
        let now: DateTime<Utc> = sqlx::query_scalar("SELECT now()")
            .fetch_one(&self.0)
            .await?;
        Ok(now)
    }

    /// Access the underlying pool.
    pub fn pool(&self) -> &Pool<Postgres> {
        &self.0
    }
}

impl std::ops::Deref for WarehouseDb {
    type Target = Pool<Postgres>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}
