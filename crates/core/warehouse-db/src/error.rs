//! Error types for warehouse database operations

/// Transaction aborts Postgres issues under lock contention. Either one
/// means the statement itself was fine and the transaction can be replayed
/// from the top. Codes from the errcodes appendix.
const PG_SERIALIZATION_FAILURE: &str = "40001";
const PG_DEADLOCK_DETECTED: &str = "40P01";

/// Errors that can occur when interacting with the warehouse database.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Failed to establish a connection to the warehouse database.
    ///
    /// Always treated as transient; callers retry with backoff.
    #[error("error connecting to warehouse db: {0}")]
    Connection(#[source] sqlx::Error),

    /// Failed to run database migrations. Usually fatal and requires manual
    /// intervention.
    #[error("error running migrations: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),

    /// A query against the warehouse database failed.
    #[error("error executing warehouse query: {0}")]
    Database(#[from] sqlx::Error),
}

impl Error {
    /// Whether this failure is about reaching the database at all, as
    /// opposed to what was asked of it. Connection-level trouble says
    /// nothing about the statement, so callers retry these with backoff.
    pub fn is_connection_error(&self) -> bool {
        let source = match self {
            Error::Connection(_) => return true,
            Error::Migration(_) => return false,
            Error::Database(source) => source,
        };
        matches!(
            source,
            sqlx::Error::PoolTimedOut
                | sqlx::Error::PoolClosed
                | sqlx::Error::Io(_)
                | sqlx::Error::Tls(_)
        )
    }

    /// Connection trouble, plus the two contention aborts (serialization
    /// failure, deadlock victim) that row-locked claims can provoke. A
    /// retry must restart the whole transaction, not just the failed
    /// statement.
    pub fn is_retryable(&self) -> bool {
        if self.is_connection_error() {
            return true;
        }
        let Error::Database(sqlx::Error::Database(source)) = self else {
            return false;
        };
        source.code().is_some_and(|code| {
            code == PG_SERIALIZATION_FAILURE || code == PG_DEADLOCK_DETECTED
        })
    }
}
