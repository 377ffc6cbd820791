//! The closed error set for sync runs.
//!
//! Every failure a handler can surface maps onto one `error_code` stored on
//! the sync run. Classification is typed end-to-end: the HTTP clients return
//! their own error enums and the conversions below decide the code — no
//! substring matching on messages anywhere.

use chrono::{DateTime, Duration, Utc};

/// How long a rate-limited integration stays parked.
pub const RATE_LIMIT_PARK_MINUTES: i64 = 5;

/// A sync run failure, one variant per `error_code`.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// Credentials rejected; the integration is additionally marked broken.
    #[error("source rejected the integration credentials: {0}")]
    Auth(String),

    /// Retries on 429 exhausted; parks the integration until the reset.
    #[error("source rate limit exhausted: {0}")]
    RateLimited(String),

    /// The source kept returning 5xx; the scheduler re-enqueues next tick.
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    /// A bulk-style query timed out before the source produced a result.
    #[error("bulk-style query timed out: {0}")]
    BulkNotReady(String),

    /// The source answered with an unexpected shape.
    #[error("unexpected source response shape: {detail} (fragment: {fragment})")]
    SchemaMismatch { detail: String, fragment: String },

    /// The warehouse transaction rolled back.
    #[error("warehouse write failed: {0}")]
    DbWrite(#[source] warehouse_db::Error),

    /// The run row carries a job type this build does not know.
    #[error("unknown job type: {0}")]
    UnknownJobType(String),

    /// Anything unclassified.
    #[error("{0}")]
    Other(String),
}

impl JobError {
    /// The `error_code` recorded on the sync run.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Auth(_) => "auth_error",
            Self::RateLimited(_) => "rate_limited",
            Self::SourceUnavailable(_) => "source_unavailable",
            Self::BulkNotReady(_) => "bulk_not_ready",
            Self::SchemaMismatch { .. } => "schema_mismatch",
            Self::DbWrite(_) => "db_write_error",
            Self::UnknownJobType(_) => "unknown_job_type",
            Self::Other(_) => "worker_error",
        }
    }

    /// Whether the integration itself should be flipped to `error`.
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth(_))
    }

    /// The rate-limit parking deadline to stamp on the run, if any.
    pub fn rate_limit_reset_at(&self) -> Option<DateTime<Utc>> {
        matches!(self, Self::RateLimited(_))
            .then(|| Utc::now() + Duration::minutes(RATE_LIMIT_PARK_MINUTES))
    }
}

impl From<commerce_client::Error> for JobError {
    fn from(err: commerce_client::Error) -> Self {
        use commerce_client::Error as E;
        match err {
            E::Auth(msg) => Self::Auth(msg),
            E::RateLimited(msg) => Self::RateLimited(msg),
            E::Unavailable { status } => Self::SourceUnavailable(format!("HTTP {status}")),
            E::Schema { detail, fragment } => Self::SchemaMismatch { detail, fragment },
            E::Transport(err) if err.is_timeout() => Self::BulkNotReady(err.to_string()),
            E::Transport(err) => Self::SourceUnavailable(err.to_string()),
            E::Api { status, body } => Self::Other(format!("HTTP {status}: {body}")),
        }
    }
}

impl From<ads_client::Error> for JobError {
    fn from(err: ads_client::Error) -> Self {
        use ads_client::Error as E;
        match err {
            E::Auth(msg) => Self::Auth(msg),
            E::RateLimited { attempts } => {
                Self::RateLimited(format!("429 after {attempts} attempts"))
            }
            E::Unavailable { status } => Self::SourceUnavailable(format!("HTTP {status}")),
            E::Schema { detail, fragment } => Self::SchemaMismatch { detail, fragment },
            E::Transport(err) => Self::SourceUnavailable(err.to_string()),
            E::Api { status, body } => Self::Other(format!("HTTP {status}: {body}")),
        }
    }
}

impl From<warehouse_db::Error> for JobError {
    fn from(err: warehouse_db::Error) -> Self {
        Self::DbWrite(err)
    }
}

impl From<sqlx::Error> for JobError {
    fn from(err: sqlx::Error) -> Self {
        Self::DbWrite(warehouse_db::Error::Database(err))
    }
}
