//! The sync-run queue.
//!
//! A sync run is a single attempt to execute one job for one integration,
//! persisted as a row with lifecycle `queued -> running -> success | error`.
//! Rows are created by the scheduler endpoint or the UI; the worker owns
//! every transition away from `queued`. Claims take a row lock with
//! `SKIP LOCKED`, so with multiple worker replicas at most one process can
//! move any given run to `running`.

use chrono::{DateTime, Utc};
use sqlx::types::JsonValue;
use uuid::Uuid;

use crate::{Error, WarehouseDb, integrations::IntegrationKind};

/// Hard cap on the stored `error_message`, in characters.
pub const MAX_ERROR_MESSAGE_CHARS: usize = 1000;

const TRUNCATION_INDICATOR: &str = "… [truncated]";

/// The closed set of job types this worker executes.
///
/// Rows authored by other deployments may carry a type this build does not
/// know; those decode as [`JobType::Unknown`] and the dispatcher terminates
/// them with `unknown_job_type` instead of failing the decode.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum JobType {
    /// Incremental commerce order sync from the stored cursor.
    CommerceFresh,
    /// Re-fetch of the trailing commerce order window.
    CommerceWindowFill,
    /// Ads insights sync over the attribution window ending yesterday.
    AdsFresh,
    /// Ads insights sync over the full attribution window.
    AdsWindowFill,
    /// Unrecognised job type.
    Unknown(String),
}

impl JobType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::CommerceFresh => "commerce_fresh",
            Self::CommerceWindowFill => "commerce_window_fill",
            Self::AdsFresh => "ads_fresh",
            Self::AdsWindowFill => "ads_window_fill",
            Self::Unknown(s) => s,
        }
    }

    /// The `fresh` job type for a source kind, as enqueued by the scheduler.
    pub fn fresh_for(kind: IntegrationKind) -> JobType {
        match kind {
            IntegrationKind::Commerce => JobType::CommerceFresh,
            IntegrationKind::Ads => JobType::AdsFresh,
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "commerce_fresh" => Self::CommerceFresh,
            "commerce_window_fill" => Self::CommerceWindowFill,
            "ads_fresh" => Self::AdsFresh,
            "ads_window_fill" => Self::AdsWindowFill,
            other => Self::Unknown(other.to_string()),
        })
    }
}

impl sqlx::Type<sqlx::Postgres> for JobType {
    fn type_info() -> sqlx::postgres::PgTypeInfo {
        sqlx::postgres::PgTypeInfo::with_name("TEXT")
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Postgres> for JobType {
    fn decode(
        value: <sqlx::Postgres as sqlx::Database>::ValueRef<'r>,
    ) -> Result<Self, sqlx::error::BoxDynError> {
        let value: &str = sqlx::Decode::<sqlx::Postgres>::decode(value)?;
        // FromStr::Err is Infallible, unwrap is safe.
        Ok(value.parse().unwrap())
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Postgres> for JobType {
    fn encode_by_ref(
        &self,
        buf: &mut <sqlx::Postgres as sqlx::Database>::ArgumentBuffer<'q>,
    ) -> Result<sqlx::encode::IsNull, sqlx::error::BoxDynError> {
        sqlx::Encode::<sqlx::Postgres>::encode_by_ref(&self.as_str(), buf)
    }
}

/// Lifecycle state of a sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Queued,
    Running,
    Success,
    Error,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Success => "success",
            Self::Error => "error",
        }
    }

    /// Terminal states are never left.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Error)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error parsing a [`RunStatus`] from its TEXT representation.
#[derive(Debug, thiserror::Error)]
#[error("unknown run status: {0}")]
pub struct UnknownRunStatusError(String);

impl std::str::FromStr for RunStatus {
    type Err = UnknownRunStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "error" => Ok(Self::Error),
            other => Err(UnknownRunStatusError(other.to_string())),
        }
    }
}

impl sqlx::Type<sqlx::Postgres> for RunStatus {
    fn type_info() -> sqlx::postgres::PgTypeInfo {
        sqlx::postgres::PgTypeInfo::with_name("TEXT")
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Postgres> for RunStatus {
    fn decode(
        value: <sqlx::Postgres as sqlx::Database>::ValueRef<'r>,
    ) -> Result<Self, sqlx::error::BoxDynError> {
        let value: &str = sqlx::Decode::<sqlx::Postgres>::decode(value)?;
        Ok(value.parse()?)
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Postgres> for RunStatus {
    fn encode_by_ref(
        &self,
        buf: &mut <sqlx::Postgres as sqlx::Database>::ArgumentBuffer<'q>,
    ) -> Result<sqlx::encode::IsNull, sqlx::error::BoxDynError> {
        sqlx::Encode::<sqlx::Postgres>::encode_by_ref(&self.as_str(), buf)
    }
}

/// Who asked for the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Enqueued by the scheduler endpoint.
    Auto,
    /// Enqueued by a user through the UI.
    User,
    /// Enqueued by an operator or another system component.
    System,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::User => "user",
            Self::System => "system",
        }
    }
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error parsing a [`Trigger`] from its TEXT representation.
#[derive(Debug, thiserror::Error)]
#[error("unknown trigger: {0}")]
pub struct UnknownTriggerError(String);

impl std::str::FromStr for Trigger {
    type Err = UnknownTriggerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(Self::Auto),
            "user" => Ok(Self::User),
            "system" => Ok(Self::System),
            other => Err(UnknownTriggerError(other.to_string())),
        }
    }
}

impl sqlx::Type<sqlx::Postgres> for Trigger {
    fn type_info() -> sqlx::postgres::PgTypeInfo {
        sqlx::postgres::PgTypeInfo::with_name("TEXT")
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Postgres> for Trigger {
    fn decode(
        value: <sqlx::Postgres as sqlx::Database>::ValueRef<'r>,
    ) -> Result<Self, sqlx::error::BoxDynError> {
        let value: &str = sqlx::Decode::<sqlx::Postgres>::decode(value)?;
        Ok(value.parse()?)
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Postgres> for Trigger {
    fn encode_by_ref(
        &self,
        buf: &mut <sqlx::Postgres as sqlx::Database>::ArgumentBuffer<'q>,
    ) -> Result<sqlx::encode::IsNull, sqlx::error::BoxDynError> {
        sqlx::Encode::<sqlx::Postgres>::encode_by_ref(&self.as_str(), buf)
    }
}

/// A sync run row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SyncRun {
    pub id: Uuid,
    pub integration_id: Uuid,
    pub job_type: JobType,
    pub trigger: Trigger,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub rate_limited: bool,
    pub rate_limit_reset_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub stats: Option<JsonValue>,
}

const RUN_COLUMNS: &str = indoc::indoc! {r#"
    id, integration_id, job_type, trigger, status, created_at, started_at,
    finished_at, rate_limited, rate_limit_reset_at, retry_count,
    error_code, error_message, stats
"#};

/// Insert a new queued run.
pub async fn enqueue<'c, E>(
    exe: E,
    integration_id: Uuid,
    job_type: &JobType,
    trigger: Trigger,
) -> Result<Uuid, sqlx::Error>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let query = indoc::indoc! {r#"
        INSERT INTO sync_runs (integration_id, job_type, status, trigger)
        VALUES ($1, $2, 'queued', $3)
        RETURNING id
    "#};
    sqlx::query_scalar(query)
        .bind(integration_id)
        .bind(job_type)
        .bind(trigger)
        .fetch_one(exe)
        .await
}

/// Claim the next runnable queued run, if any.
///
/// One transaction: select a queued row whose rate-limit parking (if any) has
/// expired, with `FOR UPDATE SKIP LOCKED` so concurrent workers never claim
/// the same row, then move it to `running` and clear stale error fields. The
/// select carries no other filters — every queued row is eventually eligible.
/// Ordering by `created_at` is for fairness, not a guarantee callers may
/// rely on.
pub async fn claim_next(db: &WarehouseDb) -> Result<Option<SyncRun>, Error> {
    let mut tx = db.begin().await?;

    let select = indoc::formatdoc! {r#"
        SELECT {RUN_COLUMNS}
        FROM sync_runs
        WHERE status = 'queued'
          AND (NOT rate_limited OR rate_limit_reset_at <= now())
        ORDER BY created_at ASC
        LIMIT 1
        FOR UPDATE SKIP LOCKED
    "#};
    let run: Option<SyncRun> = sqlx::query_as(&select).fetch_optional(&mut *tx).await?;

    let Some(mut run) = run else {
        tx.commit().await?;
        return Ok(None);
    };

    let update = indoc::indoc! {r#"
        UPDATE sync_runs
        SET status = 'running',
            started_at = (timezone('UTC', now())),
            error_code = NULL,
            error_message = NULL
        WHERE id = $1
        RETURNING started_at
    "#};
    let started_at: DateTime<Utc> = sqlx::query_scalar(update)
        .bind(run.id)
        .fetch_one(&mut *tx)
        .await?;

    tx.commit().await?;

    run.status = RunStatus::Running;
    run.started_at = Some(started_at);
    run.error_code = None;
    run.error_message = None;
    Ok(Some(run))
}

/// Terminate a run as `success`, recording its stats.
pub async fn mark_success<'c, E>(exe: E, id: Uuid, stats: &JsonValue) -> Result<(), sqlx::Error>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let query = indoc::indoc! {r#"
        UPDATE sync_runs
        SET status = 'success',
            finished_at = (timezone('UTC', now())),
            stats = $2
        WHERE id = $1
    "#};
    sqlx::query(query).bind(id).bind(stats).execute(exe).await?;
    Ok(())
}

/// Terminate a run as `error`.
///
/// The message is truncated to [`MAX_ERROR_MESSAGE_CHARS`] characters with a
/// trailing indicator. When `rate_limit_reset_at` is set, the run is also
/// flagged `rate_limited`, which parks subsequent scheduling for the
/// integration until the reset passes.
pub async fn mark_error<'c, E>(
    exe: E,
    id: Uuid,
    code: &str,
    message: &str,
    rate_limit_reset_at: Option<DateTime<Utc>>,
) -> Result<(), sqlx::Error>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let query = indoc::indoc! {r#"
        UPDATE sync_runs
        SET status = 'error',
            finished_at = (timezone('UTC', now())),
            error_code = $2,
            error_message = $3,
            rate_limited = ($4::timestamptz IS NOT NULL),
            rate_limit_reset_at = $4
        WHERE id = $1
    "#};
    sqlx::query(query)
        .bind(id)
        .bind(code)
        .bind(truncate_error_message(message))
        .bind(rate_limit_reset_at)
        .execute(exe)
        .await?;
    Ok(())
}

/// Enqueue one `fresh` run per healthy integration of the given kind,
/// skipping integrations that already have a recent queued or running run of
/// that type, or a rate-limited run whose reset is still in the future.
///
/// A single statement, safe to call arbitrarily often. Returns the number of
/// runs inserted.
pub async fn schedule_fresh<'c, E>(
    exe: E,
    kind: IntegrationKind,
    interval_minutes: i32,
) -> Result<u64, sqlx::Error>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let job_type = JobType::fresh_for(kind);
    let query = indoc::indoc! {r#"
        INSERT INTO sync_runs (integration_id, job_type, status, trigger)
        SELECT i.id, $2, 'queued', 'auto'
        FROM integrations i
        WHERE i.kind = $1
          AND i.status IN ('connected', 'active')
          AND NOT EXISTS (
              SELECT 1
              FROM sync_runs r
              WHERE r.integration_id = i.id
                AND r.job_type = $2
                AND r.status IN ('queued', 'running')
                AND r.created_at > now() - make_interval(mins => $3)
          )
          AND NOT EXISTS (
              SELECT 1
              FROM sync_runs r
              WHERE r.integration_id = i.id
                AND r.job_type = $2
                AND r.rate_limited
                AND r.rate_limit_reset_at > now()
          )
    "#};
    let result = sqlx::query(query)
        .bind(kind)
        .bind(&job_type)
        .bind(interval_minutes)
        .execute(exe)
        .await?;
    Ok(result.rows_affected())
}

/// Mark runs stuck in `running` longer than the threshold as abandoned.
///
/// The worker never calls this from its own loop; it is the statement the
/// external sweeper runs, kept here so the sweeper and the tests share one
/// definition.
pub async fn sweep_abandoned<'c, E>(exe: E, threshold_minutes: i32) -> Result<u64, sqlx::Error>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let query = indoc::indoc! {r#"
        UPDATE sync_runs
        SET status = 'error',
            finished_at = (timezone('UTC', now())),
            error_code = 'abandoned',
            error_message = 'run exceeded the running-state threshold'
        WHERE status = 'running'
          AND started_at < now() - make_interval(mins => $1)
    "#};
    let result = sqlx::query(query).bind(threshold_minutes).execute(exe).await?;
    Ok(result.rows_affected())
}

/// Get a run by id.
pub async fn get_by_id<'c, E>(exe: E, id: Uuid) -> Result<Option<SyncRun>, sqlx::Error>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let query = indoc::formatdoc! {r#"
        SELECT {RUN_COLUMNS}
        FROM sync_runs
        WHERE id = $1
    "#};
    sqlx::query_as(&query).bind(id).fetch_optional(exe).await
}

/// Truncate an error message to [`MAX_ERROR_MESSAGE_CHARS`] characters,
/// indicator included.
fn truncate_error_message(message: &str) -> String {
    if message.chars().count() <= MAX_ERROR_MESSAGE_CHARS {
        return message.to_string();
    }
    let keep = MAX_ERROR_MESSAGE_CHARS - TRUNCATION_INDICATOR.chars().count();
    let mut truncated: String = message.chars().take(keep).collect();
    truncated.push_str(TRUNCATION_INDICATOR);
    truncated
}


/// In-tree DB integration tests
#[cfg(test)]
mod tests {
    mod it_queue;
}
