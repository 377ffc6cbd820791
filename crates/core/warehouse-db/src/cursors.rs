//! Per-integration sync watermarks.
//!
//! One row per (integration, job type, cursor key). Cursor values are
//! RFC 3339 UTC timestamps stored as text; for those, lexicographic order is
//! chronological order, which lets the advance statement refuse regressions
//! with a plain string comparison.

use uuid::Uuid;

use crate::sync_runs::JobType;

/// Cursor key for the commerce incremental sync watermark.
pub const LAST_SYNCED_ORDER_UPDATED_AT: &str = "last_synced_order_updated_at";

/// Read a cursor value.
pub async fn get<'c, E>(
    exe: E,
    integration_id: Uuid,
    job_type: &JobType,
    key: &str,
) -> Result<Option<String>, sqlx::Error>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let query = indoc::indoc! {r#"
        SELECT cursor_value
        FROM sync_cursors
        WHERE integration_id = $1 AND job_type = $2 AND cursor_key = $3
    "#};
    sqlx::query_scalar(query)
        .bind(integration_id)
        .bind(job_type)
        .bind(key)
        .fetch_optional(exe)
        .await
}

/// Advance a cursor, creating it if absent.
///
/// The update only applies when the new value is strictly greater than the
/// stored one, so a stale writer can never move a cursor backwards. Returns
/// `true` when the cursor was created or moved forward.
pub async fn advance<'c, E>(
    exe: E,
    integration_id: Uuid,
    job_type: &JobType,
    key: &str,
    value: &str,
) -> Result<bool, sqlx::Error>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let query = indoc::indoc! {r#"
        INSERT INTO sync_cursors (integration_id, job_type, cursor_key, cursor_value)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (integration_id, job_type, cursor_key) DO UPDATE
        SET cursor_value = EXCLUDED.cursor_value,
            updated_at = (timezone('UTC', now()))
        WHERE sync_cursors.cursor_value < EXCLUDED.cursor_value
    "#};
    let result = sqlx::query(query)
        .bind(integration_id)
        .bind(job_type)
        .bind(key)
        .bind(value)
        .execute(exe)
        .await?;
    Ok(result.rows_affected() == 1)
}

/// Create a cursor only when none exists yet.
///
/// Window-fill runs use this so an existing watermark from prior fresh runs
/// is left untouched. Returns `true` when the cursor was created.
pub async fn init_if_absent<'c, E>(
    exe: E,
    integration_id: Uuid,
    job_type: &JobType,
    key: &str,
    value: &str,
) -> Result<bool, sqlx::Error>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let query = indoc::indoc! {r#"
        INSERT INTO sync_cursors (integration_id, job_type, cursor_key, cursor_value)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (integration_id, job_type, cursor_key) DO NOTHING
    "#};
    let result = sqlx::query(query)
        .bind(integration_id)
        .bind(job_type)
        .bind(key)
        .bind(value)
        .execute(exe)
        .await?;
    Ok(result.rows_affected() == 1)
}
