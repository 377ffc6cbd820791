//! The warehouse writer.
//!
//! One routine per source persists everything a sync run produced inside a
//! single transaction: raw landing upserts, fact replacement scoped to the
//! natural keys the run touched, a wholesale rebuild of the per-source daily
//! metrics for every touched date, the blended daily summary for those same
//! dates, and an optional cursor write supplied by the handler.
//!
//! The daily rebuilds aggregate the committed fact tables, never the
//! incoming batch, so replaying a run converges to the same warehouse state.
//! Because the transaction is atomic, a date can never be observed
//! half-rebuilt.

use std::collections::BTreeSet;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::{PgConnection, types::JsonValue};
use uuid::Uuid;

use crate::{Error, WarehouseDb, cursors, sync_runs::JobType};

/// Hard ceiling on rows per batched statement.
pub const MAX_BATCH_ROWS: usize = 1000;

/// A raw commerce order payload, landed as-is.
#[derive(Debug, Clone)]
pub struct RawOrder {
    pub external_id: String,
    pub payload: JsonValue,
    pub source_created_at: Option<DateTime<Utc>>,
    pub source_updated_at: Option<DateTime<Utc>>,
}

/// A normalised order fact row.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderFact {
    pub order_name: String,
    pub gross: Decimal,
    pub net: Decimal,
    pub refund_total: Decimal,
    pub currency: String,
    pub order_date: NaiveDate,
    pub status: Option<String>,
}

/// Everything a commerce run wants persisted.
#[derive(Debug, Clone)]
pub struct CommerceBatch {
    pub integration_id: Uuid,
    pub account_id: Uuid,
    pub shop: String,
    pub raw: Vec<RawOrder>,
    pub facts: Vec<OrderFact>,
}

/// A raw per-ad insight payload, landed as-is.
#[derive(Debug, Clone)]
pub struct RawAdInsight {
    pub date: NaiveDate,
    pub ad_id: String,
    pub payload: JsonValue,
}

/// A per-(ad-account, day) fact row, already summed across ads.
#[derive(Debug, Clone, PartialEq)]
pub struct AdsDailyFact {
    pub date: NaiveDate,
    pub spend: Decimal,
    pub impressions: i64,
    pub clicks: i64,
    pub purchases: i64,
    pub purchase_value: Decimal,
    pub currency: String,
}

/// Everything an ads run wants persisted.
#[derive(Debug, Clone)]
pub struct AdsBatch {
    pub integration_id: Uuid,
    pub account_id: Uuid,
    pub ad_account: String,
    pub raw: Vec<RawAdInsight>,
    pub facts: Vec<AdsDailyFact>,
}

/// How a handler wants its cursor written inside the transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorMode {
    /// Move forward only; regressions are refused.
    Advance,
    /// Create only when absent; an existing watermark is left alone.
    InitIfAbsent,
}

/// A cursor write to perform under the same transaction as the data.
#[derive(Debug, Clone)]
pub struct CursorUpdate {
    pub job_type: JobType,
    pub key: String,
    pub value: String,
    pub mode: CursorMode,
}

/// What a persist call actually wrote.
#[derive(Debug, Clone, Default)]
pub struct IngestOutcome {
    pub raw_rows: u64,
    pub fact_rows: u64,
    /// Distinct dates whose daily aggregates were rebuilt, ascending.
    pub dates: Vec<NaiveDate>,
    /// Whether the cursor write applied (created or moved forward).
    pub cursor_written: bool,
}

/// Persist a commerce run's batch atomically.
pub async fn persist_commerce(
    db: &WarehouseDb,
    batch: &CommerceBatch,
    cursor: Option<&CursorUpdate>,
) -> Result<IngestOutcome, Error> {
    let dates = distinct_dates(batch.facts.iter().map(|f| f.order_date));
    if batch.raw.is_empty() && batch.facts.is_empty() && cursor.is_none() {
        return Ok(IngestOutcome::default());
    }

    let mut tx = db.begin().await?;

    let raw_rows = upsert_raw_orders(&mut tx, batch.integration_id, &batch.raw).await?;
    let fact_rows = replace_order_facts(&mut tx, batch).await?;
    if !dates.is_empty() {
        rebuild_commerce_daily(&mut tx, batch.account_id, &batch.shop, &dates).await?;
        rebuild_daily_summary(&mut tx, batch.account_id, &dates).await?;
    }
    let cursor_written = write_cursor(&mut tx, batch.integration_id, cursor).await?;

    tx.commit().await?;

    Ok(IngestOutcome {
        raw_rows,
        fact_rows,
        dates,
        cursor_written,
    })
}

/// Persist an ads run's batch atomically.
pub async fn persist_ads(
    db: &WarehouseDb,
    batch: &AdsBatch,
    cursor: Option<&CursorUpdate>,
) -> Result<IngestOutcome, Error> {
    let dates = distinct_dates(batch.facts.iter().map(|f| f.date));
    if batch.raw.is_empty() && batch.facts.is_empty() && cursor.is_none() {
        return Ok(IngestOutcome::default());
    }

    let mut tx = db.begin().await?;

    let raw_rows = upsert_raw_insights(&mut tx, batch.integration_id, &batch.raw).await?;
    let fact_rows = replace_ads_facts(&mut tx, batch).await?;
    if !dates.is_empty() {
        rebuild_ads_daily(&mut tx, batch.account_id, &batch.ad_account, &dates).await?;
        rebuild_daily_summary(&mut tx, batch.account_id, &dates).await?;
    }
    let cursor_written = write_cursor(&mut tx, batch.integration_id, cursor).await?;

    tx.commit().await?;

    Ok(IngestOutcome {
        raw_rows,
        fact_rows,
        dates,
        cursor_written,
    })
}

fn distinct_dates(dates: impl Iterator<Item = NaiveDate>) -> Vec<NaiveDate> {
    dates.collect::<BTreeSet<_>>().into_iter().collect()
}

async fn write_cursor(
    conn: &mut PgConnection,
    integration_id: Uuid,
    cursor: Option<&CursorUpdate>,
) -> Result<bool, Error> {
    let Some(cursor) = cursor else {
        return Ok(false);
    };
    let written = match cursor.mode {
        CursorMode::Advance => {
            cursors::advance(
                &mut *conn,
                integration_id,
                &cursor.job_type,
                &cursor.key,
                &cursor.value,
            )
            .await?
        }
        CursorMode::InitIfAbsent => {
            cursors::init_if_absent(
                &mut *conn,
                integration_id,
                &cursor.job_type,
                &cursor.key,
                &cursor.value,
            )
            .await?
        }
    };
    Ok(written)
}

async fn upsert_raw_orders(
    conn: &mut PgConnection,
    integration_id: Uuid,
    raw: &[RawOrder],
) -> Result<u64, Error> {
    let query = indoc::indoc! {r#"
        INSERT INTO raw_commerce_orders
            (integration_id, external_id, payload, source_created_at, source_updated_at)
        SELECT $1, u.external_id, u.payload, u.source_created_at, u.source_updated_at
        FROM unnest($2::text[], $3::jsonb[], $4::timestamptz[], $5::timestamptz[])
            AS u(external_id, payload, source_created_at, source_updated_at)
        ON CONFLICT (integration_id, external_id) DO UPDATE
        SET payload = EXCLUDED.payload,
            source_created_at = EXCLUDED.source_created_at,
            source_updated_at = EXCLUDED.source_updated_at,
            landed_at = (timezone('UTC', now()))
    "#};

    let mut total = 0;
    for chunk in raw.chunks(MAX_BATCH_ROWS) {
        let external_ids: Vec<&str> = chunk.iter().map(|r| r.external_id.as_str()).collect();
        let payloads: Vec<JsonValue> = chunk.iter().map(|r| r.payload.clone()).collect();
        let created: Vec<Option<DateTime<Utc>>> =
            chunk.iter().map(|r| r.source_created_at).collect();
        let updated: Vec<Option<DateTime<Utc>>> =
            chunk.iter().map(|r| r.source_updated_at).collect();

        let result = sqlx::query(query)
            .bind(integration_id)
            .bind(&external_ids)
            .bind(&payloads)
            .bind(&created)
            .bind(&updated)
            .execute(&mut *conn)
            .await?;
        total += result.rows_affected();
    }
    Ok(total)
}

async fn replace_order_facts(
    conn: &mut PgConnection,
    batch: &CommerceBatch,
) -> Result<u64, Error> {
    let delete = indoc::indoc! {r#"
        DELETE FROM fact_orders
        WHERE integration_id = $1 AND order_name = ANY($2)
    "#};
    let insert = indoc::indoc! {r#"
        INSERT INTO fact_orders
            (integration_id, account_id, shop, order_name, gross, net,
             refund_total, currency, order_date, status)
        SELECT $1, $2, $3, u.order_name, u.gross, u.net,
               u.refund_total, u.currency, u.order_date, u.status
        FROM unnest($4::text[], $5::numeric[], $6::numeric[], $7::numeric[],
                    $8::text[], $9::date[], $10::text[])
            AS u(order_name, gross, net, refund_total, currency, order_date, status)
    "#};

    let mut total = 0;
    for chunk in batch.facts.chunks(MAX_BATCH_ROWS) {
        let names: Vec<&str> = chunk.iter().map(|f| f.order_name.as_str()).collect();
        sqlx::query(delete)
            .bind(batch.integration_id)
            .bind(&names)
            .execute(&mut *conn)
            .await?;

        let gross: Vec<Decimal> = chunk.iter().map(|f| f.gross).collect();
        let net: Vec<Decimal> = chunk.iter().map(|f| f.net).collect();
        let refunds: Vec<Decimal> = chunk.iter().map(|f| f.refund_total).collect();
        let currencies: Vec<&str> = chunk.iter().map(|f| f.currency.as_str()).collect();
        let dates: Vec<NaiveDate> = chunk.iter().map(|f| f.order_date).collect();
        let statuses: Vec<Option<&str>> = chunk.iter().map(|f| f.status.as_deref()).collect();

        let result = sqlx::query(insert)
            .bind(batch.integration_id)
            .bind(batch.account_id)
            .bind(&batch.shop)
            .bind(&names)
            .bind(&gross)
            .bind(&net)
            .bind(&refunds)
            .bind(&currencies)
            .bind(&dates)
            .bind(&statuses)
            .execute(&mut *conn)
            .await?;
        total += result.rows_affected();
    }
    Ok(total)
}

async fn upsert_raw_insights(
    conn: &mut PgConnection,
    integration_id: Uuid,
    raw: &[RawAdInsight],
) -> Result<u64, Error> {
    let query = indoc::indoc! {r#"
        INSERT INTO raw_ads_insights (integration_id, date, ad_id, payload)
        SELECT $1, u.date, u.ad_id, u.payload
        FROM unnest($2::date[], $3::text[], $4::jsonb[]) AS u(date, ad_id, payload)
        ON CONFLICT (integration_id, date, ad_id) DO UPDATE
        SET payload = EXCLUDED.payload,
            landed_at = (timezone('UTC', now()))
    "#};

    let mut total = 0;
    for chunk in raw.chunks(MAX_BATCH_ROWS) {
        let dates: Vec<NaiveDate> = chunk.iter().map(|r| r.date).collect();
        let ad_ids: Vec<&str> = chunk.iter().map(|r| r.ad_id.as_str()).collect();
        let payloads: Vec<JsonValue> = chunk.iter().map(|r| r.payload.clone()).collect();

        let result = sqlx::query(query)
            .bind(integration_id)
            .bind(&dates)
            .bind(&ad_ids)
            .bind(&payloads)
            .execute(&mut *conn)
            .await?;
        total += result.rows_affected();
    }
    Ok(total)
}

async fn replace_ads_facts(conn: &mut PgConnection, batch: &AdsBatch) -> Result<u64, Error> {
    let delete = indoc::indoc! {r#"
        DELETE FROM fact_ads_daily
        WHERE integration_id = $1 AND date = ANY($2)
    "#};
    let insert = indoc::indoc! {r#"
        INSERT INTO fact_ads_daily
            (integration_id, account_id, ad_account, date, spend, impressions,
             clicks, purchases, purchase_value, currency)
        SELECT $1, $2, $3, u.date, u.spend, u.impressions,
               u.clicks, u.purchases, u.purchase_value, u.currency
        FROM unnest($4::date[], $5::numeric[], $6::bigint[], $7::bigint[],
                    $8::bigint[], $9::numeric[], $10::text[])
            AS u(date, spend, impressions, clicks, purchases, purchase_value, currency)
    "#};

    let mut total = 0;
    for chunk in batch.facts.chunks(MAX_BATCH_ROWS) {
        let dates: Vec<NaiveDate> = chunk.iter().map(|f| f.date).collect();
        sqlx::query(delete)
            .bind(batch.integration_id)
            .bind(&dates)
            .execute(&mut *conn)
            .await?;

        let spend: Vec<Decimal> = chunk.iter().map(|f| f.spend).collect();
        let impressions: Vec<i64> = chunk.iter().map(|f| f.impressions).collect();
        let clicks: Vec<i64> = chunk.iter().map(|f| f.clicks).collect();
        let purchases: Vec<i64> = chunk.iter().map(|f| f.purchases).collect();
        let purchase_value: Vec<Decimal> = chunk.iter().map(|f| f.purchase_value).collect();
        let currencies: Vec<&str> = chunk.iter().map(|f| f.currency.as_str()).collect();

        let result = sqlx::query(insert)
            .bind(batch.integration_id)
            .bind(batch.account_id)
            .bind(&batch.ad_account)
            .bind(&dates)
            .bind(&spend)
            .bind(&impressions)
            .bind(&clicks)
            .bind(&purchases)
            .bind(&purchase_value)
            .bind(&currencies)
            .execute(&mut *conn)
            .await?;
        total += result.rows_affected();
    }
    Ok(total)
}

async fn rebuild_commerce_daily(
    conn: &mut PgConnection,
    account_id: Uuid,
    shop: &str,
    dates: &[NaiveDate],
) -> Result<(), Error> {
    let delete = indoc::indoc! {r#"
        DELETE FROM commerce_daily_metrics
        WHERE account_id = $1 AND shop = $2 AND date = ANY($3)
    "#};
    sqlx::query(delete)
        .bind(account_id)
        .bind(shop)
        .bind(dates)
        .execute(&mut *conn)
        .await?;

    let insert = indoc::indoc! {r#"
        INSERT INTO commerce_daily_metrics
            (account_id, shop, date, orders, revenue_gross, revenue_net, refunds)
        SELECT account_id, shop, order_date, count(*), sum(gross), sum(net), sum(refund_total)
        FROM fact_orders
        WHERE account_id = $1 AND shop = $2 AND order_date = ANY($3)
        GROUP BY account_id, shop, order_date
    "#};
    sqlx::query(insert)
        .bind(account_id)
        .bind(shop)
        .bind(dates)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn rebuild_ads_daily(
    conn: &mut PgConnection,
    account_id: Uuid,
    ad_account: &str,
    dates: &[NaiveDate],
) -> Result<(), Error> {
    let delete = indoc::indoc! {r#"
        DELETE FROM ads_daily_metrics
        WHERE account_id = $1 AND ad_account = $2 AND date = ANY($3)
    "#};
    sqlx::query(delete)
        .bind(account_id)
        .bind(ad_account)
        .bind(dates)
        .execute(&mut *conn)
        .await?;

    let insert = indoc::indoc! {r#"
        INSERT INTO ads_daily_metrics
            (account_id, ad_account, date, spend, impressions, clicks,
             purchases, purchase_value)
        SELECT account_id, ad_account, date, sum(spend), sum(impressions), sum(clicks),
               sum(purchases), sum(purchase_value)
        FROM fact_ads_daily
        WHERE account_id = $1 AND ad_account = $2 AND date = ANY($3)
        GROUP BY account_id, ad_account, date
    "#};
    sqlx::query(insert)
        .bind(account_id)
        .bind(ad_account)
        .bind(dates)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Rebuild the blended summary for every touched date.
///
/// `MER = revenue_net / ads_spend` when spend > 0, else NULL.
/// `AOV = revenue_net / orders` when orders > 0, else 0.
/// A pure function of the committed source metrics, so concurrent runs for
/// different sources under the same account recompute a consistent value no
/// matter who commits last.
async fn rebuild_daily_summary(
    conn: &mut PgConnection,
    account_id: Uuid,
    dates: &[NaiveDate],
) -> Result<(), Error> {
    let delete = indoc::indoc! {r#"
        DELETE FROM daily_summary
        WHERE account_id = $1 AND date = ANY($2)
    "#};
    sqlx::query(delete)
        .bind(account_id)
        .bind(dates)
        .execute(&mut *conn)
        .await?;

    let insert = indoc::indoc! {r#"
        INSERT INTO daily_summary
            (account_id, date, revenue_net, ads_spend, mer, orders, aov)
        SELECT
            $1,
            d.date,
            COALESCE(c.revenue_net, 0),
            COALESCE(a.spend, 0),
            CASE WHEN COALESCE(a.spend, 0) > 0
                 THEN COALESCE(c.revenue_net, 0) / a.spend
            END,
            COALESCE(c.orders, 0),
            CASE WHEN COALESCE(c.orders, 0) > 0
                 THEN c.revenue_net / c.orders
                 ELSE 0
            END
        FROM unnest($2::date[]) AS d(date)
        LEFT JOIN (
            SELECT date, sum(revenue_net) AS revenue_net, sum(orders) AS orders
            FROM commerce_daily_metrics
            WHERE account_id = $1 AND date = ANY($2)
            GROUP BY date
        ) c ON c.date = d.date
        LEFT JOIN (
            SELECT date, sum(spend) AS spend
            FROM ads_daily_metrics
            WHERE account_id = $1 AND date = ANY($2)
            GROUP BY date
        ) a ON a.date = d.date
    "#};
    sqlx::query(insert)
        .bind(account_id)
        .bind(dates)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// In-tree DB integration tests
#[cfg(test)]
mod tests {
    mod it_ingest;
}
