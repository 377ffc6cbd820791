//! Commerce sync handlers.
//!
//! `window_fill` re-fetches a trailing window of orders by creation time and
//! initialises the incremental watermark if none exists. `fresh` fetches
//! orders by update time from the stored watermark and advances it, never
//! backwards. Both land raw payloads, replace fact rows, and rebuild the
//! daily aggregates for every touched date in one transaction.

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use commerce_client::{Client, ClientConfig, OrderFilter, SourceOrder};
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::types::JsonValue;
use tracing::warn;
use uuid::Uuid;
use warehouse_db::{
    SyncRun, accounts,
    cursors::{self, LAST_SYNCED_ORDER_UPDATED_AT},
    ingest::{self, CommerceBatch, CursorMode, CursorUpdate, OrderFact, RawOrder},
    integrations::{self, Integration, secrets},
    sync_runs::JobType,
};

use crate::{Ctx, JobError};

/// Stats recorded on a successful `commerce_window_fill` run.
#[derive(Debug, Serialize)]
pub struct WindowFillStats {
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub fetched_orders: usize,
    pub persisted_orders: u64,
    pub dates_affected: Vec<chrono::NaiveDate>,
    pub api_calls: u32,
    pub cursor_initialized: bool,
}

/// Stats recorded on a successful `commerce_fresh` run.
#[derive(Debug, Serialize)]
pub struct FreshStats {
    pub fetched_orders: usize,
    pub persisted_orders: u64,
    pub dates_affected: Vec<chrono::NaiveDate>,
    pub api_calls: u32,
    pub cursor_previous: Option<String>,
    pub cursor_next: Option<String>,
    pub cursor_advanced: bool,
}

/// Re-fetch the trailing order window.
pub async fn window_fill(ctx: &Ctx, run: &SyncRun) -> Result<JsonValue, JobError> {
    let loaded = load(ctx, run.integration_id).await?;
    let window_end = Utc::now();
    let window_start = window_end - Duration::days(ctx.config.commerce_window_days as i64);

    let fetch = loaded
        .client
        .fetch_orders(&OrderFilter::CreatedAtMin(window_start))
        .await?;

    let batch = build_batch(&loaded, &fetch.orders);
    // Initialise the fresh watermark only when absent, so subsequent fresh
    // runs start from this moment. An existing watermark is left alone.
    let cursor = max_updated_at(&fetch.orders).map(|at| CursorUpdate {
        job_type: JobType::CommerceFresh,
        key: LAST_SYNCED_ORDER_UPDATED_AT.to_string(),
        value: format_cursor(at),
        mode: CursorMode::InitIfAbsent,
    });

    let outcome = ingest::persist_commerce(&ctx.db, &batch, cursor.as_ref()).await?;

    let stats = WindowFillStats {
        window_start,
        window_end,
        fetched_orders: fetch.orders.len(),
        persisted_orders: outcome.fact_rows,
        dates_affected: outcome.dates,
        api_calls: fetch.api_calls,
        cursor_initialized: outcome.cursor_written,
    };
    serde_json::to_value(&stats).map_err(|err| JobError::Other(err.to_string()))
}

/// Incremental sync from the stored watermark.
pub async fn fresh(ctx: &Ctx, run: &SyncRun) -> Result<JsonValue, JobError> {
    let loaded = load(ctx, run.integration_id).await?;

    let previous = cursors::get(
        ctx.db.pool(),
        run.integration_id,
        &JobType::CommerceFresh,
        LAST_SYNCED_ORDER_UPDATED_AT,
    )
    .await?;
    // No watermark yet: fall back to the trailing window. Deeper history
    // needs an explicit window_fill.
    let since = previous
        .as_deref()
        .and_then(parse_cursor)
        .unwrap_or_else(|| {
            Utc::now() - Duration::days(ctx.config.commerce_window_days as i64)
        });

    let fetch = loaded
        .client
        .fetch_orders(&OrderFilter::UpdatedAtMin(since))
        .await?;

    let batch = build_batch(&loaded, &fetch.orders);
    let candidate = max_updated_at(&fetch.orders).map(format_cursor);
    let cursor = candidate.clone().map(|value| CursorUpdate {
        job_type: JobType::CommerceFresh,
        key: LAST_SYNCED_ORDER_UPDATED_AT.to_string(),
        value,
        mode: CursorMode::Advance,
    });

    let outcome = ingest::persist_commerce(&ctx.db, &batch, cursor.as_ref()).await?;

    let cursor_next = if outcome.cursor_written {
        candidate
    } else {
        previous.clone()
    };
    let stats = FreshStats {
        fetched_orders: fetch.orders.len(),
        persisted_orders: outcome.fact_rows,
        dates_affected: outcome.dates,
        api_calls: fetch.api_calls,
        cursor_previous: previous,
        cursor_next,
        cursor_advanced: outcome.cursor_written,
    };
    serde_json::to_value(&stats).map_err(|err| JobError::Other(err.to_string()))
}

struct Loaded {
    integration: Integration,
    client: Client,
    account_currency: String,
}

async fn load(ctx: &Ctx, integration_id: Uuid) -> Result<Loaded, JobError> {
    let integration = integrations::get_by_id(ctx.db.pool(), integration_id)
        .await?
        .ok_or_else(|| JobError::Other(format!("integration {integration_id} not found")))?;

    let access_token = secrets::get(
        ctx.db.pool(),
        integration_id,
        secrets::COMMERCE_OFFLINE_TOKEN,
    )
    .await?
    .ok_or_else(|| JobError::Auth("integration has no commerce offline token".to_string()))?;

    let account_currency = accounts::get_currency(ctx.db.pool(), integration.account_id)
        .await?
        .ok_or_else(|| {
            JobError::Other(format!("account {} not found", integration.account_id))
        })?;

    let client = Client::new(ClientConfig {
        shop: integration.external_ref.clone(),
        access_token,
        api_version: ctx.config.commerce_api_version.clone(),
        ipv4_override: ctx.config.ipv4_override,
    })?;

    Ok(Loaded {
        integration,
        client,
        account_currency,
    })
}

fn build_batch(loaded: &Loaded, orders: &[SourceOrder]) -> CommerceBatch {
    CommerceBatch {
        integration_id: loaded.integration.id,
        account_id: loaded.integration.account_id,
        shop: loaded.integration.external_ref.clone(),
        raw: orders
            .iter()
            .map(|order| RawOrder {
                external_id: order.id.clone(),
                payload: order.payload.clone(),
                source_created_at: Some(order.created_at),
                source_updated_at: Some(order.updated_at),
            })
            .collect(),
        facts: orders
            .iter()
            .map(|order| order_fact(order, &loaded.account_currency))
            .collect(),
    }
}

/// Normalise one source order into a fact row.
fn order_fact(order: &SourceOrder, fallback_currency: &str) -> OrderFact {
    let gross = match order.current_total.or(order.total) {
        Some(total) => total,
        None => {
            warn!(order_id = %order.id, "order carries no total, landing a zero gross");
            Decimal::ZERO
        }
    };
    let refund_total = order.total_refunds.unwrap_or(Decimal::ZERO);
    let net = (gross - refund_total).max(Decimal::ZERO);

    let currency = match &order.currency {
        Some(currency) => currency.clone(),
        None => {
            warn!(order_id = %order.id, "order carries no currency, inheriting the shop's");
            fallback_currency.to_string()
        }
    };

    OrderFact {
        order_name: order_name(order),
        gross,
        net,
        refund_total,
        currency,
        // Aggregates bucket on the UTC calendar date of creation.
        order_date: order.created_at.date_naive(),
        status: order_status(
            order.financial_status.as_deref(),
            order.fulfillment_status.as_deref(),
        ),
    }
}

/// `name`, else `#<order_number>`, else `order_<id-without-prefix>`.
fn order_name(order: &SourceOrder) -> String {
    if let Some(name) = &order.name {
        return name.clone();
    }
    if let Some(number) = order.order_number {
        return format!("#{number}");
    }
    let bare_id = order.id.rsplit('/').next().unwrap_or(&order.id);
    format!("order_{bare_id}")
}

/// Concatenation of the financial and fulfilment statuses, skipping nulls.
fn order_status(financial: Option<&str>, fulfillment: Option<&str>) -> Option<String> {
    match (financial, fulfillment) {
        (Some(financial), Some(fulfillment)) => Some(format!("{financial} / {fulfillment}")),
        (Some(one), None) | (None, Some(one)) => Some(one.to_string()),
        (None, None) => None,
    }
}

fn max_updated_at(orders: &[SourceOrder]) -> Option<DateTime<Utc>> {
    orders.iter().map(|order| order.updated_at).max()
}

fn format_cursor(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn parse_cursor(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|at| at.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source_order() -> SourceOrder {
        SourceOrder {
            id: "gid://commerce/Order/991".to_string(),
            name: Some("#1001".to_string()),
            order_number: Some(1001),
            created_at: "2026-01-20T10:00:00Z".parse().unwrap(),
            updated_at: "2026-01-21T09:00:00Z".parse().unwrap(),
            currency: Some("AUD".to_string()),
            total: Some("150.00".parse().unwrap()),
            current_total: None,
            total_refunds: Some("0.00".parse().unwrap()),
            financial_status: Some("paid".to_string()),
            fulfillment_status: Some("fulfilled".to_string()),
            payload: serde_json::json!({}),
        }
    }

    #[test]
    fn gross_prefers_the_current_total() {
        let mut order = source_order();
        order.current_total = Some("140.00".parse().unwrap());

        let fact = order_fact(&order, "AUD");
        assert_eq!(fact.gross, "140.00".parse().unwrap());
    }

    #[test]
    fn net_is_gross_minus_refunds_floored_at_zero() {
        let mut order = source_order();
        order.total = Some("50.00".parse().unwrap());
        order.total_refunds = Some("80.00".parse().unwrap());

        let fact = order_fact(&order, "AUD");
        assert_eq!(fact.net, Decimal::ZERO);
        assert_eq!(fact.refund_total, "80.00".parse().unwrap());
    }

    #[test]
    fn missing_currency_inherits_the_shop_currency() {
        let mut order = source_order();
        order.currency = None;

        let fact = order_fact(&order, "NZD");
        assert_eq!(fact.currency, "NZD");
    }

    #[test]
    fn order_date_is_the_utc_calendar_date_of_creation() {
        let mut order = source_order();
        order.created_at = "2026-01-20T23:59:59Z".parse().unwrap();

        let fact = order_fact(&order, "AUD");
        assert_eq!(fact.order_date, "2026-01-20".parse().unwrap());
    }

    #[test]
    fn order_name_falls_back_through_number_to_bare_id() {
        let mut order = source_order();
        assert_eq!(order_name(&order), "#1001");

        order.name = None;
        assert_eq!(order_name(&order), "#1001");

        order.order_number = None;
        assert_eq!(order_name(&order), "order_991");
    }

    #[test]
    fn status_concatenates_and_skips_nulls() {
        assert_eq!(
            order_status(Some("paid"), Some("fulfilled")).as_deref(),
            Some("paid / fulfilled")
        );
        assert_eq!(order_status(Some("refunded"), None).as_deref(), Some("refunded"));
        assert_eq!(order_status(None, Some("fulfilled")).as_deref(), Some("fulfilled"));
        assert_eq!(order_status(None, None), None);
    }

    #[test]
    fn cursor_round_trips_in_rfc3339_utc() {
        let at = "2026-01-22T08:00:00Z".parse().unwrap();
        let formatted = format_cursor(at);
        assert_eq!(formatted, "2026-01-22T08:00:00Z");
        assert_eq!(parse_cursor(&formatted), Some(at));
    }
}
