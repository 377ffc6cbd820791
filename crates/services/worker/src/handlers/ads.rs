//! Ads sync handlers.
//!
//! Both jobs walk the attribution window one day at a time, because the
//! insights API attributes conversions back onto the day the ad ran: a
//! purchase today changes last Tuesday's numbers. `window_fill` covers the
//! full window ending today; `fresh` covers the same window ending
//! yesterday. No persistent cursor is needed — the window is always
//! re-fetched wholesale.

use chrono::{Days, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::types::JsonValue;
use uuid::Uuid;
use warehouse_db::{
    SyncRun, accounts,
    ingest::{self, AdsBatch, AdsDailyFact, RawAdInsight},
    integrations::{self, Integration, secrets},
};

use crate::{Ctx, JobError};

/// Stats recorded on a successful ads run.
#[derive(Debug, Serialize)]
pub struct AdsRunStats {
    pub window_start: NaiveDate,
    pub window_end: NaiveDate,
    pub days: u32,
    pub fetched_ads: usize,
    pub api_calls: u32,
    pub retries: u32,
    pub dates_affected: Vec<NaiveDate>,
    pub spend_total: Decimal,
}

/// Re-fetch the full attribution window, ending today.
pub async fn window_fill(ctx: &Ctx, run: &SyncRun) -> Result<JsonValue, JobError> {
    run_window(ctx, run, Utc::now().date_naive()).await
}

/// Re-fetch the attribution window ending yesterday.
///
/// Completion is implicit in the run's `finished_at`; there is nothing to
/// checkpoint because every day in the window is refetched next time.
pub async fn fresh(ctx: &Ctx, run: &SyncRun) -> Result<JsonValue, JobError> {
    let yesterday = Utc::now()
        .date_naive()
        .pred_opt()
        .ok_or_else(|| JobError::Other("clock produced an unrepresentable date".into()))?;
    run_window(ctx, run, yesterday).await
}

async fn run_window(ctx: &Ctx, run: &SyncRun, window_end: NaiveDate) -> Result<JsonValue, JobError> {
    let loaded = load(ctx, run.integration_id).await?;
    let days = ctx.config.ads_attribution_window_days;
    let window_start = window_end
        .checked_sub_days(Days::new((days - 1) as u64))
        .ok_or_else(|| JobError::Other("attribution window underflows the calendar".into()))?;

    let mut raw: Vec<RawAdInsight> = Vec::new();
    let mut facts: Vec<AdsDailyFact> = Vec::new();
    let mut api_calls = 0u32;
    let mut retries = 0u32;

    let mut date = window_start;
    while date <= window_end {
        let daily = loaded.client.fetch_daily_insights(date).await?;
        api_calls += daily.api_calls;
        retries += daily.retries;

        raw.extend(daily.ads.iter().map(|ad| RawAdInsight {
            date,
            ad_id: ad.ad_id.clone(),
            payload: ad.payload.clone(),
        }));
        // A day with no rows still lands a zeroed fact so stale numbers from
        // a previous fetch cannot survive the replace.
        facts.push(AdsDailyFact {
            date,
            spend: daily.spend,
            impressions: daily.impressions,
            clicks: daily.clicks,
            purchases: daily.purchases,
            purchase_value: daily.purchase_value,
            currency: daily
                .currency
                .unwrap_or_else(|| loaded.account_currency.clone()),
        });

        date = date
            .succ_opt()
            .ok_or_else(|| JobError::Other("attribution window overflows the calendar".into()))?;
    }

    let fetched_ads = raw.len();
    let spend_total = facts.iter().map(|f| f.spend).sum();
    let batch = AdsBatch {
        integration_id: loaded.integration.id,
        account_id: loaded.integration.account_id,
        ad_account: loaded.integration.external_ref.clone(),
        raw,
        facts,
    };
    let outcome = ingest::persist_ads(&ctx.db, &batch, None).await?;

    let stats = AdsRunStats {
        window_start,
        window_end,
        days,
        fetched_ads,
        api_calls,
        retries,
        dates_affected: outcome.dates,
        spend_total,
    };
    serde_json::to_value(&stats).map_err(|err| JobError::Other(err.to_string()))
}

struct Loaded {
    integration: Integration,
    client: ads_client::Client,
    account_currency: String,
}

async fn load(ctx: &Ctx, integration_id: Uuid) -> Result<Loaded, JobError> {
    let integration = integrations::get_by_id(ctx.db.pool(), integration_id)
        .await?
        .ok_or_else(|| JobError::Other(format!("integration {integration_id} not found")))?;

    let access_token = secrets::get(ctx.db.pool(), integration_id, secrets::ADS_ACCESS_TOKEN)
        .await?
        .ok_or_else(|| JobError::Auth("integration has no ads access token".to_string()))?;

    let account_currency = accounts::get_currency(ctx.db.pool(), integration.account_id)
        .await?
        .ok_or_else(|| {
            JobError::Other(format!("account {} not found", integration.account_id))
        })?;

    let base_url = ctx
        .config
        .ads_api_base_url
        .clone()
        .unwrap_or_else(|| ads_client::DEFAULT_BASE_URL.to_string());
    let client = ads_client::Client::new(ads_client::ClientConfig {
        base_url,
        ad_account: integration.external_ref.clone(),
        access_token,
    })?;

    Ok(Loaded {
        integration,
        client,
        account_currency,
    })
}
