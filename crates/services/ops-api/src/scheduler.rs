//! Scheduler endpoints, invoked by an external cron.
//!
//! Each hit runs a single dedup-insert statement: one `fresh` run per
//! healthy integration of the source kind, unless one was already enqueued
//! within the configured interval. Safe to call arbitrarily often.

use axum::{
    Json,
    extract::State,
    http::{HeaderMap, StatusCode, header},
};
use serde::Serialize;
use warehouse_db::{
    integrations::IntegrationKind,
    sync_runs::{self, JobType},
};

use crate::{
    Ctx,
    error::{Error, ErrorResponse},
};

const CRON_SECRET_HEADER: &str = "x-cron-secret";

/// `GET|POST /internal/schedule/commerce`
pub async fn commerce(
    State(ctx): State<Ctx>,
    headers: HeaderMap,
) -> Result<(StatusCode, Json<ScheduleResponse>), ErrorResponse> {
    schedule(&ctx, &headers, IntegrationKind::Commerce).await
}

/// `GET|POST /internal/schedule/ads`
pub async fn ads(
    State(ctx): State<Ctx>,
    headers: HeaderMap,
) -> Result<(StatusCode, Json<ScheduleResponse>), ErrorResponse> {
    schedule(&ctx, &headers, IntegrationKind::Ads).await
}

/// Response body of the scheduler endpoints.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleResponse {
    pub inserted: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval_minutes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<&'static str>,
}

async fn schedule(
    ctx: &Ctx,
    headers: &HeaderMap,
    kind: IntegrationKind,
) -> Result<(StatusCode, Json<ScheduleResponse>), ErrorResponse> {
    authorize(ctx, headers)?;

    if kind == IntegrationKind::Ads && !ctx.config.ads_jobs_enabled {
        return Ok((
            StatusCode::ACCEPTED,
            Json(ScheduleResponse {
                inserted: 0,
                job_type: None,
                interval_minutes: None,
                message: Some("disabled"),
            }),
        ));
    }

    let interval_minutes = match kind {
        IntegrationKind::Commerce => ctx.config.commerce_fresh_sched_minutes,
        IntegrationKind::Ads => ctx.config.ads_fresh_sched_minutes,
    };

    let inserted = sync_runs::schedule_fresh(ctx.db.pool(), kind, interval_minutes as i32)
        .await
        .map_err(Error::Schedule)?;

    tracing::info!(
        kind = %kind,
        inserted,
        interval_minutes,
        "scheduler tick processed"
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(ScheduleResponse {
            inserted,
            job_type: Some(JobType::fresh_for(kind).to_string()),
            interval_minutes: Some(interval_minutes),
            message: None,
        }),
    ))
}

/// Check the shared secret, if one is configured. Accepts either the
/// `X-Cron-Secret` header or a bearer token; with no secret configured the
/// endpoint is open (trusted-network deployments).
fn authorize(ctx: &Ctx, headers: &HeaderMap) -> Result<(), Error> {
    let Some(secret) = &ctx.config.cron_secret else {
        return Ok(());
    };

    let presented = headers
        .get(CRON_SECRET_HEADER)
        .and_then(|value| value.to_str().ok())
        .or_else(|| {
            headers
                .get(header::AUTHORIZATION)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.strip_prefix("Bearer "))
        });

    if presented == Some(secret.as_ref().as_str()) {
        Ok(())
    } else {
        Err(Error::Unauthorized)
    }
}
