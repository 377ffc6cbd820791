//! Shared helpers for the in-tree tests.

use std::sync::Arc;

use tally_config::Config;
use uuid::Uuid;
use warehouse_db::{
    SyncRun, Trigger,
    sync_runs::{self, JobType},
    test_support::TestWarehouse,
};

use crate::Ctx;

/// A config with test-friendly values; tweak fields per test as needed.
pub(crate) fn test_config(database_url: &str) -> Config {
    Config {
        database_url: database_url.to_string(),
        poll_interval_ms: 1_000,
        commerce_api_version: "2025-01".to_string(),
        commerce_window_days: 7,
        ads_attribution_window_days: 1,
        commerce_fresh_sched_minutes: 60,
        ads_fresh_sched_minutes: 60,
        cron_secret: None,
        ads_jobs_enabled: true,
        ads_api_base_url: None,
        health_port: 0,
        ipv4_override: None,
        db_pool_size: 5,
    }
}

pub(crate) fn ctx_for(wh: &TestWarehouse, config: Config) -> Ctx {
    Ctx {
        db: wh.db.clone(),
        config: Arc::new(config),
    }
}

/// Enqueue a run and claim it, the way the dispatcher would.
pub(crate) async fn enqueue_and_claim(
    wh: &TestWarehouse,
    integration_id: Uuid,
    job_type: JobType,
) -> SyncRun {
    sync_runs::enqueue(wh.db.pool(), integration_id, &job_type, Trigger::User)
        .await
        .expect("failed to enqueue run");
    sync_runs::claim_next(&wh.db)
        .await
        .expect("claim failed")
        .expect("expected a claimable run")
}
