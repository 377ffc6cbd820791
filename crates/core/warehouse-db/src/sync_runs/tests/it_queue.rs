//! In-tree DB integration tests for the sync-run queue

use uuid::Uuid;

use crate::{
    integrations::IntegrationKind,
    sync_runs::{self, JobType, MAX_ERROR_MESSAGE_CHARS, RunStatus, Trigger},
    test_support::TestWarehouse,
};

async fn backdate_created_at(wh: &TestWarehouse, run_id: Uuid, hours: i32) {
    sqlx::query("UPDATE sync_runs SET created_at = now() - make_interval(hours => $2) WHERE id = $1")
        .bind(run_id)
        .bind(hours)
        .execute(wh.db.pool())
        .await
        .expect("failed to backdate run");
}

#[tokio::test]
async fn claim_moves_the_run_to_running_and_clears_stale_error_fields() {
    //* Given
    let wh = TestWarehouse::new().await;
    let integration_id = wh.add_integration(IntegrationKind::Commerce, "shop.example").await;
    let run_id = sync_runs::enqueue(
        wh.db.pool(),
        integration_id,
        &JobType::CommerceFresh,
        Trigger::Auto,
    )
    .await
    .expect("failed to enqueue");
    sqlx::query("UPDATE sync_runs SET error_code = 'worker_error', error_message = 'stale' WHERE id = $1")
        .bind(run_id)
        .execute(wh.db.pool())
        .await
        .expect("failed to seed stale error fields");

    //* When
    let claimed = sync_runs::claim_next(&wh.db)
        .await
        .expect("claim failed")
        .expect("expected a run");

    //* Then
    assert_eq!(claimed.id, run_id);
    assert_eq!(claimed.status, RunStatus::Running);
    assert!(claimed.started_at.is_some());
    assert_eq!(claimed.error_code, None);
    assert_eq!(claimed.error_message, None);

    let row = sync_runs::get_by_id(wh.db.pool(), run_id)
        .await
        .expect("get failed")
        .expect("run not found");
    assert_eq!(row.status, RunStatus::Running);
    assert_eq!(row.error_code, None);
}

#[tokio::test]
async fn claim_returns_none_on_an_empty_queue() {
    //* Given
    let wh = TestWarehouse::new().await;

    //* When
    let claimed = sync_runs::claim_next(&wh.db).await.expect("claim failed");

    //* Then
    assert!(claimed.is_none());
}

#[tokio::test]
async fn claim_prefers_the_oldest_queued_run() {
    //* Given
    let wh = TestWarehouse::new().await;
    let integration_id = wh.add_integration(IntegrationKind::Commerce, "shop.example").await;
    let newer = sync_runs::enqueue(
        wh.db.pool(),
        integration_id,
        &JobType::CommerceFresh,
        Trigger::Auto,
    )
    .await
    .expect("failed to enqueue newer");
    let older = sync_runs::enqueue(
        wh.db.pool(),
        integration_id,
        &JobType::CommerceWindowFill,
        Trigger::User,
    )
    .await
    .expect("failed to enqueue older");
    backdate_created_at(&wh, older, 2).await;

    //* When
    let first = sync_runs::claim_next(&wh.db)
        .await
        .expect("claim failed")
        .expect("expected a run");

    //* Then
    assert_eq!(first.id, older);
    assert_ne!(first.id, newer);
}

#[tokio::test]
async fn exactly_one_of_two_concurrent_claims_wins() {
    //* Given
    let wh = TestWarehouse::new().await;
    let integration_id = wh.add_integration(IntegrationKind::Commerce, "shop.example").await;
    sync_runs::enqueue(
        wh.db.pool(),
        integration_id,
        &JobType::CommerceFresh,
        Trigger::Auto,
    )
    .await
    .expect("failed to enqueue");

    //* When
    let (a, b) = tokio::join!(sync_runs::claim_next(&wh.db), sync_runs::claim_next(&wh.db));
    let a = a.expect("claim a failed");
    let b = b.expect("claim b failed");

    //* Then
    assert!(
        a.is_some() != b.is_some(),
        "expected exactly one winner, got a={:?} b={:?}",
        a.map(|r| r.id),
        b.map(|r| r.id)
    );
}

#[tokio::test]
async fn rate_limited_runs_stay_parked_until_their_reset_passes() {
    //* Given
    let wh = TestWarehouse::new().await;
    let integration_id = wh.add_integration(IntegrationKind::Ads, "act_1").await;
    let run_id = sync_runs::enqueue(
        wh.db.pool(),
        integration_id,
        &JobType::AdsFresh,
        Trigger::Auto,
    )
    .await
    .expect("failed to enqueue");
    sqlx::query(
        "UPDATE sync_runs SET rate_limited = true, rate_limit_reset_at = now() + interval '5 minutes' WHERE id = $1",
    )
    .bind(run_id)
    .execute(wh.db.pool())
    .await
    .expect("failed to park run");

    //* When / Then: parked
    let claimed = sync_runs::claim_next(&wh.db).await.expect("claim failed");
    assert!(claimed.is_none(), "parked run must not be claimable");

    //* When / Then: reset passed
    sqlx::query("UPDATE sync_runs SET rate_limit_reset_at = now() - interval '1 second' WHERE id = $1")
        .bind(run_id)
        .execute(wh.db.pool())
        .await
        .expect("failed to expire reset");
    let claimed = sync_runs::claim_next(&wh.db)
        .await
        .expect("claim failed")
        .expect("run should be claimable after reset");
    assert_eq!(claimed.id, run_id);
}

#[tokio::test]
async fn mark_error_truncates_the_message_and_records_the_rate_limit() {
    //* Given
    let wh = TestWarehouse::new().await;
    let integration_id = wh.add_integration(IntegrationKind::Ads, "act_1").await;
    let run_id = sync_runs::enqueue(
        wh.db.pool(),
        integration_id,
        &JobType::AdsFresh,
        Trigger::Auto,
    )
    .await
    .expect("failed to enqueue");
    sync_runs::claim_next(&wh.db).await.expect("claim failed");

    let long_message = "insights call failed: ".repeat(200);
    let reset_at = chrono::Utc::now() + chrono::Duration::minutes(5);

    //* When
    sync_runs::mark_error(wh.db.pool(), run_id, "rate_limited", &long_message, Some(reset_at))
        .await
        .expect("mark_error failed");

    //* Then
    let row = sync_runs::get_by_id(wh.db.pool(), run_id)
        .await
        .expect("get failed")
        .expect("run not found");
    assert_eq!(row.status, RunStatus::Error);
    assert_eq!(row.error_code.as_deref(), Some("rate_limited"));
    let stored = row.error_message.expect("message missing");
    assert!(stored.chars().count() <= MAX_ERROR_MESSAGE_CHARS);
    assert!(stored.ends_with("[truncated]"));
    assert!(row.rate_limited);
    assert!(row.rate_limit_reset_at.is_some());
    assert!(row.finished_at.is_some());
}

#[tokio::test]
async fn schedule_fresh_inserts_once_per_healthy_integration_then_dedups() {
    //* Given
    let wh = TestWarehouse::new().await;
    wh.add_integration(IntegrationKind::Commerce, "shop-a.example").await;
    let broken = wh.add_integration(IntegrationKind::Commerce, "shop-b.example").await;
    sqlx::query("UPDATE integrations SET status = 'disconnected' WHERE id = $1")
        .bind(broken)
        .execute(wh.db.pool())
        .await
        .expect("failed to disconnect integration");
    // an ads integration must not receive commerce jobs
    wh.add_integration(IntegrationKind::Ads, "act_1").await;

    //* When
    let first = sync_runs::schedule_fresh(wh.db.pool(), IntegrationKind::Commerce, 60)
        .await
        .expect("first schedule failed");
    let second = sync_runs::schedule_fresh(wh.db.pool(), IntegrationKind::Commerce, 60)
        .await
        .expect("second schedule failed");

    //* Then
    assert_eq!(first, 1);
    assert_eq!(second, 0);
}

#[tokio::test]
async fn schedule_fresh_skips_integrations_parked_by_a_rate_limit() {
    //* Given
    let wh = TestWarehouse::new().await;
    let integration_id = wh.add_integration(IntegrationKind::Ads, "act_1").await;
    let run_id = sync_runs::enqueue(
        wh.db.pool(),
        integration_id,
        &JobType::AdsFresh,
        Trigger::Auto,
    )
    .await
    .expect("failed to enqueue");
    sync_runs::claim_next(&wh.db).await.expect("claim failed");
    let reset_at = chrono::Utc::now() + chrono::Duration::minutes(5);
    sync_runs::mark_error(wh.db.pool(), run_id, "rate_limited", "429", Some(reset_at))
        .await
        .expect("mark_error failed");

    //* When
    let inserted = sync_runs::schedule_fresh(wh.db.pool(), IntegrationKind::Ads, 60)
        .await
        .expect("schedule failed");

    //* Then
    assert_eq!(inserted, 0, "rate-limited integration must stay parked");

    //* When the reset passes
    sqlx::query("UPDATE sync_runs SET rate_limit_reset_at = now() - interval '1 second' WHERE id = $1")
        .bind(run_id)
        .execute(wh.db.pool())
        .await
        .expect("failed to expire reset");
    let inserted = sync_runs::schedule_fresh(wh.db.pool(), IntegrationKind::Ads, 60)
        .await
        .expect("schedule failed");

    //* Then
    assert_eq!(inserted, 1);
}

#[tokio::test]
async fn sweep_marks_stale_running_runs_abandoned_without_blocking_new_work() {
    //* Given
    let wh = TestWarehouse::new().await;
    let integration_id = wh.add_integration(IntegrationKind::Commerce, "shop.example").await;
    let run_id = sync_runs::enqueue(
        wh.db.pool(),
        integration_id,
        &JobType::CommerceFresh,
        Trigger::Auto,
    )
    .await
    .expect("failed to enqueue");
    sync_runs::claim_next(&wh.db).await.expect("claim failed");
    sqlx::query("UPDATE sync_runs SET started_at = now() - interval '45 minutes' WHERE id = $1")
        .bind(run_id)
        .execute(wh.db.pool())
        .await
        .expect("failed to backdate started_at");

    //* When
    let swept = sync_runs::sweep_abandoned(wh.db.pool(), 30)
        .await
        .expect("sweep failed");

    //* Then
    assert_eq!(swept, 1);
    let row = sync_runs::get_by_id(wh.db.pool(), run_id)
        .await
        .expect("get failed")
        .expect("run not found");
    assert_eq!(row.status, RunStatus::Error);
    assert_eq!(row.error_code.as_deref(), Some("abandoned"));

    // a fresh run enqueued afterwards proceeds normally
    let next_id = sync_runs::enqueue(
        wh.db.pool(),
        integration_id,
        &JobType::CommerceFresh,
        Trigger::Auto,
    )
    .await
    .expect("failed to enqueue follow-up");
    let claimed = sync_runs::claim_next(&wh.db)
        .await
        .expect("claim failed")
        .expect("follow-up should be claimable");
    assert_eq!(claimed.id, next_id);
}

#[tokio::test]
async fn rows_with_an_unrecognised_job_type_decode_to_the_fallback() {
    //* Given
    let wh = TestWarehouse::new().await;
    let integration_id = wh.add_integration(IntegrationKind::Commerce, "shop.example").await;
    sqlx::query(
        "INSERT INTO sync_runs (integration_id, job_type, status, trigger) \
         VALUES ($1, 'commerce_bulk_export', 'queued', 'system')",
    )
    .bind(integration_id)
    .execute(wh.db.pool())
    .await
    .expect("failed to insert legacy row");

    //* When
    let claimed = sync_runs::claim_next(&wh.db)
        .await
        .expect("claim failed")
        .expect("expected a run");

    //* Then
    assert_eq!(
        claimed.job_type,
        JobType::Unknown("commerce_bulk_export".to_string())
    );
}
