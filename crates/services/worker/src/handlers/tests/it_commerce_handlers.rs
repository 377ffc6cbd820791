//! In-tree integration tests for the commerce handlers, driving a mock
//! commerce API against a temp warehouse.

use chrono::NaiveDate;
use mockito::{Matcher, Server};
use rust_decimal::Decimal;
use serde_json::json;
use warehouse_db::{
    cursors::{self, LAST_SYNCED_ORDER_UPDATED_AT},
    integrations::{IntegrationKind, secrets},
    sync_runs::JobType,
    test_support::TestWarehouse,
};

use crate::{
    handlers::commerce,
    test_util::{ctx_for, enqueue_and_claim, test_config},
};

fn order_node(
    id: &str,
    name: &str,
    created_at: &str,
    updated_at: &str,
    total: &str,
    refunds: &str,
    financial: Option<&str>,
    fulfillment: Option<&str>,
) -> serde_json::Value {
    json!({
        "id": id,
        "name": name,
        "orderNumber": null,
        "createdAt": created_at,
        "updatedAt": updated_at,
        "currencyCode": "AUD",
        "totalPriceSet": { "shopMoney": { "amount": total } },
        "currentTotalPriceSet": { "shopMoney": { "amount": total } },
        "totalRefundedSet": { "shopMoney": { "amount": refunds } },
        "displayFinancialStatus": financial,
        "displayFulfillmentStatus": fulfillment
    })
}

fn single_page(nodes: Vec<serde_json::Value>) -> String {
    json!({
        "data": {
            "orders": {
                "pageInfo": { "hasNextPage": false, "endCursor": null },
                "edges": nodes.into_iter().map(|node| json!({ "node": node })).collect::<Vec<_>>()
            }
        }
    })
    .to_string()
}

/// The two orders of the empty-cursor fresh scenario.
fn scenario_orders() -> Vec<serde_json::Value> {
    vec![
        order_node(
            "gid://commerce/Order/1",
            "#1001",
            "2026-01-20T10:00:00Z",
            "2026-01-21T09:00:00Z",
            "150.00",
            "0.00",
            Some("paid"),
            Some("fulfilled"),
        ),
        order_node(
            "gid://commerce/Order/2",
            "#1002",
            "2026-01-22T08:00:00Z",
            "2026-01-22T08:00:00Z",
            "80.00",
            "10.00",
            Some("refunded"),
            None,
        ),
    ]
}

async fn fact_rows(wh: &TestWarehouse) -> Vec<(String, Decimal, Decimal, Option<String>, NaiveDate)> {
    sqlx::query_as(
        "SELECT order_name, gross, net, status, order_date FROM fact_orders ORDER BY order_name",
    )
    .fetch_all(wh.db.pool())
    .await
    .expect("failed to fetch fact rows")
}

#[tokio::test]
async fn fresh_with_an_empty_cursor_lands_orders_and_sets_the_watermark() {
    //* Given
    let wh = TestWarehouse::new().await;
    let mut server = Server::new_async().await;
    let integration_id = wh
        .add_integration(IntegrationKind::Commerce, &server.url())
        .await;
    wh.add_secret(integration_id, secrets::COMMERCE_OFFLINE_TOKEN, "token").await;
    server
        .mock("POST", "/admin/api/2025-01/graphql.json")
        .match_header("x-commerce-access-token", "token")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(single_page(scenario_orders()))
        .expect(1)
        .create_async()
        .await;

    let ctx = ctx_for(&wh, test_config(&server.url()));
    let run = enqueue_and_claim(&wh, integration_id, JobType::CommerceFresh).await;

    //* When
    let stats = commerce::fresh(&ctx, &run).await.expect("handler failed");

    //* Then
    assert_eq!(stats["fetched_orders"], 2);
    assert_eq!(stats["persisted_orders"], 2);
    assert_eq!(stats["cursor_previous"], serde_json::Value::Null);
    assert_eq!(stats["cursor_next"], "2026-01-22T08:00:00Z");
    assert_eq!(stats["cursor_advanced"], true);

    let facts = fact_rows(&wh).await;
    assert_eq!(facts.len(), 2);
    let (name, gross, net, status, date) = facts[0].clone();
    assert_eq!(name, "#1001");
    assert_eq!(gross, "150.00".parse().unwrap());
    assert_eq!(net, "150.00".parse().unwrap());
    assert_eq!(status.as_deref(), Some("paid / fulfilled"));
    assert_eq!(date, "2026-01-20".parse::<NaiveDate>().unwrap());
    let (name, _, net, status, date) = facts[1].clone();
    assert_eq!(name, "#1002");
    assert_eq!(net, "70.00".parse().unwrap());
    assert_eq!(status.as_deref(), Some("refunded"));
    assert_eq!(date, "2026-01-22".parse::<NaiveDate>().unwrap());

    let daily: Vec<(NaiveDate, i64, Decimal)> = sqlx::query_as(
        "SELECT date, orders, revenue_net FROM commerce_daily_metrics ORDER BY date",
    )
    .fetch_all(wh.db.pool())
    .await
    .expect("failed to fetch daily metrics");
    assert_eq!(
        daily,
        vec![
            ("2026-01-20".parse().unwrap(), 1, "150".parse().unwrap()),
            ("2026-01-22".parse().unwrap(), 1, "70".parse().unwrap()),
        ]
    );

    let cursor = cursors::get(
        wh.db.pool(),
        integration_id,
        &JobType::CommerceFresh,
        LAST_SYNCED_ORDER_UPDATED_AT,
    )
    .await
    .expect("cursor read failed");
    assert_eq!(cursor.as_deref(), Some("2026-01-22T08:00:00Z"));
}

#[tokio::test]
async fn fresh_with_nothing_new_neither_writes_nor_advances() {
    //* Given
    let wh = TestWarehouse::new().await;
    let mut server = Server::new_async().await;
    let integration_id = wh
        .add_integration(IntegrationKind::Commerce, &server.url())
        .await;
    wh.add_secret(integration_id, secrets::COMMERCE_OFFLINE_TOKEN, "token").await;
    cursors::advance(
        wh.db.pool(),
        integration_id,
        &JobType::CommerceFresh,
        LAST_SYNCED_ORDER_UPDATED_AT,
        "2026-01-22T08:00:00Z",
    )
    .await
    .expect("failed to seed cursor");

    // the fetch must filter from the stored watermark
    server
        .mock("POST", "/admin/api/2025-01/graphql.json")
        .match_body(Matcher::PartialJson(json!({
            "variables": { "query": "updated_at:>='2026-01-22T08:00:00Z'" }
        })))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(single_page(vec![]))
        .expect(1)
        .create_async()
        .await;

    let ctx = ctx_for(&wh, test_config(&server.url()));
    let run = enqueue_and_claim(&wh, integration_id, JobType::CommerceFresh).await;

    //* When
    let stats = commerce::fresh(&ctx, &run).await.expect("handler failed");

    //* Then
    assert_eq!(stats["fetched_orders"], 0);
    assert_eq!(stats["cursor_advanced"], false);
    assert_eq!(stats["cursor_previous"], "2026-01-22T08:00:00Z");
    assert_eq!(stats["cursor_next"], "2026-01-22T08:00:00Z");

    let fact_count: i64 = sqlx::query_scalar("SELECT count(*) FROM fact_orders")
        .fetch_one(wh.db.pool())
        .await
        .expect("count failed");
    assert_eq!(fact_count, 0);
}

#[tokio::test]
async fn window_fill_initialises_a_missing_cursor() {
    //* Given
    let wh = TestWarehouse::new().await;
    let mut server = Server::new_async().await;
    let integration_id = wh
        .add_integration(IntegrationKind::Commerce, &server.url())
        .await;
    wh.add_secret(integration_id, secrets::COMMERCE_OFFLINE_TOKEN, "token").await;
    server
        .mock("POST", "/admin/api/2025-01/graphql.json")
        .match_body(Matcher::PartialJson(json!({
            "variables": { "first": 100 }
        })))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(single_page(scenario_orders()))
        .expect(1)
        .create_async()
        .await;

    let ctx = ctx_for(&wh, test_config(&server.url()));
    let run = enqueue_and_claim(&wh, integration_id, JobType::CommerceWindowFill).await;

    //* When
    let stats = commerce::window_fill(&ctx, &run).await.expect("handler failed");

    //* Then
    assert_eq!(stats["cursor_initialized"], true);
    let cursor = cursors::get(
        wh.db.pool(),
        integration_id,
        &JobType::CommerceFresh,
        LAST_SYNCED_ORDER_UPDATED_AT,
    )
    .await
    .expect("cursor read failed");
    assert_eq!(cursor.as_deref(), Some("2026-01-22T08:00:00Z"));
}

#[tokio::test]
async fn window_fill_leaves_an_existing_cursor_untouched() {
    //* Given
    let wh = TestWarehouse::new().await;
    let mut server = Server::new_async().await;
    let integration_id = wh
        .add_integration(IntegrationKind::Commerce, &server.url())
        .await;
    wh.add_secret(integration_id, secrets::COMMERCE_OFFLINE_TOKEN, "token").await;
    cursors::advance(
        wh.db.pool(),
        integration_id,
        &JobType::CommerceFresh,
        LAST_SYNCED_ORDER_UPDATED_AT,
        "2026-01-10T00:00:00Z",
    )
    .await
    .expect("failed to seed cursor");
    server
        .mock("POST", "/admin/api/2025-01/graphql.json")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(single_page(scenario_orders()))
        .expect(1)
        .create_async()
        .await;

    let ctx = ctx_for(&wh, test_config(&server.url()));
    let run = enqueue_and_claim(&wh, integration_id, JobType::CommerceWindowFill).await;

    //* When
    let stats = commerce::window_fill(&ctx, &run).await.expect("handler failed");

    //* Then: initialised-only-if-missing
    assert_eq!(stats["cursor_initialized"], false);
    let cursor = cursors::get(
        wh.db.pool(),
        integration_id,
        &JobType::CommerceFresh,
        LAST_SYNCED_ORDER_UPDATED_AT,
    )
    .await
    .expect("cursor read failed");
    assert_eq!(cursor.as_deref(), Some("2026-01-10T00:00:00Z"));

    // dates rebuilt are exactly the distinct order dates in the window
    let dates = stats["dates_affected"]
        .as_array()
        .expect("dates_affected missing")
        .iter()
        .map(|d| d.as_str().unwrap().to_string())
        .collect::<Vec<_>>();
    assert_eq!(dates, vec!["2026-01-20", "2026-01-22"]);
}

#[tokio::test]
async fn a_missing_offline_token_is_an_auth_error() {
    //* Given
    let wh = TestWarehouse::new().await;
    let server = Server::new_async().await;
    let integration_id = wh
        .add_integration(IntegrationKind::Commerce, &server.url())
        .await;

    let ctx = ctx_for(&wh, test_config(&server.url()));
    let run = enqueue_and_claim(&wh, integration_id, JobType::CommerceFresh).await;

    //* When
    let err = commerce::fresh(&ctx, &run).await.expect_err("expected failure");

    //* Then
    assert_eq!(err.code(), "auth_error");
}
