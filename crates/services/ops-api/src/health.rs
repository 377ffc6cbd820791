//! Liveness handler.

use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use chrono::Utc;
use serde_json::json;

use crate::Ctx;

/// `GET /` and `GET /health`.
///
/// 200 once the warehouse has answered one probe since process start, 503
/// before that. The payload always carries the uptime and current time.
pub async fn handler(State(ctx): State<Ctx>) -> impl IntoResponse {
    let body = |status: &str| {
        Json(json!({
            "status": status,
            "uptime_secs": ctx.readiness.uptime_secs(),
            "now": Utc::now(),
        }))
    };

    if ctx.readiness.is_ready() {
        (StatusCode::OK, body("ok"))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, body("starting"))
    }
}
