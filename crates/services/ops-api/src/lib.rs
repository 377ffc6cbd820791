//! Operational HTTP surface: liveness and the cron-driven scheduler
//! endpoints.
//!
//! The listener binds before the database is verified, so liveness is
//! observable throughout startup; the health handler reports 503 until the
//! entrypoint's first successful probe flips the readiness latch.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Instant,
};

use axum::{Router, routing::get};
use tally_config::Config;
use tokio::{net::TcpListener, sync::watch};
use warehouse_db::WarehouseDb;

mod error;
mod health;
mod scheduler;

pub use self::error::ErrorResponse;

/// Shared state for the operational endpoints.
#[derive(Clone)]
pub struct Ctx {
    pub db: WarehouseDb,
    pub config: Arc<Config>,
    pub readiness: Readiness,
}

/// Process-wide readiness latch: flips once the warehouse has answered one
/// probe since process start, and never flips back.
#[derive(Clone)]
pub struct Readiness {
    ready: Arc<AtomicBool>,
    started_at: Instant,
}

impl Readiness {
    pub fn new() -> Self {
        Self {
            ready: Arc::new(AtomicBool::new(false)),
            started_at: Instant::now(),
        }
    }

    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::Relaxed);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

impl Default for Readiness {
    fn default() -> Self {
        Self::new()
    }
}

/// Build the operational router. Unknown paths fall through to 404.
pub fn router(ctx: Ctx) -> Router {
    Router::new()
        .route("/", get(health::handler))
        .route("/health", get(health::handler))
        .route(
            "/internal/schedule/commerce",
            get(scheduler::commerce).post(scheduler::commerce),
        )
        .route(
            "/internal/schedule/ads",
            get(scheduler::ads).post(scheduler::ads),
        )
        .with_state(ctx)
}

/// Serve the router until the shutdown flag flips.
pub async fn serve(
    listener: TcpListener,
    ctx: Ctx,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), std::io::Error> {
    axum::serve(listener, router(ctx))
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
}

/// In-tree endpoint tests
#[cfg(test)]
mod tests {
    mod it_endpoints;
}
