//! The ingest worker: job dispatch and the per-source sync handlers.
//!
//! The dispatcher claims queued sync runs from the warehouse queue, resolves
//! a handler from the run's job type, drives it to completion in an isolated
//! task, and records the terminal state. Handlers are idempotent: re-running
//! the same (integration, job type, window) converges to the same warehouse
//! state, which is what makes at-least-once delivery across worker replicas
//! safe.

use std::sync::Arc;

use tally_config::Config;
use warehouse_db::WarehouseDb;

pub mod dispatcher;
mod error;
pub mod handlers;
#[cfg(test)]
mod test_util;

pub use self::error::JobError;

/// Shared dependencies handed to the dispatcher and handlers.
#[derive(Clone)]
pub struct Ctx {
    pub db: WarehouseDb,
    pub config: Arc<Config>,
}
