//! The dispatch loop.
//!
//! Claim one runnable queued run under a skip-locked row lock, drive its
//! handler to completion in a spawned task, record the terminal state,
//! repeat. The loop holds no state between iterations beyond the shared
//! pool, so killing the process mid-run only ever leaves a `running` row
//! behind for the external sweeper.

use backon::{ExponentialBuilder, Retryable};
use sqlx::types::JsonValue;
use tokio::sync::watch;
use warehouse_db::{Error as DbError, JobType, SyncRun, integrations, sync_runs};

use crate::{Ctx, JobError, handlers};

/// Run the dispatch loop until `shutdown` flips.
///
/// The in-flight run always completes before the loop exits; the shutdown
/// flag is only consulted between runs.
pub async fn run(ctx: Ctx, mut shutdown: watch::Receiver<bool>) {
    tracing::info!("dispatcher started");
    loop {
        if *shutdown.borrow() {
            tracing::info!("dispatcher draining: shutdown requested");
            return;
        }

        match run_once(&ctx).await {
            Ok(true) => {
                // Claim again immediately; the queue may hold more work.
            }
            Ok(false) => {
                tokio::select! {
                    _ = tokio::time::sleep(ctx.config.poll_interval()) => {}
                    _ = shutdown.changed() => {}
                }
            }
            Err(err) => {
                tracing::error!(
                    error = %err,
                    "failed to claim from the run queue, backing off one poll interval"
                );
                tokio::time::sleep(ctx.config.poll_interval()).await;
            }
        }
    }
}

/// Claim and execute at most one run. Returns whether a run was processed.
pub async fn run_once(ctx: &Ctx) -> Result<bool, DbError> {
    let Some(run) = claim_with_retry(ctx).await? else {
        return Ok(false);
    };

    tracing::info!(
        run_id = %run.id,
        integration_id = %run.integration_id,
        job_type = %run.job_type,
        trigger = %run.trigger,
        "run claimed"
    );

    let result = drive_handler(ctx, &run).await;
    terminate(ctx, &run, result).await;
    Ok(true)
}

/// Execute the run's handler inside its own task so a panic terminates the
/// run, not the dispatcher.
async fn drive_handler(ctx: &Ctx, run: &SyncRun) -> Result<JsonValue, JobError> {
    let handler_ctx = ctx.clone();
    let handler_run = run.clone();
    let handle = tokio::spawn(async move { dispatch(&handler_ctx, &handler_run).await });

    match handle.await {
        Ok(result) => result,
        Err(err) if err.is_panic() => Err(JobError::Other(format!("handler panicked: {err}"))),
        Err(err) => Err(JobError::Other(format!("handler task failed: {err}"))),
    }
}

/// Resolve the handler for a job type.
///
/// The closed set is matched exhaustively; only rows written by other
/// deployments can land in the `Unknown` arm.
async fn dispatch(ctx: &Ctx, run: &SyncRun) -> Result<JsonValue, JobError> {
    match &run.job_type {
        JobType::CommerceFresh => handlers::commerce::fresh(ctx, run).await,
        JobType::CommerceWindowFill => handlers::commerce::window_fill(ctx, run).await,
        JobType::AdsFresh => handlers::ads::fresh(ctx, run).await,
        JobType::AdsWindowFill => handlers::ads::window_fill(ctx, run).await,
        JobType::Unknown(name) => Err(JobError::UnknownJobType(name.clone())),
    }
}

/// Record the run's terminal state. Bookkeeping failures are retried on
/// connection errors; a run left in `running` is eventually swept as
/// abandoned, so giving up here is safe.
async fn terminate(ctx: &Ctx, run: &SyncRun, result: Result<JsonValue, JobError>) {
    match result {
        Ok(stats) => {
            tracing::info!(run_id = %run.id, job_type = %run.job_type, "run succeeded");
            let outcome = (|| async {
                sync_runs::mark_success(ctx.db.pool(), run.id, &stats)
                    .await
                    .map_err(DbError::from)
            })
            .retry(ExponentialBuilder::default())
            .when(DbError::is_connection_error)
            .notify(|err, dur| {
                tracing::warn!(
                    run_id = %run.id,
                    error = %err,
                    "connection error recording success, retrying in {:.1}s",
                    dur.as_secs_f32()
                );
            })
            .await;
            if let Err(err) = outcome {
                tracing::error!(run_id = %run.id, error = %err, "failed to record run success");
            }
        }
        Err(job_err) => {
            tracing::error!(
                run_id = %run.id,
                job_type = %run.job_type,
                error_code = job_err.code(),
                error = %job_err,
                "run failed"
            );

            if job_err.is_auth() {
                if let Err(err) = integrations::mark_error(ctx.db.pool(), run.integration_id).await
                {
                    tracing::error!(
                        integration_id = %run.integration_id,
                        error = %err,
                        "failed to flip integration to error after auth failure"
                    );
                }
            }

            let reset_at = job_err.rate_limit_reset_at();
            let message = job_err.to_string();
            let code = job_err.code();
            let outcome = (|| async {
                sync_runs::mark_error(ctx.db.pool(), run.id, code, &message, reset_at)
                    .await
                    .map_err(DbError::from)
            })
            .retry(ExponentialBuilder::default())
            .when(DbError::is_connection_error)
            .notify(|err, dur| {
                tracing::warn!(
                    run_id = %run.id,
                    error = %err,
                    "connection error recording failure, retrying in {:.1}s",
                    dur.as_secs_f32()
                );
            })
            .await;
            if let Err(err) = outcome {
                tracing::error!(run_id = %run.id, error = %err, "failed to record run failure");
            }
        }
    }
}

async fn claim_with_retry(ctx: &Ctx) -> Result<Option<SyncRun>, DbError> {
    (|| sync_runs::claim_next(&ctx.db))
        .retry(ExponentialBuilder::default())
        .when(DbError::is_connection_error)
        .notify(|err, dur| {
            tracing::warn!(
                error = %err,
                "connection error claiming a run, retrying in {:.1}s",
                dur.as_secs_f32()
            );
        })
        .await
}
