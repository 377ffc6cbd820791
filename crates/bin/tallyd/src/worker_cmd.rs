//! The `worker` subcommand: operational listener, database probe, dispatch
//! loop.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use tally_config::Config;
use tokio::{net::TcpListener, sync::watch};
use warehouse_db::WarehouseDb;

use crate::Error;

/// Pause before restarting the dispatch loop after a panic.
const RESTART_PAUSE: Duration = Duration::from_secs(5);

pub async fn run(config: Config) -> Result<(), Error> {
    let config = Arc::new(config);

    // Bind the operational listener before touching the database, so
    // liveness is observable throughout startup.
    let readiness = ops_api::Readiness::new();
    let addr = SocketAddr::from(([0, 0, 0, 0], config.health_port));
    let listener = TcpListener::bind(addr).await.map_err(Error::Bind)?;
    tracing::info!(%addr, "operational endpoint listening");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("shutdown signal received, draining the in-flight run");
        let _ = shutdown_tx.send(true);
    });

    // Fatal if the database stays unreachable beyond the retry window.
    let db = WarehouseDb::connect_with_retry(&config.database_url, config.db_pool_size)
        .await
        .map_err(Error::Db)?;
    db.probe().await.map_err(Error::Db)?;
    readiness.mark_ready();
    tracing::info!("warehouse reachable");

    let server = tokio::spawn(ops_api::serve(
        listener,
        ops_api::Ctx {
            db: db.clone(),
            config: config.clone(),
            readiness,
        },
        shutdown_rx.clone(),
    ));

    let ctx = worker::Ctx {
        db,
        config: config.clone(),
    };

    // Supervise the dispatch loop: per-run errors never reach this level,
    // but a panic in the loop itself logs and restarts after a pause.
    loop {
        let handle = tokio::spawn(worker::dispatcher::run(ctx.clone(), shutdown_rx.clone()));
        match handle.await {
            Ok(()) => break,
            Err(err) => {
                tracing::error!(
                    error = %err,
                    "dispatcher crashed, restarting in {}s",
                    RESTART_PAUSE.as_secs()
                );
                if *shutdown_rx.borrow() {
                    break;
                }
                tokio::time::sleep(RESTART_PAUSE).await;
            }
        }
    }

    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => tracing::warn!(error = %err, "operational server exited with an error"),
        Err(err) => tracing::warn!(error = %err, "operational server task did not exit cleanly"),
    }
    tracing::info!("worker drained, exiting");
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "SIGTERM handler unavailable, watching ctrl-c only");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
