use anyhow::Context;
use tokio::sync::watch;
use tracing::info;

use statcrunch_infra::jobs::RetryPolicy;
use statcrunch_infra::{CrunchConfig, Cruncher, PgJobQueue, PgStatsStore, WorkerRunner};

/// Jobs claimed per poll. The cruncher holds one transaction at a time.
const BATCH_LIMIT: usize = 1;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    statcrunch_observability::init();

    let config = CrunchConfig::from_env().context("invalid configuration")?;
    info!(
        queue_db = ?config.queue_db,
        dest_db = ?config.dest_db,
        job_type = %config.worker.job_type,
        "starting statcrunch"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let signal = shutdown_signal().context("failed to install signal handlers")?;
    tokio::spawn(async move {
        signal.await;
        info!("draining in-flight job before exit");
        let _ = shutdown_tx.send(true);
    });

    let queue = PgJobQueue::connect(
        &config.queue_db,
        RetryPolicy::with_max_attempts(config.worker.max_attempts),
    )
    .await
    .context("failed to connect to queue database")?
    .with_lease(config.worker.lease);
    let store = PgStatsStore::connect(&config.dest_db)
        .await
        .context("failed to connect to analytics database")?;

    if config.worker.ensure_schema {
        queue
            .ensure_schema()
            .await
            .context("failed to apply queue schema")?;
        store
            .ensure_schema()
            .await
            .context("failed to apply analytics schema")?;
    }

    let cruncher = Cruncher::new(store).with_job_type(config.worker.job_type.clone());
    let stats = WorkerRunner::connect(queue, cruncher, config.worker.poll_interval)
        .start(BATCH_LIMIT, shutdown_rx)
        .await;

    info!(?stats, "statcrunch stopped");
    Ok(())
}

/// Resolves on the first SIGINT or SIGTERM.
///
/// Handlers are installed before this returns, so signals arriving while the
/// connections are still being set up are not lost.
#[cfg(unix)]
fn shutdown_signal() -> anyhow::Result<impl std::future::Future<Output = ()>> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    Ok(async move {
        tokio::select! {
            _ = sigint.recv() => info!(signal = "SIGINT", "shutdown signal"),
            _ = sigterm.recv() => info!(signal = "SIGTERM", "shutdown signal"),
        }
    })
}

#[cfg(not(unix))]
fn shutdown_signal() -> anyhow::Result<impl std::future::Future<Output = ()>> {
    Ok(async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("shutdown signal"),
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
        }
    })
}
