//! Novel Engine pipeline worker entry point.
//!
//! Consumes the task queue and periodically re-enqueues stalled tasks and
//! tasks orphaned by dead workers until Ctrl-C.

use std::sync::Arc;

use novel_engine_api::config::Config;
use novel_engine_api::error::AppError;
use novel_engine_api::{step_registry, telemetry};
use novel_engine_core::clock::{Clock, SystemClock};
use novel_engine_core::repository::{SceneCatalog, WorkStore};
use novel_engine_pipeline::application::dispatcher::Dispatcher;
use novel_engine_pipeline::application::reconciler::Reconciler;
use novel_engine_pipeline::application::worker::Worker;
use novel_engine_store::pg_task_queue::PgTaskQueue;
use novel_engine_store::pg_work_store::PgWorkStore;
use sqlx::postgres::PgPoolOptions;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let guard = telemetry::init("novel-engine-worker")?;
    let result = work().await;
    if let Err(err) = &result {
        tracing::error!(error = %err, "worker exited with an error");
    }
    guard.shutdown();
    result
}

async fn work() -> Result<(), AppError> {
    tracing::info!("Starting Novel Engine worker");
    let config = Config::from_env()?;

    let pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect(&config.database_url)
        .await?;
    novel_engine_store::schema::migrate(&pool).await?;

    let records = Arc::new(PgWorkStore::new(pool.clone()));
    let catalog: Arc<dyn SceneCatalog> = records.clone();
    let store: Arc<dyn WorkStore> = records;
    let queue = Arc::new(PgTaskQueue::new(pool, config.retry_policy()));
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let dispatcher = Dispatcher::new(
        Arc::clone(&store),
        queue.clone(),
        step_registry(&catalog, &store),
        Arc::clone(&clock),
        config.job_timeout,
    );
    let worker = Worker::new(queue.clone(), Arc::new(dispatcher), config.worker_config());
    let reconciler = Reconciler::new(
        store,
        queue,
        clock,
        config.reconcile_stall_after,
        config.job_timeout,
    )
    .with_claim_limit(config.retry_policy().max_deliveries);

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("shutdown requested"),
            Err(err) => {
                tracing::error!(error = %err, "failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
        }
        let _ = stop_tx.send(true);
    });

    tokio::join!(
        worker.run(stopped(stop_rx.clone())),
        reconciler.run(config.reconcile_interval, stopped(stop_rx)),
    );

    tracing::info!("worker stopped");
    Ok(())
}

/// Resolves once the shutdown flag is raised.
async fn stopped(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}
