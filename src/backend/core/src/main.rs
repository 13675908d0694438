//! Autoresolve worker - runs deferred alert group evaluations.

use std::sync::Arc;

use autoresolve_core::{
    alerts::{
        CoalescingScheduler, EvaluationHandler, GroupStore, InMemoryGroupStore,
        PayloadConditionPredicate, PgGroupStore,
    },
    config::{Config, QueueBackendKind, StoreBackendKind},
    jobs::{InMemoryQueueBackend, JobQueue, JobWorker, QueueBackend, QueueConfig, RedisQueueBackend},
    telemetry::init_telemetry,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Without a file or AUTORESOLVE__* variables this is the defaults; a bad
    // source stops the worker.
    let config_path = std::env::var("AUTORESOLVE_CONFIG").ok();
    let config = Config::load_from(config_path.as_deref())?;

    let telemetry = init_telemetry(&config.telemetry.to_telemetry_config("autoresolve-worker"))?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        debounce_ms = config.engine.debounce.as_millis() as u64,
        max_group_size = config.engine.max_group_size,
        "Starting autoresolve worker"
    );

    let store: Arc<dyn GroupStore> = match config.store.backend {
        StoreBackendKind::Memory => {
            tracing::warn!("Using in-memory group store; state is lost on exit");
            Arc::new(InMemoryGroupStore::new())
        }
        StoreBackendKind::Postgres => {
            let url = config
                .store
                .database_url
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("store.database_url is not set"))?;
            let store = PgGroupStore::connect(url, config.store.max_connections).await?;
            store.migrate().await?;
            tracing::info!("Connected to group store, migrations applied");
            Arc::new(store)
        }
    };

    let backend: Arc<dyn QueueBackend> = match config.queue.backend {
        QueueBackendKind::Memory => Arc::new(InMemoryQueueBackend::new()),
        QueueBackendKind::Redis => {
            let client = redis::Client::open(config.queue.redis_url.as_str())
                .map_err(|e| anyhow::anyhow!("Failed to create Redis client: {}", e))?;
            tracing::info!(queue_key = %config.queue.queue_key, "Redis queue backend created");
            Arc::new(RedisQueueBackend::new(client, config.queue.queue_key.clone()))
        }
    };
    let queue = Arc::new(JobQueue::new(
        backend,
        QueueConfig {
            enable_dead_letter: true,
            dead_letter_max_size: config.queue.dead_letter_max_size,
        },
    ));

    let predicate = Arc::new(PayloadConditionPredicate::new(&config.predicate)?);
    let scheduler = Arc::new(CoalescingScheduler::new(
        store,
        predicate,
        queue.clone(),
        &config.engine,
    ));

    let handler = Arc::new(EvaluationHandler::new(
        scheduler,
        config.engine.retry.to_policy(),
    ));
    let worker = JobWorker::new(config.worker.to_worker_config(), queue)
        .register(handler)
        .start();

    shutdown_signal().await;

    worker.stop().await;
    telemetry.shutdown();
    tracing::info!("Worker shutdown complete");

    Ok(())
}

/// Wait for shutdown signal.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
