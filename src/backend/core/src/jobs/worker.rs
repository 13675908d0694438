//! Job worker for concurrent job execution.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;

use super::{JobContext, JobHandler, JobQueue, QueuedJob, TaskScheduler};
use crate::telemetry::JobMetrics;

/// Configuration for the job worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Maximum concurrent job executions
    pub concurrency: usize,
    /// Poll interval for checking the queue (milliseconds)
    pub poll_interval_ms: u64,
    /// Shutdown timeout (seconds)
    pub shutdown_timeout_secs: u64,
    /// Worker name/identifier
    pub name: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 8,
            poll_interval_ms: 50,
            shutdown_timeout_secs: 30,
            name: "autoresolve-worker".to_string(),
        }
    }
}

/// Statistics for the job worker.
#[derive(Debug, Clone, Default)]
pub struct WorkerStats {
    /// Total executions started
    pub processed: Arc<AtomicU64>,
    /// Executions that returned Ok
    pub succeeded: Arc<AtomicU64>,
    /// Failed executions that were re-enqueued
    pub retried: Arc<AtomicU64>,
    /// Jobs moved to the dead letter queue
    pub dead_lettered: Arc<AtomicU64>,
    /// Currently running jobs
    pub active: Arc<AtomicU64>,
}

impl WorkerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn succeeded(&self) -> u64 {
        self.succeeded.load(Ordering::Relaxed)
    }

    pub fn retried(&self) -> u64 {
        self.retried.load(Ordering::Relaxed)
    }

    pub fn dead_lettered(&self) -> u64 {
        self.dead_lettered.load(Ordering::Relaxed)
    }

    pub fn active(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }
}

/// Handle for controlling a running worker.
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    stats: WorkerStats,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Signal the worker to shut down gracefully.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Get worker statistics.
    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    /// Signal shutdown and wait for in-flight jobs to drain.
    pub async fn stop(self) {
        self.shutdown();
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "Worker task panicked");
        }
    }
}

/// Job worker that processes due jobs from a queue.
pub struct JobWorker {
    config: WorkerConfig,
    queue: Arc<JobQueue>,
    handlers: HashMap<String, Arc<dyn JobHandler>>,
    stats: WorkerStats,
}

impl JobWorker {
    /// Create a new job worker.
    pub fn new(config: WorkerConfig, queue: Arc<JobQueue>) -> Self {
        Self {
            config,
            queue,
            handlers: HashMap::new(),
            stats: WorkerStats::new(),
        }
    }

    /// Register the handler for one job type.
    pub fn register(mut self, handler: Arc<dyn JobHandler>) -> Self {
        self.handlers.insert(handler.job_type().to_string(), handler);
        self
    }

    /// Start the worker, returning a handle for control.
    pub fn start(self) -> WorkerHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let stats = self.stats.clone();
        let JobWorker {
            config,
            queue,
            handlers,
            stats: worker_stats,
        } = self;
        let handlers = Arc::new(handlers);

        let task = tokio::spawn(async move {
            let semaphore = Arc::new(Semaphore::new(config.concurrency));
            let poll_interval = Duration::from_millis(config.poll_interval_ms);

            tracing::info!(
                worker = %config.name,
                concurrency = config.concurrency,
                job_types = ?handlers.keys().collect::<Vec<_>>(),
                "Job worker started"
            );

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            tracing::info!(worker = %config.name, "Worker shutting down");
                            break;
                        }
                    }
                    _ = tokio::time::sleep(poll_interval) => {
                        dispatch_due(&queue, &handlers, &semaphore, &worker_stats).await;
                    }
                }
            }

            let grace = Duration::from_secs(config.shutdown_timeout_secs);
            let permits = u32::try_from(config.concurrency).unwrap_or(u32::MAX);
            if tokio::time::timeout(grace, semaphore.acquire_many(permits))
                .await
                .is_err()
            {
                tracing::warn!(
                    worker = %config.name,
                    active = worker_stats.active(),
                    "Shutdown timeout elapsed with jobs still running"
                );
            }

            tracing::info!(worker = %config.name, "Worker stopped");
        });

        WorkerHandle {
            shutdown: shutdown_tx,
            stats,
            task,
        }
    }
}

/// Hand out due jobs until the queue has none or every slot is busy.
async fn dispatch_due(
    queue: &Arc<JobQueue>,
    handlers: &Arc<HashMap<String, Arc<dyn JobHandler>>>,
    semaphore: &Arc<Semaphore>,
    stats: &WorkerStats,
) {
    loop {
        let Ok(permit) = semaphore.clone().try_acquire_owned() else {
            return;
        };

        let job = match queue.dequeue_due().await {
            Ok(Some(job)) => job,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to poll job queue");
                return;
            }
        };

        let queue = Arc::clone(queue);
        let handlers = Arc::clone(handlers);
        let stats = stats.clone();
        tokio::spawn(async move {
            stats.active.fetch_add(1, Ordering::Relaxed);
            execute(&queue, &handlers, job, &stats).await;
            stats.active.fetch_sub(1, Ordering::Relaxed);
            drop(permit);
        });
    }
}

async fn execute(
    queue: &JobQueue,
    handlers: &HashMap<String, Arc<dyn JobHandler>>,
    mut job: QueuedJob,
    stats: &WorkerStats,
) {
    stats.processed.fetch_add(1, Ordering::Relaxed);
    job.metadata.mark_running();

    let Some(handler) = handlers.get(&job.metadata.job_type) else {
        tracing::error!(
            job_id = %job.metadata.id,
            job_type = %job.metadata.job_type,
            "No handler registered for job type"
        );
        job.metadata.mark_dead("no handler registered");
        dead_letter(queue, job, stats).await;
        return;
    };

    let ctx = JobContext::new(job.metadata.clone());
    match handler.handle(&job.data, &ctx).await {
        Ok(()) => {
            job.metadata.mark_completed();
            stats.succeeded.fetch_add(1, Ordering::Relaxed);
            JobMetrics::record(&job.metadata.job_type, "completed");
        }
        Err(err) => {
            let policy = handler.retry_policy();
            let attempts = job.metadata.attempts;

            if policy.should_retry(attempts, &err) {
                let delay = policy.next_retry_delay(attempts.saturating_sub(1));
                job.metadata.mark_failed(&err.message);
                ctx.log_warn(&format!(
                    "attempt failed, retrying in {}ms: {}",
                    delay.as_millis(),
                    err
                ));

                match queue.enqueue_after(delay, job.clone()).await {
                    Ok(()) => {
                        stats.retried.fetch_add(1, Ordering::Relaxed);
                        JobMetrics::record(&job.metadata.job_type, "retried");
                    }
                    Err(e) => {
                        ctx.log_error(&format!("failed to re-enqueue for retry: {}", e));
                        job.metadata.mark_dead(&e.to_string());
                        dead_letter(queue, job, stats).await;
                    }
                }
            } else {
                ctx.log_error(&format!("giving up after {} attempt(s): {}", attempts, err));
                job.metadata.mark_dead(&err.message);
                dead_letter(queue, job, stats).await;
            }
        }
    }
}

async fn dead_letter(queue: &JobQueue, job: QueuedJob, stats: &WorkerStats) {
    stats.dead_lettered.fetch_add(1, Ordering::Relaxed);
    JobMetrics::record(&job.metadata.job_type, "dead");
    queue.dead_letter(job).await;
}
