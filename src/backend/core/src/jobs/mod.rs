//! Deferred job execution.
//!
//! - **Job Definitions**: handler trait, retry policy and backoff
//! - **Queue**: delayed queue (in-memory or Redis sorted set) with dead letter support
//! - **Worker**: concurrent execution of due jobs with graceful shutdown
//!
//! ```text
//!   enqueue_after(delay)        ready_at <= now
//!  ─────────────────────▶ Queue ───────────────▶ Worker ──▶ JobHandler
//!                           ▲                      │
//!                           └──── retry (backoff) ─┤
//!                                                  └──▶ DeadLetterQueue
//! ```
//!
//! Delivery is at-least-once. Handlers must tolerate running the same payload
//! more than once.

pub mod job;
pub mod queue;
pub mod worker;

pub use job::{
    BackoffStrategy, JobContext, JobError, JobHandler, JobId, JobMetadata, JobResult, JobStatus,
    RetryPolicy,
};
pub use queue::{
    DeadLetterQueue, InMemoryQueueBackend, JobQueue, QueueBackend, QueueConfig, QueueStats,
    QueuedJob, RedisQueueBackend, TaskScheduler,
};
pub use worker::{JobWorker, WorkerConfig, WorkerHandle, WorkerStats};
