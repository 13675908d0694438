//! Delayed job queue with dead letter handling.
//!
//! Jobs carry a `ready_at` time and are only handed out once it has passed.
//! Delivery is at-least-once: a job may be handed out more than once if a
//! consumer crashes or a producer enqueues duplicates, so handlers must be
//! idempotent.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use super::JobMetadata;
use crate::error::Result;

/// Configuration for the job queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Whether to keep exhausted jobs for inspection
    pub enable_dead_letter: bool,
    /// Maximum items in the dead letter queue
    pub dead_letter_max_size: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            enable_dead_letter: true,
            dead_letter_max_size: 1000,
        }
    }
}

/// A job in the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedJob {
    /// Job metadata
    pub metadata: JobMetadata,
    /// Serialized job data
    pub data: serde_json::Value,
    /// Earliest time the job may run
    pub ready_at: DateTime<Utc>,
    /// When the job was (re-)enqueued
    pub enqueued_at: DateTime<Utc>,
}

impl QueuedJob {
    /// A job that becomes ready immediately.
    pub fn new(metadata: JobMetadata, data: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            metadata,
            data,
            ready_at: now,
            enqueued_at: now,
        }
    }

    /// Push the ready time `delay` into the future, measured from now.
    pub fn delayed_by(mut self, delay: Duration) -> Self {
        let now = Utc::now();
        self.enqueued_at = now;
        self.ready_at = now + chrono::Duration::from_std(delay).unwrap_or_default();
        self
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.ready_at <= now
    }
}

impl Eq for QueuedJob {}

impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.metadata.id == other.metadata.id && self.ready_at == other.ready_at
    }
}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// Max-heap: the earliest ready time compares greatest.
impl Ord for QueuedJob {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .ready_at
            .cmp(&self.ready_at)
            .then_with(|| other.enqueued_at.cmp(&self.enqueued_at))
    }
}

/// Queue statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStats {
    /// Number of jobs waiting (due or not)
    pub pending: usize,
    /// Number of jobs handed out so far
    pub dequeued: u64,
    /// Number of dead letter jobs
    pub dead_letter: usize,
}

/// Dead letter queue for exhausted jobs.
#[derive(Debug)]
pub struct DeadLetterQueue {
    jobs: VecDeque<QueuedJob>,
    max_size: usize,
}

impl DeadLetterQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            jobs: VecDeque::new(),
            max_size,
        }
    }

    pub fn push(&mut self, job: QueuedJob) {
        if self.jobs.len() >= self.max_size {
            self.jobs.pop_front();
        }
        self.jobs.push_back(job);
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn drain(&mut self) -> Vec<QueuedJob> {
        self.jobs.drain(..).collect()
    }
}

/// Trait for queue backends.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Store a job until its ready time.
    async fn enqueue(&self, job: QueuedJob) -> Result<()>;

    /// Take the earliest job whose ready time is at or before `now`.
    async fn dequeue_due(&self, now: DateTime<Utc>) -> Result<Option<QueuedJob>>;

    /// Get queue statistics.
    async fn stats(&self) -> Result<QueueStats>;

    /// Get the current queue length.
    async fn len(&self) -> Result<usize>;

    /// Check if the queue is empty.
    async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }
}

/// In-memory queue backend for testing and single-process deployments.
pub struct InMemoryQueueBackend {
    queue: Arc<RwLock<BinaryHeap<QueuedJob>>>,
    stats: Arc<RwLock<QueueStats>>,
}

impl InMemoryQueueBackend {
    pub fn new() -> Self {
        Self {
            queue: Arc::new(RwLock::new(BinaryHeap::new())),
            stats: Arc::new(RwLock::new(QueueStats::default())),
        }
    }
}

impl Default for InMemoryQueueBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueBackend for InMemoryQueueBackend {
    async fn enqueue(&self, job: QueuedJob) -> Result<()> {
        let mut queue = self.queue.write().await;
        queue.push(job);
        self.stats.write().await.pending = queue.len();
        Ok(())
    }

    async fn dequeue_due(&self, now: DateTime<Utc>) -> Result<Option<QueuedJob>> {
        let mut queue = self.queue.write().await;
        let due = matches!(queue.peek(), Some(job) if job.is_due(now));
        if !due {
            return Ok(None);
        }

        let job = queue.pop();
        let mut stats = self.stats.write().await;
        stats.pending = queue.len();
        stats.dequeued += 1;
        Ok(job)
    }

    async fn stats(&self) -> Result<QueueStats> {
        Ok(self.stats.read().await.clone())
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.queue.read().await.len())
    }
}

/// Redis-backed queue using a sorted set scored by ready time (epoch millis).
///
/// A job is claimed by whichever consumer removes it with `ZREM` first, so
/// several worker processes can share one key.
pub struct RedisQueueBackend {
    client: redis::Client,
    queue_key: String,
}

impl RedisQueueBackend {
    /// Create a new Redis queue backend.
    ///
    /// # Arguments
    /// * `client` - A Redis client
    /// * `queue_key` - The sorted-set key to use (e.g. `"autoresolve:evaluations"`)
    pub fn new(client: redis::Client, queue_key: impl Into<String>) -> Self {
        Self {
            client,
            queue_key: queue_key.into(),
        }
    }

    async fn get_conn(&self) -> Result<redis::aio::MultiplexedConnection> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }
}

#[async_trait]
impl QueueBackend for RedisQueueBackend {
    async fn enqueue(&self, job: QueuedJob) -> Result<()> {
        let serialized = serde_json::to_string(&job)?;
        let score = job.ready_at.timestamp_millis();

        let mut conn = self.get_conn().await?;
        redis::cmd("ZADD")
            .arg(&self.queue_key)
            .arg(score)
            .arg(&serialized)
            .query_async::<_, i64>(&mut conn)
            .await?;

        tracing::debug!(queue = %self.queue_key, job_id = %job.metadata.id, "Job enqueued");
        Ok(())
    }

    async fn dequeue_due(&self, now: DateTime<Utc>) -> Result<Option<QueuedJob>> {
        let mut conn = self.get_conn().await?;

        let candidates: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(&self.queue_key)
            .arg("-inf")
            .arg(now.timestamp_millis())
            .arg("LIMIT")
            .arg(0)
            .arg(1)
            .query_async(&mut conn)
            .await?;

        let Some(member) = candidates.into_iter().next() else {
            return Ok(None);
        };

        let removed: i64 = redis::cmd("ZREM")
            .arg(&self.queue_key)
            .arg(&member)
            .query_async(&mut conn)
            .await?;
        if removed == 0 {
            // Another consumer claimed it first.
            return Ok(None);
        }

        let job: QueuedJob = serde_json::from_str(&member)?;
        tracing::debug!(queue = %self.queue_key, job_id = %job.metadata.id, "Job dequeued");
        Ok(Some(job))
    }

    async fn stats(&self) -> Result<QueueStats> {
        Ok(QueueStats {
            pending: self.len().await?,
            ..Default::default()
        })
    }

    async fn len(&self) -> Result<usize> {
        let mut conn = self.get_conn().await?;
        let length: usize = redis::cmd("ZCARD")
            .arg(&self.queue_key)
            .query_async(&mut conn)
            .await?;
        Ok(length)
    }
}

/// Deferred dispatch: run a job after a delay.
#[async_trait]
pub trait TaskScheduler: Send + Sync {
    async fn enqueue_after(&self, delay: Duration, job: QueuedJob) -> Result<()>;
}

/// The main job queue.
pub struct JobQueue {
    backend: Arc<dyn QueueBackend>,
    dead_letter: Arc<RwLock<DeadLetterQueue>>,
    config: QueueConfig,
}

impl JobQueue {
    /// Create a new job queue with the given backend.
    pub fn new(backend: Arc<dyn QueueBackend>, config: QueueConfig) -> Self {
        let dlq = DeadLetterQueue::new(config.dead_letter_max_size);
        Self {
            backend,
            dead_letter: Arc::new(RwLock::new(dlq)),
            config,
        }
    }

    /// Create a new in-memory job queue.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryQueueBackend::new()), QueueConfig::default())
    }

    /// Enqueue a job as-is (its `ready_at` is respected).
    pub async fn enqueue(&self, job: QueuedJob) -> Result<()> {
        self.backend.enqueue(job).await
    }

    /// Take the next due job, if any.
    pub async fn dequeue_due(&self) -> Result<Option<QueuedJob>> {
        self.backend.dequeue_due(Utc::now()).await
    }

    /// Move a job to the dead letter queue.
    pub async fn dead_letter(&self, job: QueuedJob) {
        if self.config.enable_dead_letter {
            self.dead_letter.write().await.push(job);
        }
    }

    /// Remove and return all dead-lettered jobs.
    pub async fn drain_dead_letters(&self) -> Vec<QueuedJob> {
        self.dead_letter.write().await.drain()
    }

    /// Get queue statistics.
    pub async fn stats(&self) -> Result<QueueStats> {
        let mut stats = self.backend.stats().await?;
        stats.dead_letter = self.dead_letter.read().await.len();
        Ok(stats)
    }
}

#[async_trait]
impl TaskScheduler for JobQueue {
    async fn enqueue_after(&self, delay: Duration, job: QueuedJob) -> Result<()> {
        self.enqueue(job.delayed_by(delay)).await
    }
}
