//! Job definitions and traits.
//!
//! This module provides the core abstractions for deferred jobs:
//!
//! - **JobHandler trait**: executes one job type from its serialized payload
//! - **JobStatus**: Enumeration of possible job states
//! - **JobContext**: Context passed to handlers during execution
//! - **RetryPolicy**: Configuration for retry behavior with backoff strategies

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use crate::error::AutoResolveError;

// ═══════════════════════════════════════════════════════════════════════════════
// Job Identification
// ═══════════════════════════════════════════════════════════════════════════════

/// Unique identifier for a job instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Create a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Status
// ═══════════════════════════════════════════════════════════════════════════════

/// Status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Job is waiting for its ready time
    Scheduled,
    /// Job is currently being executed
    Running,
    /// Job completed successfully
    Completed,
    /// Job failed and will be retried
    Failed,
    /// Job failed after all retry attempts
    Dead,
}

impl JobStatus {
    /// Check if the job is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Dead)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scheduled => write!(f, "scheduled"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Dead => write!(f, "dead"),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Error
// ═══════════════════════════════════════════════════════════════════════════════

/// Error type for job execution failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobError {
    /// Error message
    pub message: String,
    /// Whether this error is retryable
    pub retryable: bool,
    /// Optional error code
    pub code: Option<String>,
}

impl JobError {
    /// Create a new retryable error.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
            code: None,
        }
    }

    /// Create a new non-retryable (fatal) error.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
            code: None,
        }
    }

    /// Add an error code.
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(code) = &self.code {
            write!(f, " (code: {})", code)?;
        }
        Ok(())
    }
}

impl std::error::Error for JobError {}

impl From<AutoResolveError> for JobError {
    fn from(error: AutoResolveError) -> Self {
        Self {
            message: error.to_string(),
            retryable: error.is_retryable(),
            code: Some(error.code().to_string()),
        }
    }
}

/// Result type for job execution.
pub type JobResult = std::result::Result<(), JobError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Backoff Strategy
// ═══════════════════════════════════════════════════════════════════════════════

/// Strategy for calculating retry delays.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed { delay_ms: u64 },
    /// Exponential increase in delay (initial * multiplier^attempt), capped
    Exponential {
        initial_delay_ms: u64,
        max_delay_ms: u64,
        multiplier: f64,
    },
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::Exponential {
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            multiplier: 2.0,
        }
    }
}

impl BackoffStrategy {
    /// Calculate the delay for a given retry number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let ms = match self {
            Self::Fixed { delay_ms } => *delay_ms,
            Self::Exponential {
                initial_delay_ms,
                max_delay_ms,
                multiplier,
            } => {
                let delay = (*initial_delay_ms as f64) * multiplier.powi(attempt as i32);
                delay.min(*max_delay_ms as f64) as u64
            }
        };

        Duration::from_millis(ms)
    }

    pub fn fixed(delay_ms: u64) -> Self {
        Self::Fixed { delay_ms }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Retry Policy
// ═══════════════════════════════════════════════════════════════════════════════

/// Configuration for job retry behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of executions, counting the first one
    pub max_attempts: u32,
    /// Backoff strategy for calculating delays
    pub backoff: BackoffStrategy,
    /// Whether to retry on any error or only retryable errors
    pub retry_on_any_error: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: BackoffStrategy::default(),
            retry_on_any_error: false,
        }
    }
}

impl RetryPolicy {
    /// A policy that runs a job exactly once.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn with_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Check if another execution should follow `attempts` failed ones.
    pub fn should_retry(&self, attempts: u32, error: &JobError) -> bool {
        if attempts >= self.max_attempts {
            return false;
        }

        self.retry_on_any_error || error.retryable
    }

    /// Delay before retry number `retry` (0-indexed).
    pub fn next_retry_delay(&self, retry: u32) -> Duration {
        self.backoff.delay_for_attempt(retry)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Metadata
// ═══════════════════════════════════════════════════════════════════════════════

/// Metadata associated with a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobMetadata {
    /// Unique job identifier
    pub id: JobId,
    /// Job type name, used to pick the handler
    pub job_type: String,
    /// Current status
    pub status: JobStatus,
    /// Number of executions so far
    pub attempts: u32,
    /// When the job was first created
    pub created_at: DateTime<Utc>,
    /// When the job last started executing
    pub started_at: Option<DateTime<Utc>>,
    /// When the job finished (success or dead)
    pub finished_at: Option<DateTime<Utc>>,
    /// Last error message (if failed)
    pub last_error: Option<String>,
    /// Correlation ID for tracing (the group id for evaluations)
    pub correlation_id: Option<String>,
}

impl JobMetadata {
    /// Create new metadata for a job.
    pub fn new(job_type: impl Into<String>) -> Self {
        Self {
            id: JobId::new(),
            job_type: job_type.into(),
            status: JobStatus::Scheduled,
            attempts: 0,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            last_error: None,
            correlation_id: None,
        }
    }

    /// Set a correlation ID.
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn mark_running(&mut self) {
        self.status = JobStatus::Running;
        self.started_at = Some(Utc::now());
        self.attempts += 1;
    }

    pub fn mark_completed(&mut self) {
        self.status = JobStatus::Completed;
        self.finished_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self, error: &str) {
        self.status = JobStatus::Failed;
        self.last_error = Some(error.to_string());
    }

    pub fn mark_dead(&mut self, error: &str) {
        self.status = JobStatus::Dead;
        self.finished_at = Some(Utc::now());
        self.last_error = Some(error.to_string());
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Context
// ═══════════════════════════════════════════════════════════════════════════════

/// Context passed to handlers during execution.
pub struct JobContext {
    pub metadata: JobMetadata,
}

impl JobContext {
    pub fn new(metadata: JobMetadata) -> Self {
        Self { metadata }
    }

    pub fn job_id(&self) -> JobId {
        self.metadata.id
    }

    pub fn job_type(&self) -> &str {
        &self.metadata.job_type
    }

    /// Get the current attempt number (1-indexed).
    pub fn attempt(&self) -> u32 {
        self.metadata.attempts
    }

    pub fn log_warn(&self, message: &str) {
        tracing::warn!(
            job_id = %self.metadata.id,
            job_type = %self.metadata.job_type,
            attempt = self.metadata.attempts,
            message
        );
    }

    pub fn log_error(&self, message: &str) {
        tracing::error!(
            job_id = %self.metadata.id,
            job_type = %self.metadata.job_type,
            attempt = self.metadata.attempts,
            message
        );
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Handler Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Executes jobs of one type from their serialized payload.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// The job type this handler accepts.
    fn job_type(&self) -> &'static str;

    /// Execute one job.
    ///
    /// # Errors
    ///
    /// Return `JobError::retryable()` for transient failures that should be
    /// retried, and `JobError::fatal()` for permanent failures.
    async fn handle(&self, data: &serde_json::Value, ctx: &JobContext) -> JobResult;

    /// Retry policy for this job type.
    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
