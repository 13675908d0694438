//! The deferred evaluation job and its worker handler.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::group::{EvaluationToken, GroupId};
use super::scheduler::CoalescingScheduler;
use crate::error::Result;
use crate::jobs::{JobContext, JobError, JobHandler, JobMetadata, JobResult, QueuedJob, RetryPolicy};

/// Payload of a deferred evaluation. Retries reuse it unchanged, so a retry
/// that has since been superseded is discarded like any stale evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolveEvaluationJob {
    pub group_id: GroupId,
    pub token: EvaluationToken,
}

impl ResolveEvaluationJob {
    pub const JOB_TYPE: &'static str = "resolve_evaluation";

    pub fn to_queued(&self) -> Result<QueuedJob> {
        let metadata = JobMetadata::new(Self::JOB_TYPE).with_correlation_id(self.group_id.to_string());
        Ok(QueuedJob::new(metadata, serde_json::to_value(self)?))
    }

    pub fn from_data(data: &serde_json::Value) -> Result<Self> {
        Ok(serde_json::from_value(data.clone())?)
    }
}

/// Runs evaluation jobs against the scheduler.
pub struct EvaluationHandler {
    scheduler: Arc<CoalescingScheduler>,
    retry: RetryPolicy,
}

impl EvaluationHandler {
    pub fn new(scheduler: Arc<CoalescingScheduler>, retry: RetryPolicy) -> Self {
        Self { scheduler, retry }
    }
}

#[async_trait]
impl JobHandler for EvaluationHandler {
    fn job_type(&self) -> &'static str {
        ResolveEvaluationJob::JOB_TYPE
    }

    async fn handle(&self, data: &serde_json::Value, ctx: &JobContext) -> JobResult {
        let job = ResolveEvaluationJob::from_data(data)
            .map_err(|e| JobError::fatal(format!("malformed evaluation payload: {}", e)))?;

        match self.scheduler.run_evaluation(job.group_id, job.token).await {
            Ok(_) => Ok(()),
            Err(e) => {
                tracing::debug!(
                    group_id = %job.group_id,
                    attempt = ctx.attempt(),
                    code = %e.code(),
                    "Evaluation failed"
                );
                e.log();
                Err(JobError::from(e))
            }
        }
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.retry.clone()
    }
}
