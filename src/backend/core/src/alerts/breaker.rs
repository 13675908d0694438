//! Size circuit breaker.
//!
//! Evaluation cost grows with group size. Past `max_group_size` events the
//! group is suspended from auto-resolve for good, so oversized groups are not
//! re-checked on every new event.

use std::sync::Arc;

use super::group::AlertGroup;
use super::store::{CasResult, GroupStore};
use crate::error::Result;
use crate::telemetry::EvaluationMetrics;

/// Outcome of a size check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeCheck {
    /// Within limits; evaluation may continue.
    Allowed { size: usize },
    /// Over the limit; the group is now suspended.
    Tripped { size: usize },
    /// The suspension write lost a race; nothing was changed.
    Conflict(CasResult),
}

pub struct SizeCircuitBreaker {
    store: Arc<dyn GroupStore>,
    max_group_size: usize,
}

impl SizeCircuitBreaker {
    pub fn new(store: Arc<dyn GroupStore>, max_group_size: usize) -> Self {
        Self {
            store,
            max_group_size,
        }
    }

    pub fn max_group_size(&self) -> usize {
        self.max_group_size
    }

    /// Exactly `max_group_size` events is still allowed.
    pub fn exceeds(&self, size: usize) -> bool {
        size > self.max_group_size
    }

    /// Suspend `group` if it has grown past the limit, persisting the change.
    ///
    /// `group` must be the record the caller just loaded; the write is
    /// conditional on its state and token.
    pub async fn check_size(&self, group: &mut AlertGroup) -> Result<SizeCheck> {
        let size = self.store.size(group.id).await?;
        if !self.exceeds(size) {
            return Ok(SizeCheck::Allowed { size });
        }

        let expected_state = group.resolution_state;
        let expected_token = group.active_evaluation_token;
        let mut suspended = group.clone();
        suspended.suspend_auto_resolve()?;

        let result = self
            .store
            .save(&suspended, expected_state, expected_token)
            .await?;
        if !result.is_success() {
            return Ok(SizeCheck::Conflict(result));
        }

        *group = suspended;
        EvaluationMetrics::record_breaker_trip();
        tracing::warn!(
            group_id = %group.id,
            size,
            max_group_size = self.max_group_size,
            "Auto-resolve suspended: group exceeds size limit"
        );

        Ok(SizeCheck::Tripped { size })
    }
}
