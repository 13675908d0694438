//! Resolution executor: consults the predicate on the latest event and
//! performs the resolve transition.

use std::sync::Arc;
use std::time::Duration;

use super::group::{AlertGroup, ResolutionState};
use super::predicate::ResolvePredicate;
use super::store::{CasResult, GroupStore};
use crate::error::Result;

/// Outcome of a resolve attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveAttempt {
    /// The group was transitioned to resolved.
    Resolved,
    /// The latest event is not a resolve signal; nothing changed.
    NotResolveSignal,
    /// The group has no events to evaluate.
    NoEvents,
    /// The group was not open; nothing was done.
    AlreadyTerminal(ResolutionState),
    /// The resolve write lost a race; nothing was changed.
    Conflict(CasResult),
}

const DEFAULT_PREDICATE_TIMEOUT: Duration = Duration::from_secs(10);

pub struct ResolutionExecutor {
    store: Arc<dyn GroupStore>,
    predicate: Arc<dyn ResolvePredicate>,
    predicate_timeout: Duration,
}

impl ResolutionExecutor {
    pub fn new(store: Arc<dyn GroupStore>, predicate: Arc<dyn ResolvePredicate>) -> Self {
        Self {
            store,
            predicate,
            predicate_timeout: DEFAULT_PREDICATE_TIMEOUT,
        }
    }

    /// Bound each predicate call. An elapsed call fails with `PredicateTimeout`,
    /// which is retryable.
    pub fn with_predicate_timeout(mut self, timeout: Duration) -> Self {
        self.predicate_timeout = timeout;
        self
    }

    /// Resolve `group` if its most recent event is a resolve signal.
    ///
    /// Idempotent: a group that is no longer open is left untouched and the
    /// predicate is not consulted.
    pub async fn attempt_resolve(&self, group: &mut AlertGroup) -> Result<ResolveAttempt> {
        if group.resolution_state != ResolutionState::Open {
            return Ok(ResolveAttempt::AlreadyTerminal(group.resolution_state));
        }

        let Some(last_event) = self.store.last_event(group.id).await? else {
            return Ok(ResolveAttempt::NoEvents);
        };

        let is_signal = tokio::time::timeout(
            self.predicate_timeout,
            self.predicate.is_resolve_signal(group, &last_event),
        )
        .await??;
        if !is_signal {
            tracing::debug!(group_id = %group.id, seq = last_event.seq, "Latest event is not a resolve signal");
            return Ok(ResolveAttempt::NotResolveSignal);
        }

        let expected_token = group.active_evaluation_token;
        let mut resolved = group.clone();
        resolved.resolve_by_source()?;

        let result = self
            .store
            .save(&resolved, ResolutionState::Open, expected_token)
            .await?;
        if !result.is_success() {
            return Ok(ResolveAttempt::Conflict(result));
        }

        *group = resolved;
        tracing::info!(
            group_id = %group.id,
            seq = last_event.seq,
            "Alert group resolved by source"
        );
        Ok(ResolveAttempt::Resolved)
    }
}
