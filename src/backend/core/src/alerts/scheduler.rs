//! Coalescing scheduler.
//!
//! Every appended event schedules a deferred evaluation and stamps the group
//! with a fresh token. When an evaluation fires it reloads the group and only
//! proceeds if its token is still the active one, so a burst of N events does
//! real work once: for the last of them. Superseded evaluations are not
//! cancelled; they fire and are discarded by the token check.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

use super::breaker::{SizeCheck, SizeCircuitBreaker};
use super::executor::{ResolutionExecutor, ResolveAttempt};
use super::group::{EvaluationToken, Event, GroupId, ResolutionState};
use super::job::ResolveEvaluationJob;
use super::predicate::ResolvePredicate;
use super::store::{CasResult, GroupStore, TokenStamp};
use crate::config::EngineConfig;
use crate::error::{AutoResolveError, Result};
use crate::jobs::TaskScheduler;
use crate::telemetry::EvaluationMetrics;

/// How a single evaluation ended. Only `Resolved` and `BreakerTripped`
/// change the group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvaluationOutcome {
    Resolved,
    NotResolveSignal,
    /// A newer evaluation was scheduled for the group.
    Superseded,
    AlreadyTerminal(ResolutionState),
    BreakerTripped { size: usize },
    GroupNotFound,
    NoEvents,
}

impl EvaluationOutcome {
    /// Stable code used in logs and as the metrics label.
    pub fn code(&self) -> &'static str {
        match self {
            EvaluationOutcome::Resolved => "resolved",
            EvaluationOutcome::NotResolveSignal => "not_resolve_signal",
            EvaluationOutcome::Superseded => "superseded",
            EvaluationOutcome::AlreadyTerminal(_) => "already_terminal",
            EvaluationOutcome::BreakerTripped { .. } => "breaker_tripped",
            EvaluationOutcome::GroupNotFound => "group_not_found",
            EvaluationOutcome::NoEvents => "no_events",
        }
    }

    /// Whether this evaluation wrote to the group.
    pub fn changed_state(&self) -> bool {
        matches!(
            self,
            EvaluationOutcome::Resolved | EvaluationOutcome::BreakerTripped { .. }
        )
    }

    fn from_conflict(result: CasResult) -> Result<Self> {
        match result {
            CasResult::NotFound => Ok(EvaluationOutcome::GroupNotFound),
            CasResult::StateMismatch { actual } => Ok(EvaluationOutcome::AlreadyTerminal(actual)),
            CasResult::TokenMismatch => Ok(EvaluationOutcome::Superseded),
            CasResult::Success => Err(AutoResolveError::invariant_violation(
                "successful write reported as a conflict",
            )),
        }
    }
}

impl std::fmt::Display for EvaluationOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

const FORCE_RESOLVE_ATTEMPTS: usize = 5;

/// Debounced, coalescing auto-resolve scheduler.
pub struct CoalescingScheduler {
    store: Arc<dyn GroupStore>,
    tasks: Arc<dyn TaskScheduler>,
    breaker: SizeCircuitBreaker,
    executor: ResolutionExecutor,
    debounce: Duration,
}

impl CoalescingScheduler {
    pub fn new(
        store: Arc<dyn GroupStore>,
        predicate: Arc<dyn ResolvePredicate>,
        tasks: Arc<dyn TaskScheduler>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            breaker: SizeCircuitBreaker::new(Arc::clone(&store), config.max_group_size),
            executor: ResolutionExecutor::new(Arc::clone(&store), predicate)
                .with_predicate_timeout(config.predicate_timeout),
            store,
            tasks,
            debounce: config.debounce,
        }
    }

    pub fn store(&self) -> &Arc<dyn GroupStore> {
        &self.store
    }

    pub fn debounce(&self) -> Duration {
        self.debounce
    }

    pub fn max_group_size(&self) -> usize {
        self.breaker.max_group_size()
    }

    /// Stamp a fresh token on the group and enqueue an evaluation carrying it.
    ///
    /// Every earlier token for the group is superseded from this point on. If
    /// the enqueue fails the previous token is put back, so the evaluation
    /// that was pending before this call stays live.
    #[instrument(skip(self), fields(group_id = %group_id))]
    pub async fn schedule_evaluation(
        &self,
        group_id: GroupId,
        delay: Duration,
    ) -> Result<EvaluationToken> {
        let token = EvaluationToken::new();
        let job = ResolveEvaluationJob { group_id, token }.to_queued()?;

        let previous = match self.store.stamp_token(group_id, token).await? {
            TokenStamp::Stamped { previous } => previous,
            TokenStamp::NotFound => return Err(AutoResolveError::group_not_found(group_id)),
        };

        if let Err(e) = self.tasks.enqueue_after(delay, job).await {
            self.rollback_stamp(group_id, token, previous).await;
            return Err(e);
        }

        EvaluationMetrics::record_scheduled();
        debug!(%token, delay_ms = delay.as_millis() as u64, "Evaluation scheduled");
        Ok(token)
    }

    async fn rollback_stamp(
        &self,
        group_id: GroupId,
        token: EvaluationToken,
        previous: Option<EvaluationToken>,
    ) {
        match self.store.restore_token(group_id, token, previous).await {
            Ok(true) => debug!(%token, "Enqueue failed, previous token restored"),
            Ok(false) => debug!(%token, "Enqueue failed, token already replaced"),
            Err(e) => warn!(%token, error = %e, "Enqueue failed and previous token could not be restored"),
        }
    }

    /// Call after every event appended to a group.
    pub async fn on_event_appended(&self, group_id: GroupId) -> Result<EvaluationToken> {
        self.schedule_evaluation(group_id, self.debounce).await
    }

    /// Append an event and schedule the follow-up evaluation.
    ///
    /// If scheduling fails the event is removed again, so the call can be
    /// retried without duplicating it.
    pub async fn record_event(&self, group_id: GroupId, payload: serde_json::Value) -> Result<Event> {
        let event = self.store.append_event(group_id, payload).await?;
        if let Err(e) = self.on_event_appended(group_id).await {
            if let Err(remove_err) = self.store.remove_event(group_id, event.seq).await {
                warn!(
                    group_id = %group_id,
                    seq = event.seq,
                    error = %remove_err,
                    "Scheduling failed and the event could not be removed"
                );
            }
            return Err(e);
        }
        Ok(event)
    }

    /// Run the evaluation identified by `token`.
    ///
    /// Guard outcomes are returned as `Ok`. Only store or predicate failures
    /// come back as `Err`, and those leave the group untouched.
    #[instrument(skip(self), fields(group_id = %group_id, token = %token))]
    pub async fn run_evaluation(
        &self,
        group_id: GroupId,
        token: EvaluationToken,
    ) -> Result<EvaluationOutcome> {
        let started = Instant::now();
        let outcome = self.evaluate(group_id, token).await?;
        EvaluationMetrics::record_outcome(outcome.code(), started.elapsed());

        match outcome {
            EvaluationOutcome::GroupNotFound => {
                warn!(outcome = outcome.code(), "Group disappeared before evaluation")
            }
            EvaluationOutcome::Resolved | EvaluationOutcome::BreakerTripped { .. } => {
                info!(outcome = outcome.code(), "Evaluation finished")
            }
            _ => debug!(outcome = outcome.code(), "Evaluation finished"),
        }
        Ok(outcome)
    }

    async fn evaluate(
        &self,
        group_id: GroupId,
        token: EvaluationToken,
    ) -> Result<EvaluationOutcome> {
        let Some(mut group) = self.store.load(group_id).await? else {
            return Ok(EvaluationOutcome::GroupNotFound);
        };

        if !group.authorizes(&token) {
            return Ok(EvaluationOutcome::Superseded);
        }

        if group.resolution_state != ResolutionState::Open {
            return Ok(EvaluationOutcome::AlreadyTerminal(group.resolution_state));
        }

        match self.breaker.check_size(&mut group).await? {
            SizeCheck::Allowed { .. } => {}
            SizeCheck::Tripped { size } => return Ok(EvaluationOutcome::BreakerTripped { size }),
            SizeCheck::Conflict(result) => return EvaluationOutcome::from_conflict(result),
        }

        match self.executor.attempt_resolve(&mut group).await? {
            ResolveAttempt::Resolved => Ok(EvaluationOutcome::Resolved),
            ResolveAttempt::NotResolveSignal => Ok(EvaluationOutcome::NotResolveSignal),
            ResolveAttempt::NoEvents => Ok(EvaluationOutcome::NoEvents),
            ResolveAttempt::AlreadyTerminal(state) => Ok(EvaluationOutcome::AlreadyTerminal(state)),
            ResolveAttempt::Conflict(result) => EvaluationOutcome::from_conflict(result),
        }
    }

    /// Manual resolve, allowed from open or suspended.
    ///
    /// Returns `false` if the group was already resolved. Concurrent token
    /// stamps are retried rather than reported.
    #[instrument(skip(self), fields(group_id = %group_id))]
    pub async fn force_resolve(&self, group_id: GroupId) -> Result<bool> {
        for _ in 0..FORCE_RESOLVE_ATTEMPTS {
            let mut group = self
                .store
                .load(group_id)
                .await?
                .ok_or_else(|| AutoResolveError::group_not_found(group_id))?;

            let expected_state = group.resolution_state;
            let expected_token = group.active_evaluation_token;
            if !group.force_resolve()? {
                return Ok(false);
            }

            match self
                .store
                .save(&group, expected_state, expected_token)
                .await?
            {
                CasResult::Success => {
                    info!(from = %expected_state, "Alert group resolved by user");
                    return Ok(true);
                }
                CasResult::NotFound => return Err(AutoResolveError::group_not_found(group_id)),
                CasResult::StateMismatch { .. } | CasResult::TokenMismatch => {
                    debug!("Group changed during manual resolve, reloading");
                }
            }
        }

        Err(AutoResolveError::store(
            format!("manual resolve of {} kept conflicting with concurrent writes", group_id),
            true,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::store::InMemoryGroupStore;
    use crate::alerts::{PayloadConditionPredicate, ResolveCondition, ResolvedBy};
    use crate::jobs::QueuedJob;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Captures scheduled jobs instead of running them.
    #[derive(Default)]
    struct CapturingTasks {
        jobs: parking_lot::Mutex<Vec<(Duration, QueuedJob)>>,
        unavailable: AtomicBool,
    }

    #[async_trait]
    impl TaskScheduler for CapturingTasks {
        async fn enqueue_after(&self, delay: Duration, job: QueuedJob) -> Result<()> {
            if self.unavailable.load(Ordering::SeqCst) {
                return Err(AutoResolveError::queue("queue unavailable"));
            }
            self.jobs.lock().push((delay, job));
            Ok(())
        }
    }

    fn scheduler(max_group_size: usize) -> (CoalescingScheduler, Arc<CapturingTasks>) {
        let tasks = Arc::new(CapturingTasks::default());
        let config = EngineConfig {
            debounce: Duration::from_millis(100),
            max_group_size,
            ..EngineConfig::default()
        };
        let predicate =
            Arc::new(PayloadConditionPredicate::new(&ResolveCondition::default()).unwrap());
        let scheduler = CoalescingScheduler::new(
            Arc::new(InMemoryGroupStore::new()),
            predicate,
            tasks.clone(),
            &config,
        );
        (scheduler, tasks)
    }

    #[test]
    fn test_outcome_codes() {
        assert_eq!(EvaluationOutcome::Superseded.code(), "superseded");
        assert_eq!(
            EvaluationOutcome::AlreadyTerminal(ResolutionState::Resolved).code(),
            "already_terminal"
        );
        assert_eq!(
            EvaluationOutcome::BreakerTripped { size: 3 }.to_string(),
            "breaker_tripped"
        );
        assert!(EvaluationOutcome::Resolved.changed_state());
        assert!(!EvaluationOutcome::NotResolveSignal.changed_state());
    }

    #[tokio::test]
    async fn test_schedule_stamps_token_and_enqueues() {
        let (scheduler, tasks) = scheduler(10);
        let id = GroupId::new();
        scheduler.store().create_group(id).await.unwrap();

        let token = scheduler.on_event_appended(id).await.unwrap();

        let group = scheduler.store().load(id).await.unwrap().unwrap();
        assert_eq!(group.active_evaluation_token, Some(token));

        let jobs = tasks.jobs.lock();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].0, Duration::from_millis(100));
        let payload = ResolveEvaluationJob::from_data(&jobs[0].1.data).unwrap();
        assert_eq!(payload.group_id, id);
        assert_eq!(payload.token, token);
    }

    #[tokio::test]
    async fn test_schedule_for_missing_group_fails() {
        let (scheduler, tasks) = scheduler(10);
        let err = scheduler
            .schedule_evaluation(GroupId::new(), Duration::ZERO)
            .await
            .unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::GroupNotFound);
        assert!(tasks.jobs.lock().is_empty());
    }

    #[tokio::test]
    async fn test_failed_enqueue_keeps_pending_evaluation_live() {
        let (scheduler, tasks) = scheduler(10);
        let id = GroupId::new();
        scheduler.store().create_group(id).await.unwrap();
        scheduler
            .record_event(id, json!({ "status": "firing" }))
            .await
            .unwrap();
        let pending = ResolveEvaluationJob::from_data(&tasks.jobs.lock()[0].1.data)
            .unwrap()
            .token;

        tasks.unavailable.store(true, Ordering::SeqCst);
        assert!(scheduler
            .record_event(id, json!({ "status": "resolved" }))
            .await
            .is_err());

        // Neither the event nor the new token survives the failed call.
        let group = scheduler.store().load(id).await.unwrap().unwrap();
        assert_eq!(group.active_evaluation_token, Some(pending));
        assert_eq!(scheduler.store().size(id).await.unwrap(), 1);
        assert_eq!(tasks.jobs.lock().len(), 1);
        assert_eq!(
            scheduler.run_evaluation(id, pending).await.unwrap(),
            EvaluationOutcome::NotResolveSignal
        );

        // Retrying once the queue is back appends the event exactly once.
        tasks.unavailable.store(false, Ordering::SeqCst);
        scheduler
            .record_event(id, json!({ "status": "resolved" }))
            .await
            .unwrap();
        assert_eq!(scheduler.store().size(id).await.unwrap(), 2);
        let token = scheduler
            .store()
            .load(id)
            .await
            .unwrap()
            .unwrap()
            .active_evaluation_token
            .unwrap();
        assert_eq!(
            scheduler.run_evaluation(id, token).await.unwrap(),
            EvaluationOutcome::Resolved
        );
    }

    #[tokio::test]
    async fn test_failed_enqueue_does_not_undo_newer_stamp() {
        let (scheduler, tasks) = scheduler(10);
        let id = GroupId::new();
        scheduler.store().create_group(id).await.unwrap();

        tasks.unavailable.store(true, Ordering::SeqCst);
        assert!(scheduler.on_event_appended(id).await.is_err());
        assert_eq!(
            scheduler.store().load(id).await.unwrap().unwrap().active_evaluation_token,
            None
        );

        // A rollback only applies while its own token is still active.
        let newer = EvaluationToken::new();
        scheduler.store().stamp_token(id, newer).await.unwrap();
        assert!(!scheduler
            .store()
            .restore_token(id, EvaluationToken::new(), None)
            .await
            .unwrap());
        assert_eq!(
            scheduler.store().load(id).await.unwrap().unwrap().active_evaluation_token,
            Some(newer)
        );
    }

    #[tokio::test]
    async fn test_stale_token_is_superseded() {
        let (scheduler, _tasks) = scheduler(10);
        let id = GroupId::new();
        scheduler.store().create_group(id).await.unwrap();
        scheduler
            .record_event(id, json!({ "status": "resolved" }))
            .await
            .unwrap();

        let stale = scheduler.store().load(id).await.unwrap().unwrap();
        let stale_token = stale.active_evaluation_token.unwrap();
        let fresh = scheduler.on_event_appended(id).await.unwrap();

        assert_eq!(
            scheduler.run_evaluation(id, stale_token).await.unwrap(),
            EvaluationOutcome::Superseded
        );
        assert_eq!(
            scheduler.run_evaluation(id, fresh).await.unwrap(),
            EvaluationOutcome::Resolved
        );
    }

    #[tokio::test]
    async fn test_empty_group_yields_no_events() {
        let (scheduler, _tasks) = scheduler(10);
        let id = GroupId::new();
        scheduler.store().create_group(id).await.unwrap();
        let token = scheduler.on_event_appended(id).await.unwrap();

        assert_eq!(
            scheduler.run_evaluation(id, token).await.unwrap(),
            EvaluationOutcome::NoEvents
        );
    }

    #[tokio::test]
    async fn test_force_resolve_suspended_group() {
        let (scheduler, _tasks) = scheduler(1);
        let id = GroupId::new();
        scheduler.store().create_group(id).await.unwrap();
        scheduler.record_event(id, json!({})).await.unwrap();
        scheduler.record_event(id, json!({})).await.unwrap();
        let token = scheduler
            .store()
            .load(id)
            .await
            .unwrap()
            .unwrap()
            .active_evaluation_token
            .unwrap();

        assert_eq!(
            scheduler.run_evaluation(id, token).await.unwrap(),
            EvaluationOutcome::BreakerTripped { size: 2 }
        );

        assert!(scheduler.force_resolve(id).await.unwrap());
        assert!(!scheduler.force_resolve(id).await.unwrap());

        let group = scheduler.store().load(id).await.unwrap().unwrap();
        assert_eq!(group.resolution_state, ResolutionState::Resolved);
        assert_eq!(group.resolved_by, Some(ResolvedBy::User));
    }

    #[tokio::test]
    async fn test_force_resolve_missing_group() {
        let (scheduler, _tasks) = scheduler(10);
        assert!(scheduler.force_resolve(GroupId::new()).await.is_err());
    }
}
