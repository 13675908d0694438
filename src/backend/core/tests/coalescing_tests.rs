//! Tests for the coalescing scheduler, size breaker and resolution executor.
//!
//! Tests cover:
//! - Burst coalescing (one effective evaluation per burst)
//! - Staleness detection for superseded and duplicated deliveries
//! - Size breaker boundary and sticky suspension
//! - Idempotent resolve
//! - Missing groups

use async_trait::async_trait;
use autoresolve_core::alerts::{
    AlertGroup, CoalescingScheduler, EvaluationOutcome, EvaluationToken, Event, GroupId,
    GroupStore, InMemoryGroupStore, ResolutionExecutor, ResolutionState, ResolveAttempt,
    ResolveEvaluationJob, ResolvePredicate, ResolvedBy,
};
use autoresolve_core::config::EngineConfig;
use autoresolve_core::error::Result;
use autoresolve_core::jobs::{QueuedJob, TaskScheduler};
use futures::future::join_all;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Test Fixtures
// ============================================================================

/// Predicate that answers a fixed value and counts how often it is asked.
struct CountingPredicate {
    answer: bool,
    calls: AtomicUsize,
}

impl CountingPredicate {
    fn new(answer: bool) -> Arc<Self> {
        Arc::new(Self {
            answer,
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ResolvePredicate for CountingPredicate {
    async fn is_resolve_signal(&self, _group: &AlertGroup, _event: &Event) -> Result<bool> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.answer)
    }
}

/// Task scheduler that records jobs so tests can fire them in any order.
#[derive(Default)]
struct RecordingTasks {
    jobs: Mutex<Vec<QueuedJob>>,
}

impl RecordingTasks {
    fn tokens(&self) -> Vec<EvaluationToken> {
        self.jobs
            .lock()
            .iter()
            .map(|job| ResolveEvaluationJob::from_data(&job.data).unwrap().token)
            .collect()
    }
}

#[async_trait]
impl TaskScheduler for RecordingTasks {
    async fn enqueue_after(&self, _delay: Duration, job: QueuedJob) -> Result<()> {
        self.jobs.lock().push(job);
        Ok(())
    }
}

struct Harness {
    scheduler: CoalescingScheduler,
    store: Arc<InMemoryGroupStore>,
    tasks: Arc<RecordingTasks>,
    predicate: Arc<CountingPredicate>,
}

fn harness(max_group_size: usize, answer: bool) -> Harness {
    let store = Arc::new(InMemoryGroupStore::new());
    let tasks = Arc::new(RecordingTasks::default());
    let predicate = CountingPredicate::new(answer);
    let config = EngineConfig {
        debounce: Duration::from_millis(50),
        max_group_size,
        ..EngineConfig::default()
    };
    let scheduler =
        CoalescingScheduler::new(store.clone(), predicate.clone(), tasks.clone(), &config);

    Harness {
        scheduler,
        store,
        tasks,
        predicate,
    }
}

async fn group_with_events(h: &Harness, n: usize) -> GroupId {
    let id = GroupId::new();
    h.store.create_group(id).await.unwrap();
    for i in 0..n {
        h.scheduler
            .record_event(id, json!({ "status": "firing", "n": i }))
            .await
            .unwrap();
    }
    id
}

async fn state_of(h: &Harness, id: GroupId) -> ResolutionState {
    h.store.load(id).await.unwrap().unwrap().resolution_state
}

// ============================================================================
// Coalescing
// ============================================================================

#[tokio::test]
async fn test_three_events_resolve_on_last() {
    let h = harness(100, true);
    let id = group_with_events(&h, 3).await;

    let tokens = h.tasks.tokens();
    assert_eq!(tokens.len(), 3);

    let outcome = h.scheduler.run_evaluation(id, tokens[2]).await.unwrap();
    assert_eq!(outcome, EvaluationOutcome::Resolved);
    assert_eq!(state_of(&h, id).await, ResolutionState::Resolved);

    let group = h.store.load(id).await.unwrap().unwrap();
    assert_eq!(group.resolved_by, Some(ResolvedBy::Source));
    assert!(group.resolved_at.is_some());
}

#[tokio::test]
async fn test_two_schedules_only_second_runs() {
    let h = harness(100, true);
    let id = group_with_events(&h, 1).await;

    let first = h.scheduler.on_event_appended(id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    let second = h.scheduler.on_event_appended(id).await.unwrap();

    assert_eq!(
        h.scheduler.run_evaluation(id, first).await.unwrap(),
        EvaluationOutcome::Superseded
    );
    assert_eq!(
        h.scheduler.run_evaluation(id, second).await.unwrap(),
        EvaluationOutcome::Resolved
    );
    assert_eq!(h.predicate.calls(), 1);
}

#[tokio::test]
async fn test_burst_has_at_most_one_effective_evaluation() {
    let h = harness(1000, true);
    let id = group_with_events(&h, 25).await;

    let mut outcomes = Vec::new();
    for token in h.tasks.tokens() {
        outcomes.push(h.scheduler.run_evaluation(id, token).await.unwrap());
    }

    let effective = outcomes.iter().filter(|o| o.changed_state()).count();
    let superseded = outcomes
        .iter()
        .filter(|o| **o == EvaluationOutcome::Superseded)
        .count();

    assert_eq!(effective, 1);
    assert_eq!(superseded, 24);
    assert_eq!(h.predicate.calls(), 1);
}

#[tokio::test]
async fn test_firing_order_does_not_matter() {
    let h = harness(1000, true);
    let id = group_with_events(&h, 5).await;

    // Deliver the newest first, then the stale ones.
    let mut tokens = h.tasks.tokens();
    tokens.reverse();

    let outcomes: Vec<_> = {
        let mut v = Vec::new();
        for token in tokens {
            v.push(h.scheduler.run_evaluation(id, token).await.unwrap());
        }
        v
    };

    assert_eq!(outcomes[0], EvaluationOutcome::Resolved);
    assert!(outcomes[1..]
        .iter()
        .all(|o| *o == EvaluationOutcome::Superseded));
}

#[tokio::test]
async fn test_duplicate_delivery_is_harmless() {
    let h = harness(100, true);
    let id = group_with_events(&h, 2).await;
    let token = *h.tasks.tokens().last().unwrap();

    assert_eq!(
        h.scheduler.run_evaluation(id, token).await.unwrap(),
        EvaluationOutcome::Resolved
    );
    assert_eq!(
        h.scheduler.run_evaluation(id, token).await.unwrap(),
        EvaluationOutcome::AlreadyTerminal(ResolutionState::Resolved)
    );
    assert_eq!(h.predicate.calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_duplicate_deliveries_resolve_once() {
    let h = Arc::new(harness(100, true));
    let id = group_with_events(&h, 3).await;
    let token = *h.tasks.tokens().last().unwrap();

    let handles = (0..8).map(|_| {
        let h = Arc::clone(&h);
        tokio::spawn(async move { h.scheduler.run_evaluation(id, token).await.unwrap() })
    });

    let mut resolved = 0;
    for outcome in join_all(handles).await {
        let outcome = outcome.unwrap();
        if outcome == EvaluationOutcome::Resolved {
            resolved += 1;
        } else {
            assert_eq!(
                outcome,
                EvaluationOutcome::AlreadyTerminal(ResolutionState::Resolved)
            );
        }
    }

    assert_eq!(resolved, 1);
    assert_eq!(state_of(&h, id).await, ResolutionState::Resolved);
}

#[tokio::test]
async fn test_not_a_signal_keeps_group_open_for_next_cycle() {
    let h = harness(100, false);
    let id = group_with_events(&h, 2).await;
    let token = *h.tasks.tokens().last().unwrap();

    assert_eq!(
        h.scheduler.run_evaluation(id, token).await.unwrap(),
        EvaluationOutcome::NotResolveSignal
    );
    assert_eq!(state_of(&h, id).await, ResolutionState::Open);

    // A later event starts a new cycle.
    h.scheduler.record_event(id, json!({})).await.unwrap();
    let next = *h.tasks.tokens().last().unwrap();
    assert_eq!(
        h.scheduler.run_evaluation(id, next).await.unwrap(),
        EvaluationOutcome::NotResolveSignal
    );
    assert_eq!(h.predicate.calls(), 2);
}

// ============================================================================
// Size Breaker
// ============================================================================

#[tokio::test]
async fn test_exactly_max_group_size_is_evaluated() {
    let h = harness(100, true);
    let id = group_with_events(&h, 100).await;
    let token = *h.tasks.tokens().last().unwrap();

    assert_eq!(
        h.scheduler.run_evaluation(id, token).await.unwrap(),
        EvaluationOutcome::Resolved
    );
    assert_eq!(h.predicate.calls(), 1);
}

#[tokio::test]
async fn test_one_over_max_trips_without_predicate() {
    let h = harness(100, true);
    let id = group_with_events(&h, 101).await;
    let token = *h.tasks.tokens().last().unwrap();

    assert_eq!(
        h.scheduler.run_evaluation(id, token).await.unwrap(),
        EvaluationOutcome::BreakerTripped { size: 101 }
    );
    assert_eq!(state_of(&h, id).await, ResolutionState::AutoResolveSuspended);
    assert_eq!(h.predicate.calls(), 0);
}

#[tokio::test]
async fn test_suspension_is_sticky() {
    let h = harness(3, true);
    let id = group_with_events(&h, 4).await;
    let token = *h.tasks.tokens().last().unwrap();
    h.scheduler.run_evaluation(id, token).await.unwrap();
    assert_eq!(state_of(&h, id).await, ResolutionState::AutoResolveSuspended);

    for _ in 0..5 {
        h.scheduler
            .record_event(id, json!({ "status": "resolved" }))
            .await
            .unwrap();
        let token = *h.tasks.tokens().last().unwrap();
        assert_eq!(
            h.scheduler.run_evaluation(id, token).await.unwrap(),
            EvaluationOutcome::AlreadyTerminal(ResolutionState::AutoResolveSuspended)
        );
    }

    assert_eq!(state_of(&h, id).await, ResolutionState::AutoResolveSuspended);
    assert_eq!(h.predicate.calls(), 0);
}

#[tokio::test]
async fn test_manual_resolve_after_suspension() {
    let h = harness(1, true);
    let id = group_with_events(&h, 2).await;
    let token = *h.tasks.tokens().last().unwrap();
    h.scheduler.run_evaluation(id, token).await.unwrap();

    assert!(h.scheduler.force_resolve(id).await.unwrap());

    let group = h.store.load(id).await.unwrap().unwrap();
    assert_eq!(group.resolution_state, ResolutionState::Resolved);
    assert_eq!(group.resolved_by, Some(ResolvedBy::User));
    assert!(group.suspended_at.is_some());
}

// ============================================================================
// Resolution Executor
// ============================================================================

#[tokio::test]
async fn test_attempt_resolve_twice_is_noop() {
    let h = harness(100, true);
    let id = group_with_events(&h, 1).await;
    let predicate = CountingPredicate::new(true);
    let executor = ResolutionExecutor::new(h.store.clone(), predicate.clone());

    let mut group = h.store.load(id).await.unwrap().unwrap();
    assert_eq!(
        executor.attempt_resolve(&mut group).await.unwrap(),
        ResolveAttempt::Resolved
    );
    let snapshot = h.store.load(id).await.unwrap().unwrap();

    let mut reloaded = h.store.load(id).await.unwrap().unwrap();
    assert_eq!(
        executor.attempt_resolve(&mut reloaded).await.unwrap(),
        ResolveAttempt::AlreadyTerminal(ResolutionState::Resolved)
    );

    assert_eq!(predicate.calls(), 1);
    assert_eq!(h.store.load(id).await.unwrap().unwrap(), snapshot);
}

// ============================================================================
// Missing Groups
// ============================================================================

#[tokio::test]
async fn test_deleted_group_reports_not_found() {
    let h = harness(100, true);
    let id = group_with_events(&h, 2).await;
    let token = *h.tasks.tokens().last().unwrap();

    assert!(h.store.delete_group(id).await.unwrap());

    assert_eq!(
        h.scheduler.run_evaluation(id, token).await.unwrap(),
        EvaluationOutcome::GroupNotFound
    );
    assert_eq!(h.predicate.calls(), 0);
}

#[tokio::test]
async fn test_record_event_on_missing_group_fails() {
    let h = harness(100, true);
    assert!(h
        .scheduler
        .record_event(GroupId::new(), json!({}))
        .await
        .is_err());
    assert!(h.tasks.tokens().is_empty());
}
