//! End-to-end tests: scheduler, delayed queue and job worker with real delays.
//!
//! Tests cover:
//! - Debounced bursts resolving through the worker
//! - Retry of transient store failures with the same token
//! - Dead-lettering after exhausted retries, leaving the group open

use async_trait::async_trait;
use autoresolve_core::alerts::{
    AlertGroup, CasResult, CoalescingScheduler, EvaluationHandler, EvaluationToken, Event,
    GroupId, GroupStore, InMemoryGroupStore, PayloadConditionPredicate, ResolutionState,
    ResolveCondition, ResolveEvaluationJob, TokenStamp,
};
use autoresolve_core::config::EngineConfig;
use autoresolve_core::error::{AutoResolveError, Result};
use autoresolve_core::jobs::{
    BackoffStrategy, JobQueue, JobWorker, RetryPolicy, WorkerConfig, WorkerHandle,
};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Test Fixtures
// ============================================================================

/// Store whose `load` fails a configured number of times before delegating.
struct FlakyStore {
    inner: InMemoryGroupStore,
    failures_left: AtomicUsize,
    loads: AtomicUsize,
}

impl FlakyStore {
    fn new(failures: usize) -> Self {
        Self {
            inner: InMemoryGroupStore::new(),
            failures_left: AtomicUsize::new(failures),
            loads: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl GroupStore for FlakyStore {
    async fn create_group(&self, id: GroupId) -> Result<AlertGroup> {
        self.inner.create_group(id).await
    }

    async fn load(&self, id: GroupId) -> Result<Option<AlertGroup>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        let fail = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(AutoResolveError::store("connection reset by peer", true));
        }
        self.inner.load(id).await
    }

    async fn size(&self, id: GroupId) -> Result<usize> {
        self.inner.size(id).await
    }

    async fn last_event(&self, id: GroupId) -> Result<Option<Event>> {
        self.inner.last_event(id).await
    }

    async fn append_event(&self, id: GroupId, payload: serde_json::Value) -> Result<Event> {
        self.inner.append_event(id, payload).await
    }

    async fn remove_event(&self, id: GroupId, seq: u64) -> Result<bool> {
        self.inner.remove_event(id, seq).await
    }

    async fn stamp_token(&self, id: GroupId, token: EvaluationToken) -> Result<TokenStamp> {
        self.inner.stamp_token(id, token).await
    }

    async fn restore_token(
        &self,
        id: GroupId,
        stamped: EvaluationToken,
        previous: Option<EvaluationToken>,
    ) -> Result<bool> {
        self.inner.restore_token(id, stamped, previous).await
    }

    async fn save(
        &self,
        group: &AlertGroup,
        expected_state: ResolutionState,
        expected_token: Option<EvaluationToken>,
    ) -> Result<CasResult> {
        self.inner.save(group, expected_state, expected_token).await
    }

    async fn delete_group(&self, id: GroupId) -> Result<bool> {
        self.inner.delete_group(id).await
    }
}

struct Running {
    scheduler: Arc<CoalescingScheduler>,
    store: Arc<dyn GroupStore>,
    queue: Arc<JobQueue>,
    worker: WorkerHandle,
}

fn start(
    store: Arc<dyn GroupStore>,
    debounce_ms: u64,
    max_attempts: u32,
    retry_delay_ms: u64,
) -> Running {
    let queue = Arc::new(JobQueue::in_memory());
    let predicate =
        Arc::new(PayloadConditionPredicate::new(&ResolveCondition::default()).unwrap());
    let config = EngineConfig {
        debounce: Duration::from_millis(debounce_ms),
        max_group_size: 50,
        ..EngineConfig::default()
    };
    let scheduler = Arc::new(CoalescingScheduler::new(
        store.clone(),
        predicate,
        queue.clone(),
        &config,
    ));

    let retry = RetryPolicy::with_attempts(max_attempts).with_backoff(BackoffStrategy::fixed(retry_delay_ms));
    let handler = Arc::new(EvaluationHandler::new(scheduler.clone(), retry));
    let worker = JobWorker::new(
        WorkerConfig {
            concurrency: 4,
            poll_interval_ms: 5,
            shutdown_timeout_secs: 1,
            name: "integration-worker".to_string(),
        },
        queue.clone(),
    )
    .register(handler)
    .start();

    Running {
        scheduler,
        store,
        queue,
        worker,
    }
}

async fn wait_for(mut done: impl FnMut() -> bool) {
    for _ in 0..400 {
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// ============================================================================
// Debounced Resolution
// ============================================================================

#[tokio::test]
async fn test_burst_resolves_once_through_worker() {
    let rt = start(Arc::new(InMemoryGroupStore::new()), 60, 3, 10);
    let id = GroupId::new();
    rt.store.create_group(id).await.unwrap();

    for i in 0..5 {
        let status = if i == 4 { "resolved" } else { "firing" };
        rt.scheduler
            .record_event(id, json!({ "status": status }))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    wait_for(|| rt.worker.stats().succeeded() == 5).await;
    assert_eq!(rt.worker.stats().succeeded(), 5);

    let group = rt.store.load(id).await.unwrap().unwrap();
    assert_eq!(group.resolution_state, ResolutionState::Resolved);

    rt.worker.stop().await;
}

#[tokio::test]
async fn test_resolve_signal_followed_by_firing_stays_open() {
    let rt = start(Arc::new(InMemoryGroupStore::new()), 30, 3, 10);
    let id = GroupId::new();
    rt.store.create_group(id).await.unwrap();

    // The resolve signal is superseded by a newer firing event.
    rt.scheduler
        .record_event(id, json!({ "status": "resolved" }))
        .await
        .unwrap();
    rt.scheduler
        .record_event(id, json!({ "status": "firing" }))
        .await
        .unwrap();

    wait_for(|| rt.worker.stats().succeeded() == 2).await;
    assert_eq!(rt.worker.stats().succeeded(), 2);

    let group = rt.store.load(id).await.unwrap().unwrap();
    assert_eq!(group.resolution_state, ResolutionState::Open);

    rt.worker.stop().await;
}

// ============================================================================
// Retry and Dead Letter
// ============================================================================

#[tokio::test]
async fn test_transient_failure_is_retried_with_same_token() {
    let store = Arc::new(FlakyStore::new(2));
    let rt = start(store.clone(), 10, 5, 10);
    let id = GroupId::new();
    rt.store.create_group(id).await.unwrap();

    rt.scheduler
        .record_event(id, json!({ "status": "resolved" }))
        .await
        .unwrap();

    wait_for(|| rt.worker.stats().succeeded() == 1).await;
    assert_eq!(rt.worker.stats().retried(), 2);
    assert_eq!(rt.worker.stats().dead_lettered(), 0);

    let group = store.inner.load(id).await.unwrap().unwrap();
    assert_eq!(group.resolution_state, ResolutionState::Resolved);

    rt.worker.stop().await;
}

#[tokio::test]
async fn test_exhausted_retries_dead_letter_and_leave_group_open() {
    let store = Arc::new(FlakyStore::new(usize::MAX));
    let rt = start(store.clone(), 10, 3, 10);
    let id = GroupId::new();
    rt.store.create_group(id).await.unwrap();

    let token = rt.scheduler.on_event_appended(id).await.unwrap();

    wait_for(|| rt.worker.stats().dead_lettered() == 1).await;
    rt.worker.stop().await;

    assert_eq!(store.loads.load(Ordering::SeqCst), 3);

    let dead = rt.queue.drain_dead_letters().await;
    assert_eq!(dead.len(), 1);
    let payload = ResolveEvaluationJob::from_data(&dead[0].data).unwrap();
    assert_eq!(payload.group_id, id);
    assert_eq!(payload.token, token);

    let group = store.inner.load(id).await.unwrap().unwrap();
    assert_eq!(group.resolution_state, ResolutionState::Open);
}

#[tokio::test]
async fn test_retry_of_superseded_evaluation_is_discarded() {
    let store = Arc::new(FlakyStore::new(1));
    let rt = start(store.clone(), 10, 5, 200);
    let id = GroupId::new();
    rt.store.create_group(id).await.unwrap();

    rt.scheduler
        .record_event(id, json!({ "status": "resolved" }))
        .await
        .unwrap();

    // The first attempt fails; a newer event lands before the retry.
    wait_for(|| rt.worker.stats().retried() == 1).await;
    rt.scheduler
        .record_event(id, json!({ "status": "firing" }))
        .await
        .unwrap();

    wait_for(|| rt.worker.stats().succeeded() == 2).await;
    assert_eq!(rt.worker.stats().succeeded(), 2);

    let group = store.inner.load(id).await.unwrap().unwrap();
    assert_eq!(group.resolution_state, ResolutionState::Open);

    rt.worker.stop().await;
}
