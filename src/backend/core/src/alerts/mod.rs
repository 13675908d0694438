//! Alert group auto-resolution.
//!
//! ```text
//!  event appended
//!       │
//!       ▼
//!  CoalescingScheduler::schedule_evaluation ── stamp token ──▶ GroupStore
//!       │
//!       └── enqueue_after(debounce) ──▶ job queue ──▶ EvaluationHandler
//!                                                         │
//!                                                         ▼
//!                                     run_evaluation: load → token check →
//!                                     state check → SizeCircuitBreaker →
//!                                     ResolutionExecutor (ResolvePredicate)
//! ```

pub mod breaker;
pub mod executor;
pub mod group;
pub mod job;
pub mod predicate;
pub mod scheduler;
pub mod store;

pub use breaker::{SizeCheck, SizeCircuitBreaker};
pub use executor::{ResolutionExecutor, ResolveAttempt};
pub use group::{AlertGroup, EvaluationToken, Event, GroupId, ResolutionState, ResolvedBy};
pub use job::{EvaluationHandler, ResolveEvaluationJob};
pub use predicate::{CompiledCondition, PayloadConditionPredicate, ResolveCondition, ResolvePredicate};
pub use scheduler::{CoalescingScheduler, EvaluationOutcome};
pub use store::{CasResult, GroupStore, InMemoryGroupStore, PgGroupStore, TokenStamp};
