#![allow(clippy::result_large_err)]
//! # Autoresolve Core
//!
//! Debounced, coalescing auto-resolve engine for alert groups.
//!
//! ## Architecture
//!
//! - **Alerts**: group state machine, evaluation tokens, size circuit breaker,
//!   resolution executor and the coalescing scheduler
//! - **Jobs**: delayed job queue (in-memory or Redis) and the worker pool that
//!   runs deferred evaluations with retry and dead-lettering
//! - **Telemetry**: structured logging, optional OTLP export, Prometheus metrics
//! - **Config**: layered file and environment configuration

pub mod alerts;
pub mod config;
pub mod error;
pub mod jobs;
pub mod telemetry;

pub use error::{AutoResolveError, ErrorCode, ErrorContext, ErrorDetails, ErrorSeverity, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::alerts::{
        AlertGroup, CoalescingScheduler, EvaluationHandler, EvaluationOutcome, EvaluationToken,
        Event, GroupId, GroupStore, InMemoryGroupStore, PayloadConditionPredicate,
        ResolutionState, ResolveCondition, ResolvePredicate, ResolvedBy,
    };
    pub use crate::config::Config;
    pub use crate::error::{AutoResolveError, ErrorCode, ErrorContext, Result};
    pub use crate::jobs::{JobQueue, JobWorker, RetryPolicy, TaskScheduler, WorkerConfig};
}
