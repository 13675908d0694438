//! Configuration management.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::alerts::ResolveCondition;
use crate::error::{AutoResolveError, Result};
use crate::jobs::{BackoffStrategy, RetryPolicy, WorkerConfig};
use crate::telemetry::{LogFormat, TelemetryConfig};

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Evaluation engine configuration
    #[serde(default)]
    pub engine: EngineConfig,

    /// Job worker configuration
    #[serde(default)]
    pub worker: WorkerSection,

    /// Delayed job queue configuration
    #[serde(default)]
    pub queue: QueueSection,

    /// Group store configuration
    #[serde(default)]
    pub store: StoreSection,

    /// Resolve condition applied to the last event of a group
    #[serde(default)]
    pub predicate: ResolveCondition,

    /// Logging, tracing and metrics
    #[serde(default)]
    pub telemetry: TelemetrySection,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// How long to wait after the latest event before evaluating
    #[serde(default = "default_debounce", with = "humantime_serde")]
    pub debounce: Duration,

    /// Groups with more events than this stop auto-resolving
    #[serde(default = "default_max_group_size")]
    pub max_group_size: usize,

    /// Upper bound on a single resolve predicate call
    #[serde(default = "default_predicate_timeout", with = "humantime_serde")]
    pub predicate_timeout: Duration,

    /// Retry policy for transient evaluation failures
    #[serde(default)]
    pub retry: RetrySection,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            debounce: default_debounce(),
            max_group_size: default_max_group_size(),
            predicate_timeout: default_predicate_timeout(),
            retry: RetrySection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetrySection {
    /// Total attempts including the first one
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
        }
    }
}

impl RetrySection {
    /// Build the job retry policy described by this section.
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            backoff: BackoffStrategy::Exponential {
                initial_delay_ms: self.initial_delay_ms,
                max_delay_ms: self.max_delay_ms,
                multiplier: self.multiplier,
            },
            retry_on_any_error: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkerSection {
    /// Maximum concurrent evaluations
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Queue poll interval in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Grace period for in-flight evaluations on shutdown
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,

    #[serde(default = "default_worker_name")]
    pub name: String,
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            poll_interval_ms: default_poll_interval_ms(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            name: default_worker_name(),
        }
    }
}

impl WorkerSection {
    pub fn to_worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            concurrency: self.concurrency,
            poll_interval_ms: self.poll_interval_ms,
            shutdown_timeout_secs: self.shutdown_timeout_secs,
            name: self.name.clone(),
        }
    }
}

/// Which delayed queue implementation to run against.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum QueueBackendKind {
    #[default]
    Memory,
    Redis,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueueSection {
    #[serde(default)]
    pub backend: QueueBackendKind,

    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Sorted-set key holding delayed jobs
    #[serde(default = "default_queue_key")]
    pub queue_key: String,

    #[serde(default = "default_dead_letter_max_size")]
    pub dead_letter_max_size: usize,
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            backend: QueueBackendKind::default(),
            redis_url: default_redis_url(),
            queue_key: default_queue_key(),
            dead_letter_max_size: default_dead_letter_max_size(),
        }
    }
}

/// Which group store implementation to run against.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackendKind {
    #[default]
    Memory,
    Postgres,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StoreSection {
    #[serde(default)]
    pub backend: StoreBackendKind,

    /// PostgreSQL connection URL (required for the postgres backend)
    pub database_url: Option<String>,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            backend: StoreBackendKind::default(),
            database_url: None,
            max_connections: default_max_connections(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TelemetrySection {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub log_format: LogFormat,

    /// OpenTelemetry OTLP endpoint
    pub otlp_endpoint: Option<String>,

    #[serde(default = "default_metrics_enabled")]
    pub metrics_enabled: bool,

    /// Address for the Prometheus scrape listener
    #[serde(default = "default_metrics_listen")]
    pub metrics_listen: String,
}

impl Default for TelemetrySection {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            otlp_endpoint: None,
            metrics_enabled: default_metrics_enabled(),
            metrics_listen: default_metrics_listen(),
        }
    }
}

impl TelemetrySection {
    pub fn to_telemetry_config(&self, service_name: &str) -> TelemetryConfig {
        TelemetryConfig {
            service_name: service_name.to_string(),
            log_level: self.log_level.clone(),
            log_format: self.log_format.clone(),
            otlp_endpoint: self.otlp_endpoint.clone(),
            metrics_enabled: self.metrics_enabled,
            metrics_listen: self.metrics_listen.clone(),
        }
    }
}

// Default value functions
fn default_debounce() -> Duration { Duration::from_secs(5) }
fn default_max_group_size() -> usize { 500 }
fn default_predicate_timeout() -> Duration { Duration::from_secs(10) }
fn default_max_attempts() -> u32 { 5 }
fn default_initial_delay_ms() -> u64 { 500 }
fn default_max_delay_ms() -> u64 { 30_000 }
fn default_multiplier() -> f64 { 2.0 }
fn default_concurrency() -> usize { 8 }
fn default_poll_interval_ms() -> u64 { 50 }
fn default_shutdown_timeout_secs() -> u64 { 30 }
fn default_worker_name() -> String { "autoresolve-worker".to_string() }
fn default_redis_url() -> String { "redis://localhost:6379".to_string() }
fn default_queue_key() -> String { "autoresolve:evaluations".to_string() }
fn default_dead_letter_max_size() -> usize { 1000 }
fn default_max_connections() -> u32 { 10 }
fn default_log_level() -> String { "info".to_string() }
fn default_metrics_enabled() -> bool { false }
fn default_metrics_listen() -> String { "0.0.0.0:9090".to_string() }

impl Config {
    /// Load configuration from the environment.
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("AUTORESOLVE").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from `path` if given, otherwise from the environment alone.
    ///
    /// With no file and no `AUTORESOLVE__*` variables this yields the
    /// defaults; a source that is present but invalid is an error.
    pub fn load_from(path: Option<&str>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => Self::load(),
        }
    }

    /// Load from a specific file path, with environment overrides on top.
    pub fn from_file(path: &str) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("AUTORESOLVE").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.engine.max_group_size == 0 {
            return Err(AutoResolveError::configuration(
                "engine.max_group_size must be greater than zero",
            ));
        }
        if self.engine.predicate_timeout.is_zero() {
            return Err(AutoResolveError::configuration(
                "engine.predicate_timeout must be greater than zero",
            ));
        }
        if self.engine.retry.max_attempts == 0 {
            return Err(AutoResolveError::configuration(
                "engine.retry.max_attempts must be at least 1",
            ));
        }
        if self.worker.concurrency == 0 {
            return Err(AutoResolveError::configuration(
                "worker.concurrency must be greater than zero",
            ));
        }
        if self.store.backend == StoreBackendKind::Postgres && self.store.database_url.is_none() {
            return Err(AutoResolveError::configuration(
                "store.database_url is required for the postgres backend",
            ));
        }
        self.predicate.compile()?;
        Ok(())
    }
}
