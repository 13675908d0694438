//! Telemetry: structured logging, optional OTLP span export, and Prometheus metrics.
//!
//! # Example
//!
//! ```rust,no_run
//! use autoresolve_core::telemetry::{TelemetryConfig, init_telemetry};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let handle = init_telemetry(&TelemetryConfig::default())?;
//! handle.shutdown();
//! # Ok(())
//! # }
//! ```

pub mod logging;
pub mod metrics;
pub mod otlp;

pub use logging::{init_logging, LogFormat};
pub use metrics::{init_metrics, EvaluationMetrics, JobMetrics, MetricsRegistry};
pub use otlp::{build_otlp_tracer, shutdown_tracing};

use serde::Deserialize;

/// Unified telemetry configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
    /// Service name attached to spans and logs
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// Default log directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub log_format: LogFormat,

    /// OTLP collector endpoint; span export is off when unset
    #[serde(default)]
    pub otlp_endpoint: Option<String>,

    #[serde(default)]
    pub metrics_enabled: bool,

    #[serde(default = "default_metrics_listen")]
    pub metrics_listen: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            otlp_endpoint: None,
            metrics_enabled: false,
            metrics_listen: default_metrics_listen(),
        }
    }
}

fn default_service_name() -> String {
    "autoresolve-core".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_listen() -> String {
    "0.0.0.0:9090".to_string()
}

/// Initialize the complete telemetry stack.
///
/// Call once at process start, from inside a tokio runtime.
pub fn init_telemetry(config: &TelemetryConfig) -> anyhow::Result<TelemetryHandle> {
    let metrics = init_metrics(config)?;

    let tracer = match config.otlp_endpoint.as_deref() {
        Some(endpoint) => Some(build_otlp_tracer(endpoint, &config.service_name)?),
        None => None,
    };
    let otlp_enabled = tracer.is_some();

    init_logging(&config.log_level, &config.log_format, tracer)?;

    ::tracing::info!(
        service_name = %config.service_name,
        otlp_enabled,
        metrics_enabled = config.metrics_enabled,
        "Telemetry initialized"
    );

    Ok(TelemetryHandle {
        metrics,
        otlp_enabled,
    })
}

/// Handle for managing telemetry lifecycle.
pub struct TelemetryHandle {
    pub metrics: MetricsRegistry,
    otlp_enabled: bool,
}

impl TelemetryHandle {
    /// Flush remaining spans.
    pub fn shutdown(self) {
        if self.otlp_enabled {
            shutdown_tracing();
        }
        ::tracing::info!("Telemetry shutdown complete");
    }
}
