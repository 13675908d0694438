//! Prometheus metrics for evaluation outcomes, breaker trips, and job processing.
//!
//! Recording goes through the `metrics` facade, so the helpers here are no-ops
//! until [`init_metrics`] installs a recorder.

use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;

use super::TelemetryConfig;

const EVALUATION_DURATION: &str = "autoresolve_evaluation_duration_seconds";

/// Holds the Prometheus handle when metrics are enabled.
#[derive(Default)]
pub struct MetricsRegistry {
    prometheus_handle: Option<PrometheusHandle>,
}

impl std::fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRegistry")
            .field("prometheus_handle", &self.prometheus_handle.is_some())
            .finish()
    }
}

impl MetricsRegistry {
    /// Render all metrics in Prometheus text format.
    pub fn render(&self) -> String {
        self.prometheus_handle
            .as_ref()
            .map(|h| h.render())
            .unwrap_or_default()
    }
}

/// Install the Prometheus recorder and spawn its scrape listener.
///
/// Must be called from within a tokio runtime when metrics are enabled.
pub fn init_metrics(config: &TelemetryConfig) -> anyhow::Result<MetricsRegistry> {
    if !config.metrics_enabled {
        return Ok(MetricsRegistry::default());
    }

    let listen: SocketAddr = config.metrics_listen.parse()?;
    let (recorder, exporter) = PrometheusBuilder::new()
        .with_http_listener(listen)
        .add_global_label("service", config.service_name.clone())
        .set_buckets_for_metric(
            Matcher::Full(EVALUATION_DURATION.to_string()),
            &[0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0],
        )?
        .build()?;

    let handle = recorder.handle();
    metrics::set_global_recorder(recorder)
        .map_err(|_| anyhow::anyhow!("a global metrics recorder is already installed"))?;

    tokio::spawn(async move {
        if let Err(e) = exporter.await {
            tracing::error!(error = ?e, "Prometheus exporter stopped");
        }
    });

    register_metric_descriptions();

    tracing::info!(listen = %listen, "Metrics initialized");

    Ok(MetricsRegistry {
        prometheus_handle: Some(handle),
    })
}

fn register_metric_descriptions() {
    describe_counter!(
        "autoresolve_evaluations_scheduled_total",
        "Deferred evaluations scheduled (one per appended event)"
    );
    describe_counter!(
        "autoresolve_evaluations_total",
        "Finished evaluations by outcome code"
    );
    describe_histogram!(EVALUATION_DURATION, "Evaluation wall time in seconds");
    describe_counter!(
        "autoresolve_breaker_trips_total",
        "Groups suspended from auto-resolve for exceeding the size limit"
    );
    describe_counter!("autoresolve_jobs_total", "Worker job results by status");
    describe_counter!("autoresolve_errors_total", "Errors by code and severity");
}

/// Counters and timings for the evaluation path.
pub struct EvaluationMetrics;

impl EvaluationMetrics {
    pub fn record_scheduled() {
        counter!("autoresolve_evaluations_scheduled_total").increment(1);
    }

    /// Record a finished evaluation with its outcome code.
    pub fn record_outcome(outcome: &'static str, elapsed: Duration) {
        counter!("autoresolve_evaluations_total", "outcome" => outcome).increment(1);
        histogram!(EVALUATION_DURATION, "outcome" => outcome).record(elapsed.as_secs_f64());
    }

    pub fn record_breaker_trip() {
        counter!("autoresolve_breaker_trips_total").increment(1);
    }
}

/// Counters for the job worker.
pub struct JobMetrics;

impl JobMetrics {
    /// `status` is one of `completed`, `retried`, `dead`.
    pub fn record(job_type: &str, status: &'static str) {
        counter!(
            "autoresolve_jobs_total",
            "job_type" => job_type.to_string(),
            "status" => status,
        )
        .increment(1);
    }
}
