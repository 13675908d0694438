//! Structured logging with JSON, pretty, and compact formats.

use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log output format.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON format for production/structured logging
    #[default]
    Json,
    /// Pretty format for development
    Pretty,
    /// Compact single-line format
    Compact,
}

/// Build the env filter: `RUST_LOG` wins, otherwise the configured directive.
fn build_filter(level: &str) -> anyhow::Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => Ok(EnvFilter::try_new(level)?),
    }
}

/// Install the global subscriber.
///
/// When `tracer` is given, spans are also exported through OpenTelemetry.
pub fn init_logging(
    level: &str,
    format: &LogFormat,
    tracer: Option<opentelemetry_sdk::trace::Tracer>,
) -> anyhow::Result<()> {
    let filter = build_filter(level)?;
    let otel_layer = tracer.map(|t| tracing_opentelemetry::layer().with_tracer(t));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(otel_layer)
                .with(fmt::layer().json().with_target(true))
                .try_init()?;
        }
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(filter)
                .with(otel_layer)
                .with(fmt::layer().pretty())
                .try_init()?;
        }
        LogFormat::Compact => {
            tracing_subscriber::registry()
                .with(filter)
                .with(otel_layer)
                .with(fmt::layer().compact())
                .try_init()?;
        }
    }

    Ok(())
}
