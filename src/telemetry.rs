//! Tracing setup: env-filtered stderr logging with optional OTLP export
//!
//! Logs go to stderr so progress output on stdout stays readable. Set
//! `RUST_LOG` to adjust verbosity and `OTEL_EXPORTER_OTLP_ENDPOINT` to ship
//! spans to an OpenTelemetry collector.

use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::Tracer;
use opentelemetry_sdk::{runtime, Resource};
use tracing::{Level, Subscriber};
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::error::{Error, Result};

const SERVICE_NAME: &str = "ceph-maint";

/// Output format of the stderr log layer
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Flushes pending spans when dropped, on every exit path
#[must_use = "dropping the guard shuts tracing down"]
#[derive(Debug)]
pub struct TracingGuard {
    otel_enabled: bool,
}

impl TracingGuard {
    pub fn otel_enabled(&self) -> bool {
        self.otel_enabled
    }
}

impl Drop for TracingGuard {
    fn drop(&mut self) {
        if self.otel_enabled {
            shutdown_tracing();
        }
    }
}

/// Install the global tracing subscriber
pub fn init_tracing(format: LogFormat) -> Result<TracingGuard> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    let (json_layer, text_layer) = match format {
        LogFormat::Json => (
            Some(fmt::layer().json().with_writer(std::io::stderr)),
            None,
        ),
        LogFormat::Text => (
            None,
            Some(
                fmt::layer()
                    .with_target(true)
                    .with_writer(std::io::stderr),
            ),
        ),
    };

    // Only enable OTEL when a collector endpoint is configured
    let otel_layer = match std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT") {
        Ok(endpoint) => Some(otel_layer(&endpoint)?),
        Err(_) => None,
    };
    let otel_enabled = otel_layer.is_some();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(text_layer)
        .with(otel_layer)
        .try_init()
        .map_err(|e| Error::ConfigError(format!("failed to install tracing subscriber: {e}")))?;

    if otel_enabled {
        tracing::info!("OpenTelemetry tracing initialized");
    }
    Ok(TracingGuard { otel_enabled })
}

/// Flush pending spans before exit
pub fn shutdown_tracing() {
    opentelemetry::global::shutdown_tracer_provider();
}

fn otel_layer<S>(endpoint: &str) -> Result<OpenTelemetryLayer<S, Tracer>>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint),
        )
        .with_trace_config(
            opentelemetry_sdk::trace::config()
                .with_resource(Resource::new(vec![KeyValue::new("service.name", SERVICE_NAME)])),
        )
        .install_batch(runtime::Tokio)
        .map_err(|e| Error::ConfigError(format!("failed to install OTLP exporter: {e}")))?;

    Ok(tracing_opentelemetry::layer().with_tracer(tracer))
}
