use std::error::Error;

use opentelemetry::{global, metrics::MetricsError, trace::TraceError, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{runtime, trace::Tracer, Resource};
use tracing_core::LevelFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry};

use crate::config::TelemetryConfig;

/// Sets up logging, and when an OTLP endpoint is configured, span and metric
/// export. Trace events and audit failures are emitted through what this
/// installs.
///
/// This should generally be the first statement of any server binary's main
/// function.
pub fn setup(config: &TelemetryConfig) -> Result<(), Box<dyn Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .from_env_lossy()
    });

    let fmt = if config.json {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };

    let telemetry = match &config.otlp_endpoint {
        Some(endpoint) => {
            init_metrics(&config.service_name, endpoint)?;
            let tracer = init_tracer(&config.service_name, endpoint)?;
            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };

    Registry::default()
        .with(filter)
        .with(fmt)
        .with(telemetry)
        .try_init()?;

    tracing::info!(service = %config.service_name, "starting server");
    Ok(())
}

fn resource(service: &str) -> Resource {
    Resource::new(vec![KeyValue::new(
        opentelemetry_semantic_conventions::resource::SERVICE_NAME,
        service.to_string(),
    )])
}

fn init_tracer(service: &str, endpoint: &str) -> Result<Tracer, TraceError> {
    opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint),
        )
        .with_trace_config(opentelemetry_sdk::trace::config().with_resource(resource(service)))
        .install_batch(runtime::Tokio)
}

// Installs the global meter provider the audit failure counter reports to.
fn init_metrics(service: &str, endpoint: &str) -> Result<(), MetricsError> {
    let _meter = opentelemetry_otlp::new_pipeline()
        .metrics(runtime::Tokio)
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint),
        )
        .with_resource(resource(service))
        .build()?;

    Ok(())
}

pub fn teardown() {
    global::shutdown_tracer_provider();
}
