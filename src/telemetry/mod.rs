//! Logging, tracing, and metrics setup.
//!
//! Logs always go to stderr through tracing-subscriber. When an OTLP
//! endpoint is configured, traces, metrics, and logs are also exported
//! over gRPC; without one, metric instruments stay no-ops.

pub mod metrics;
pub mod spans;

use crate::error::{Error, Result};
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig as _;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::logs::SdkLoggerProvider;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::trace::SdkTracerProvider;

/// Configuration for telemetry initialization.
pub struct TelemetryConfig {
    /// Optional OTLP endpoint (e.g. "http://localhost:4317").
    pub endpoint: Option<String>,
    /// The service name reported in telemetry signals.
    pub service_name: String,
    /// Filter directive used when `RUST_LOG` is unset (e.g. "info").
    pub default_level: String,
}

/// Flushes and shuts down the OTel providers when dropped.
///
/// Hold it for the lifetime of the process.
#[derive(Default)]
pub struct TelemetryGuard {
    exporters: Option<Exporters>,
}

struct Exporters {
    tracer: SdkTracerProvider,
    meter: SdkMeterProvider,
    logger: SdkLoggerProvider,
}

impl TelemetryGuard {
    /// Whether signals are exported over OTLP.
    pub fn is_exporting(&self) -> bool {
        self.exporters.is_some()
    }

    /// Force-flush all telemetry pipelines.
    pub fn force_flush(&self) {
        if let Some(exporters) = &self.exporters {
            let _ = exporters.tracer.force_flush();
            let _ = exporters.meter.force_flush();
            let _ = exporters.logger.force_flush();
        }
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        // Logs first so shutdown messages from the other providers still go out.
        if let Some(exporters) = self.exporters.take() {
            let _ = exporters.logger.shutdown();
            let _ = exporters.meter.shutdown();
            let _ = exporters.tracer.shutdown();
        }
    }
}

/// Install the global tracing subscriber and, if configured, OTLP exporters.
///
/// # Errors
///
/// Fails if an exporter cannot be built or a global subscriber is already set.
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard> {
    use opentelemetry::trace::TracerProvider as _;
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::layer::SubscriberExt as _;
    use tracing_subscriber::util::SubscriberInitExt as _;

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.default_level));

    let Some(endpoint) = config.endpoint else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
            .map_err(|e| Error::Other(format!("failed to init tracing subscriber: {e}")))?;
        return Ok(TelemetryGuard::default());
    };

    let resource = Resource::builder()
        .with_service_name(config.service_name)
        .with_attribute(KeyValue::new(
            opentelemetry_semantic_conventions::resource::SERVICE_VERSION,
            env!("CARGO_PKG_VERSION"),
        ))
        .build();

    let exporters = Exporters {
        tracer: tracer_provider(&endpoint, resource.clone())?,
        meter: meter_provider(&endpoint, resource.clone())?,
        logger: logger_provider(&endpoint, resource)?,
    };
    opentelemetry::global::set_meter_provider(exporters.meter.clone());

    let trace_layer =
        tracing_opentelemetry::layer().with_tracer(exporters.tracer.tracer("jobgate"));
    let log_layer = opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge::new(
        &exporters.logger,
    );

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().compact())
        .with(trace_layer)
        .with(log_layer)
        .try_init()
        .map_err(|e| Error::Other(format!("failed to init tracing subscriber: {e}")))?;

    Ok(TelemetryGuard {
        exporters: Some(exporters),
    })
}

fn exporter_error(signal: &str, e: impl std::fmt::Display) -> Error {
    Error::Other(format!("failed to create OTLP {signal} exporter: {e}"))
}

fn tracer_provider(endpoint: &str, resource: Resource) -> Result<SdkTracerProvider> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| exporter_error("span", e))?;
    Ok(SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(resource)
        .build())
}

fn meter_provider(endpoint: &str, resource: Resource) -> Result<SdkMeterProvider> {
    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| exporter_error("metric", e))?;
    Ok(SdkMeterProvider::builder()
        .with_periodic_exporter(exporter)
        .with_resource(resource)
        .build())
}

fn logger_provider(endpoint: &str, resource: Resource) -> Result<SdkLoggerProvider> {
    let exporter = opentelemetry_otlp::LogExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| exporter_error("log", e))?;
    Ok(SdkLoggerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(resource)
        .build())
}
