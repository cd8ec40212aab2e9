//! Logging and OpenTelemetry export for the consumer process.
//!
//! Log lines always go to stderr through a `tracing-subscriber` fmt layer
//! filtered by `RUST_LOG` (or [`TelemetryConfig::default_filter`]). Given an
//! OTLP endpoint, the per-message `message.dispatch` spans, the dispatch
//! counters in [`metrics`], and the log events themselves are also shipped
//! to a collector over gRPC.

pub mod dispatch;
pub mod metrics;

use opentelemetry_otlp::WithExportConfig as _;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::logs::SdkLoggerProvider;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::trace::SdkTracerProvider;

use crate::error::{Error, Result};

/// Where telemetry goes and how the process identifies itself.
pub struct TelemetryConfig {
    /// OTLP gRPC collector, e.g. "http://localhost:4317". `None` keeps
    /// everything local.
    pub endpoint: Option<String>,
    /// `service.name` on exported resources.
    pub service_name: String,
    /// Filter used when `RUST_LOG` is unset, e.g. "info" or "dispatchq=debug".
    pub default_filter: String,
}

impl TelemetryConfig {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            endpoint: None,
            service_name: service_name.into(),
            default_filter: "info".to_string(),
        }
    }
}

/// Exporter pipelines started for an OTLP endpoint.
struct Exporters {
    traces: SdkTracerProvider,
    metrics: SdkMeterProvider,
    logs: SdkLoggerProvider,
}

impl Exporters {
    fn start(endpoint: &str, service_name: String) -> Result<Self> {
        let resource = Resource::builder().with_service_name(service_name).build();

        let spans = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(|e| exporter_error("span", e))?;
        let traces = SdkTracerProvider::builder()
            .with_batch_exporter(spans)
            .with_resource(resource.clone())
            .build();

        let readings = opentelemetry_otlp::MetricExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(|e| exporter_error("metric", e))?;
        let metrics = SdkMeterProvider::builder()
            .with_periodic_exporter(readings)
            .with_resource(resource.clone())
            .build();

        let records = opentelemetry_otlp::LogExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(|e| exporter_error("log", e))?;
        let logs = SdkLoggerProvider::builder()
            .with_batch_exporter(records)
            .with_resource(resource)
            .build();

        Ok(Self {
            traces,
            metrics,
            logs,
        })
    }
}

fn exporter_error(signal: &str, err: impl std::fmt::Display) -> Error {
    Error::Other(format!("cannot build OTLP {signal} exporter: {err}"))
}

fn subscriber_error(err: impl std::fmt::Display) -> Error {
    Error::Other(format!("tracing subscriber already installed or invalid: {err}"))
}

/// Keeps exporters alive; dropping it flushes and stops them.
///
/// Bind it in `main` (`let _guard = ...`) so in-flight spans from draining
/// workers are exported before the process exits.
pub struct TelemetryGuard {
    exporters: Option<Exporters>,
}

impl TelemetryGuard {
    /// Push buffered spans, metric readings, and log records now.
    pub fn force_flush(&self) {
        if let Some(exporters) = &self.exporters {
            let _ = exporters.traces.force_flush();
            let _ = exporters.metrics.force_flush();
            let _ = exporters.logs.force_flush();
        }
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(exporters) = self.exporters.take() {
            let _ = exporters.logs.shutdown();
            let _ = exporters.metrics.shutdown();
            let _ = exporters.traces.shutdown();
        }
    }
}

/// Install the global subscriber, plus OTLP export when an endpoint is set.
///
/// # Errors
///
/// Fails if an exporter cannot be built or a global subscriber is already
/// installed (tests calling this twice in one process get the latter).
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard> {
    use opentelemetry::trace::TracerProvider as _;
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::layer::SubscriberExt as _;
    use tracing_subscriber::util::SubscriberInitExt as _;

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.default_filter));

    let Some(endpoint) = config.endpoint else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
            .map_err(subscriber_error)?;
        return Ok(TelemetryGuard { exporters: None });
    };

    let exporters = Exporters::start(&endpoint, config.service_name)?;
    opentelemetry::global::set_meter_provider(exporters.metrics.clone());

    let span_layer =
        tracing_opentelemetry::layer().with_tracer(exporters.traces.tracer("dispatchq"));
    let log_layer =
        opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge::new(&exporters.logs);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().compact())
        .with(span_layer)
        .with(log_layer)
        .try_init()
        .map_err(subscriber_error)?;

    Ok(TelemetryGuard {
        exporters: Some(exporters),
    })
}
