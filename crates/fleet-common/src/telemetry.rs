//! Process telemetry for the operator binary.
//!
//! Logs always go to stdout. Traces and metrics leave the process only when
//! an OTLP endpoint is configured; otherwise the instruments in
//! [`crate::metrics`] record into the no-op global meter.

use std::str::FromStr;

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::TracerProvider;
use opentelemetry_sdk::{runtime, Resource};
use opentelemetry_semantic_conventions::resource::{SERVICE_NAME, SERVICE_VERSION};
use thiserror::Error;
use tracing::warn;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Errors raised while installing telemetry
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// The log filter did not parse
    #[error("invalid log filter {filter:?}: {reason}")]
    Filter {
        /// Directives as given
        filter: String,
        /// Parser message
        reason: String,
    },

    /// An OTLP exporter could not be built
    #[error("failed to build {signal} exporter for {endpoint}: {reason}")]
    Exporter {
        /// `traces` or `metrics`
        signal: &'static str,
        /// Collector endpoint
        endpoint: String,
        /// Builder message
        reason: String,
    },

    /// A global subscriber was already installed
    #[error("failed to install subscriber: {0}")]
    Subscriber(String),
}

/// Directives used when no filter is configured
pub const DEFAULT_FILTER: &str = "info,fleet=debug,kube_runtime=warn,tower=warn,hyper=warn";

/// Resource attribute naming the pipelines a process runs
pub const MODE_ATTRIBUTE: &str = "fleet.mode";

/// Shape of log lines on stdout
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per line
    #[default]
    Json,
    /// Human readable lines
    Text,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "text" => Ok(LogFormat::Text),
            other => Err(format!("unknown log format {:?}, expected json or text", other)),
        }
    }
}

/// What the operator passes in from its command line
#[derive(Debug, Clone, Default)]
pub struct TelemetryConfig {
    /// `service.name` on exported signals
    pub service_name: String,
    /// Pipelines this process runs, recorded as [`MODE_ATTRIBUTE`]
    pub mode: String,
    /// Filter directives; [`DEFAULT_FILTER`] when unset
    pub log_filter: Option<String>,
    /// Log line shape
    pub log_format: LogFormat,
    /// OTLP collector endpoint; unset keeps traces and metrics local
    pub otlp_endpoint: Option<String>,
}

/// Installed exporters. Call [`Telemetry::shutdown`] before exit so buffered
/// spans and metric points are flushed.
#[derive(Debug)]
pub struct Telemetry {
    tracer: Option<TracerProvider>,
    meter: Option<SdkMeterProvider>,
}

impl Telemetry {
    /// Whether traces and metrics are being exported
    pub fn exporting(&self) -> bool {
        self.tracer.is_some()
    }

    /// Flush and stop the exporters
    pub fn shutdown(self) {
        if let Some(tracer) = self.tracer {
            if let Err(e) = tracer.shutdown() {
                warn!(error = %e, "trace exporter shutdown failed");
            }
        }
        if let Some(meter) = self.meter {
            if let Err(e) = meter.shutdown() {
                warn!(error = %e, "metrics exporter shutdown failed");
            }
        }
    }
}

/// Install the global subscriber, and the OTLP providers when an endpoint is set.
///
/// Fails if a global subscriber is already installed.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<Telemetry, TelemetryError> {
    let filter = log_filter(config.log_filter.as_deref())?;

    let fmt_layer = match config.log_format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .boxed(),
        LogFormat::Text => tracing_subscriber::fmt::layer().with_target(true).boxed(),
    };

    let mut telemetry = Telemetry {
        tracer: None,
        meter: None,
    };
    let otel_layer = match config.otlp_endpoint.as_deref() {
        Some(endpoint) => {
            global::set_text_map_propagator(TraceContextPropagator::new());
            let resource = resource(config);
            let meter = meter_provider(endpoint, resource.clone())?;
            global::set_meter_provider(meter.clone());
            let provider = tracer_provider(endpoint, resource)?;
            global::set_tracer_provider(provider.clone());
            let tracer = provider.tracer(config.service_name.clone());
            telemetry.tracer = Some(provider);
            telemetry.meter = Some(meter);
            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(filter)
        .with(otel_layer)
        .try_init()
        .map_err(|e| TelemetryError::Subscriber(e.to_string()))?;

    Ok(telemetry)
}

fn log_filter(directives: Option<&str>) -> Result<EnvFilter, TelemetryError> {
    let directives = directives
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .unwrap_or(DEFAULT_FILTER);
    EnvFilter::try_new(directives).map_err(|e| TelemetryError::Filter {
        filter: directives.to_string(),
        reason: e.to_string(),
    })
}

fn resource(config: &TelemetryConfig) -> Resource {
    let mut attributes = vec![
        KeyValue::new(SERVICE_NAME, config.service_name.clone()),
        KeyValue::new(SERVICE_VERSION, env!("CARGO_PKG_VERSION")),
    ];
    if !config.mode.is_empty() {
        attributes.push(KeyValue::new(MODE_ATTRIBUTE, config.mode.clone()));
    }
    Resource::new(attributes)
}

fn tracer_provider(endpoint: &str, resource: Resource) -> Result<TracerProvider, TelemetryError> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| exporter_error("traces", endpoint, e))?;
    Ok(TracerProvider::builder()
        .with_batch_exporter(exporter, runtime::Tokio)
        .with_resource(resource)
        .build())
}

fn meter_provider(endpoint: &str, resource: Resource) -> Result<SdkMeterProvider, TelemetryError> {
    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| exporter_error("metrics", endpoint, e))?;
    Ok(SdkMeterProvider::builder()
        .with_reader(PeriodicReader::builder(exporter, runtime::Tokio).build())
        .with_resource(resource)
        .build())
}

fn exporter_error(signal: &'static str, endpoint: &str, e: impl std::fmt::Display) -> TelemetryError {
    TelemetryError::Exporter {
        signal,
        endpoint: endpoint.to_string(),
        reason: e.to_string(),
    }
}
