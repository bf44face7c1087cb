//! Tracing Setup
//!
//! Installs the global `tracing` subscriber: an `EnvFilter`, a fmt layer on
//! stdout, and, when enabled, an OpenTelemetry layer exporting spans over
//! OTLP/gRPC.
//!
//! # Environment Variables
//!
//! - `OTEL_ENABLED`: `false`, `0` or `off` disables span export (default: enabled)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: Collector endpoint (default: <http://localhost:4317>)
//! - `OTEL_SERVICE_NAME`: Reported service name (default: the binary's name)
//! - `RUST_LOG`: Extra filter directives, merged with the crate defaults
//!
//! Both binaries call [`init`] once at startup and hold the returned
//! [`TelemetryGuard`] until exit so buffered spans are flushed.

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Collector endpoint used when none is configured.
pub const DEFAULT_OTLP_ENDPOINT: &str = "http://localhost:4317";

/// Filter directives merged into `RUST_LOG`.
const DEFAULT_DIRECTIVES: &[&str] = &[
    "delta_stream=info",
    "delta_watch=info",
    "sqlx=warn",
    "hyper=warn",
    "tungstenite=warn",
    "tokio_tungstenite=warn",
];

/// Flushes and shuts down span export on drop.
pub struct TelemetryGuard {
    provider: Option<SdkTracerProvider>,
}

impl TelemetryGuard {
    /// Whether spans are being exported.
    #[must_use]
    pub const fn is_exporting(&self) -> bool {
        self.provider.is_some()
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        let Some(provider) = self.provider.take() else {
            return;
        };
        if let Err(e) = provider.shutdown() {
            eprintln!("span exporter shutdown failed: {e}");
        }
    }
}

/// Telemetry settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    /// Export spans over OTLP.
    pub export: bool,
    /// Collector endpoint.
    pub endpoint: String,
    /// Reported service name.
    pub service_name: String,
}

impl TelemetryConfig {
    /// Export enabled against the default endpoint.
    #[must_use]
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            export: true,
            endpoint: DEFAULT_OTLP_ENDPOINT.to_string(),
            service_name: service_name.into(),
        }
    }

    /// Read settings from the process environment.
    #[must_use]
    pub fn from_env(default_service_name: &str) -> Self {
        Self::from_vars(default_service_name, |key| std::env::var(key).ok())
    }

    /// Read settings from a variable lookup.
    #[must_use]
    pub fn from_vars<F>(default_service_name: &str, var: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let export = var("OTEL_ENABLED").is_none_or(|v| {
            !matches!(v.trim().to_ascii_lowercase().as_str(), "false" | "0" | "off")
        });
        let endpoint = var("OTEL_EXPORTER_OTLP_ENDPOINT")
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_OTLP_ENDPOINT.to_string());
        let service_name = var("OTEL_SERVICE_NAME")
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| default_service_name.to_string());

        Self {
            export,
            endpoint,
            service_name,
        }
    }
}

/// Install the subscriber using environment settings.
#[must_use]
pub fn init(service_name: &str) -> TelemetryGuard {
    init_with_config(TelemetryConfig::from_env(service_name))
}

/// Install the subscriber with explicit settings.
///
/// A failure to build the exporter degrades to logging only. If a global
/// subscriber is already installed this is a no-op apart from the returned
/// guard.
#[must_use]
pub fn init_with_config(config: TelemetryConfig) -> TelemetryGuard {
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_file(false)
        .with_line_number(false);

    let provider = if config.export {
        match tracer_provider(&config) {
            Ok(provider) => Some(provider),
            Err(e) => {
                eprintln!("span exporter unavailable, logging only: {e}");
                None
            }
        }
    } else {
        None
    };

    let otel_layer = provider.as_ref().map(|p| {
        tracing_opentelemetry::layer().with_tracer(p.tracer(config.service_name.clone()))
    });

    let installed = tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt_layer)
        .with(otel_layer)
        .try_init();

    if installed.is_ok() {
        tracing::debug!(
            service = %config.service_name,
            exporting = provider.is_some(),
            endpoint = %config.endpoint,
            "Telemetry initialized"
        );
    }

    TelemetryGuard { provider }
}

fn tracer_provider(
    config: &TelemetryConfig,
) -> Result<SdkTracerProvider, opentelemetry_otlp::ExporterBuildError> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(&config.endpoint)
        .build()?;

    Ok(SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(
            Resource::builder()
                .with_service_name(config.service_name.clone())
                .build(),
        )
        .build())
}

fn env_filter() -> EnvFilter {
    DEFAULT_DIRECTIVES
        .iter()
        .filter_map(|d| d.parse().ok())
        .fold(EnvFilter::from_default_env(), EnvFilter::add_directive)
}

// =============================================================================
// Tests
// =============================================================================
