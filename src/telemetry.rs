//! Optional OpenTelemetry trace export.
//!
//! When the config carries a `[telemetry]` section and the secrets file the
//! matching API key, spans are batched and shipped over OTLP/HTTP in
//! addition to the console output. Without it the service logs to the
//! console only.
//!
//! The [`BatchSpanProcessor`] exports from its own background thread, which
//! has no tokio reactor, so the exporter is given a blocking `reqwest`
//! client. That client is built on a scratch thread to keep blocking work
//! off the runtime.

use opentelemetry::KeyValue;
use opentelemetry::trace::TracerProvider;
use opentelemetry_otlp::ExporterBuildError;
use opentelemetry_otlp::{WithExportConfig, WithHttpConfig};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::trace::{BatchConfigBuilder, BatchSpanProcessor, SdkTracerProvider};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tracing::Level;
use tracing_subscriber::Registry;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use url::Url;

const DEFAULT_ENDPOINT: &str = "https://in-otel.hyperdx.io/v1/traces";
const DEFAULT_SERVICE_NAME: &str = "bridge-stats";
const TRACER_NAME: &str = "bridge-stats-tracer";

/// `[telemetry]` section of the plaintext config.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct TelemetryConfig {
    service_name: Option<String>,
    endpoint: Option<Url>,
}

/// `[telemetry]` section of the secrets file.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct TelemetrySecrets {
    api_key: String,
}

#[derive(Debug, Clone)]
pub struct TelemetryCtx {
    pub(crate) api_key: String,
    pub(crate) service_name: String,
    pub(crate) endpoint: Url,
    pub(crate) log_level: Level,
}

impl TelemetryCtx {
    pub(crate) fn assemble(
        config: TelemetryConfig,
        secrets: TelemetrySecrets,
        log_level: Level,
    ) -> Result<Self, url::ParseError> {
        let endpoint = match config.endpoint {
            Some(endpoint) => endpoint,
            None => Url::parse(DEFAULT_ENDPOINT)?,
        };

        Ok(Self {
            api_key: secrets.api_key,
            service_name: config
                .service_name
                .unwrap_or_else(|| DEFAULT_SERVICE_NAME.to_owned()),
            endpoint,
            log_level,
        })
    }

    /// Installs the global subscriber with a console layer and an OTLP
    /// export layer. The returned guard must live until shutdown.
    pub fn setup_telemetry(&self) -> Result<TelemetryGuard, TelemetryError> {
        let headers = HashMap::from([("authorization".to_owned(), self.api_key.clone())]);

        let http_client = std::thread::spawn(export_client)
            .join()
            .map_err(|_| TelemetryError::ThreadSpawn)??;

        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_http()
            .with_http_client(http_client)
            .with_endpoint(self.endpoint.as_str())
            .with_headers(headers)
            .with_protocol(opentelemetry_otlp::Protocol::HttpBinary)
            .build()?;

        let processor = BatchSpanProcessor::builder(exporter)
            .with_batch_config(
                BatchConfigBuilder::default()
                    .with_max_export_batch_size(512)
                    .with_max_queue_size(2048)
                    .with_scheduled_delay(Duration::from_secs(3))
                    .build(),
            )
            .build();

        let tracer_provider = SdkTracerProvider::builder()
            .with_span_processor(processor)
            .with_resource(
                Resource::builder()
                    .with_service_name(self.service_name.clone())
                    .with_attributes(vec![KeyValue::new("deployment.environment", "production")])
                    .build(),
            )
            .build();

        let tracer = tracer_provider.tracer(TRACER_NAME);

        let default_filter = crate::config::default_filter(self.log_level);

        let fmt_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| default_filter.clone().into());
        let telemetry_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| default_filter.into());

        let fmt_layer = tracing_subscriber::fmt::layer().with_filter(fmt_filter);
        let telemetry_layer = tracing_opentelemetry::layer()
            .with_tracer(tracer)
            .with_filter(telemetry_filter);

        let subscriber = Registry::default().with(fmt_layer).with(telemetry_layer);

        tracing::subscriber::set_global_default(subscriber)?;

        Ok(TelemetryGuard { tracer_provider })
    }
}

/// Blocking client the span exporter posts batches with.
fn export_client() -> Result<reqwest::blocking::Client, TelemetryError> {
    reqwest::blocking::Client::builder()
        .gzip(true)
        .build()
        .map_err(|e| TelemetryError::HttpClient(e.to_string()))
}

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("Failed to build OTLP exporter")]
    OtlpExporter(#[from] ExporterBuildError),

    #[error("Failed to build HTTP client: {0}")]
    HttpClient(String),

    #[error("Failed to spawn HTTP client thread")]
    ThreadSpawn,

    #[error("Failed to set global subscriber")]
    Subscriber(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// Flushes and shuts down the tracer provider when dropped.
pub struct TelemetryGuard {
    tracer_provider: SdkTracerProvider,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Err(e) = self.tracer_provider.force_flush() {
            eprintln!("Failed to flush telemetry spans: {e:?}");
        }

        if let Err(e) = self.tracer_provider.shutdown() {
            eprintln!("Failed to shutdown telemetry provider: {e:?}");
        }
    }
}
