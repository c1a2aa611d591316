//! Subscriber and exporter initialization.

use opentelemetry::trace::TracerProvider;
use opentelemetry::{KeyValue, global};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    Resource, runtime,
    trace::{RandomIdGenerator, Sampler, Tracer},
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tracing_subscriber::{EnvFilter, Layer, Registry, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Error)]
pub enum TracerError {
    #[error("Failed to initialize tracer: {0}")]
    Init(String),
    #[error("Invalid log filter: {0}")]
    Filter(String),
}

/// OTLP exporter configuration. Spans are shipped over gRPC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OtlpConfig {
    pub endpoint: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_timeout() -> u64 {
    10
}

impl Default for OtlpConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:4317".to_string(),
            timeout_secs: default_timeout(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TracingConfig {
    /// Directive used when `RUST_LOG` is unset.
    #[serde(default = "default_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_format: LogFormat,
    #[serde(default = "default_service")]
    pub service_name: String,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: f64,
    /// Export spans when set.
    #[serde(default)]
    pub otlp: Option<OtlpConfig>,
    #[serde(default)]
    pub resource_attributes: HashMap<String, String>,
}

fn default_level() -> String {
    "info".to_string()
}

fn default_service() -> String {
    "skyway".to_string()
}

fn default_sample_rate() -> f64 {
    1.0
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            log_level: default_level(),
            log_format: LogFormat::default(),
            service_name: default_service(),
            sample_rate: default_sample_rate(),
            otlp: None,
            resource_attributes: HashMap::new(),
        }
    }
}

impl TracingConfig {
    pub fn sampler(&self) -> Sampler {
        if self.sample_rate >= 1.0 {
            Sampler::AlwaysOn
        } else if self.sample_rate <= 0.0 {
            Sampler::AlwaysOff
        } else {
            Sampler::TraceIdRatioBased(self.sample_rate)
        }
    }
}

/// Install the global subscriber: an env filter, a text or JSON formatter,
/// and an OpenTelemetry layer when an OTLP endpoint is configured.
pub fn init_tracer(config: &TracingConfig) -> Result<(), TracerError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .map_err(|e| TracerError::Filter(e.to_string()))?;

    let fmt_layer: Box<dyn Layer<Registry> + Send + Sync> = match config.log_format {
        LogFormat::Text => tracing_subscriber::fmt::layer().with_target(true).boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_target(true)
            .boxed(),
    };

    let telemetry = match &config.otlp {
        Some(otlp) => Some(tracing_opentelemetry::layer().with_tracer(otlp_tracer(config, otlp)?)),
        None => None,
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(filter)
        .with(telemetry)
        .try_init()
        .map_err(|e| TracerError::Init(e.to_string()))
}

fn build_resource(config: &TracingConfig) -> Resource {
    let mut attrs = vec![
        KeyValue::new("service.name", config.service_name.clone()),
        KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
    ];
    for (key, value) in &config.resource_attributes {
        attrs.push(KeyValue::new(key.clone(), value.clone()));
    }
    Resource::new(attrs)
}

fn otlp_tracer(config: &TracingConfig, otlp: &OtlpConfig) -> Result<Tracer, TracerError> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(&otlp.endpoint)
        .with_timeout(Duration::from_secs(otlp.timeout_secs))
        .build()
        .map_err(|e| TracerError::Init(e.to_string()))?;

    let provider = opentelemetry_sdk::trace::TracerProvider::builder()
        .with_batch_exporter(exporter, runtime::Tokio)
        .with_sampler(config.sampler())
        .with_id_generator(RandomIdGenerator::default())
        .with_resource(build_resource(config))
        .build();

    let tracer = provider.tracer("skyway");
    global::set_tracer_provider(provider);
    Ok(tracer)
}

/// Flush remaining spans.
pub fn shutdown_tracer() {
    global::shutdown_tracer_provider();
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults_from_empty_document() {
        let config: TracingConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.log_format, LogFormat::Text);
        assert_eq!(config.service_name, "skyway");
        assert!(config.otlp.is_none());
    }

    #[test]
    fn test_json_format_and_endpoint() {
        let config: TracingConfig =
            serde_json::from_str(r#"{"log_format": "json", "otlp": {"endpoint": "http://collector:4317"}}"#).unwrap();
        assert_eq!(config.log_format, LogFormat::Json);
        let otlp = config.otlp.unwrap();
        assert_eq!(otlp.endpoint, "http://collector:4317");
        assert_eq!(otlp.timeout_secs, 10);
    }

    #[test]
    fn test_sampler_bounds() {
        let mut config = TracingConfig::default();
        assert!(matches!(config.sampler(), Sampler::AlwaysOn));
        config.sample_rate = 0.0;
        assert!(matches!(config.sampler(), Sampler::AlwaysOff));
        config.sample_rate = 0.25;
        assert!(matches!(config.sampler(), Sampler::TraceIdRatioBased(r) if r == 0.25));
    }
}
