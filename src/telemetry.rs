//! Logging and metrics export setup
//!
//! Logs go to stdout as JSON lines or plain text. Metrics are pushed over
//! OTLP/gRPC when an endpoint is configured; see [`crate::metrics`] for the
//! instruments.

use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::{runtime, Resource};
use thiserror::Error;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::{LoggingSettings, TelemetrySettings};

/// Errors that can occur during telemetry initialization
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// The log level is not a valid filter directive
    #[error("invalid log level {level:?}: {reason}")]
    LogLevel {
        /// Configured level
        level: String,
        /// Parser message
        reason: String,
    },

    /// Failed to initialize OTLP metrics exporter
    #[error("failed to initialize metrics exporter: {0}")]
    MetricsInit(String),

    /// Failed to initialize tracing subscriber
    #[error("failed to initialize tracing subscriber: {0}")]
    SubscriberInit(String),
}

/// Install the global tracing subscriber
///
/// `RUST_LOG` wins over the configured level.
pub fn init_tracing(logging: &LoggingSettings) -> Result<(), TelemetryError> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .map_err(|e| TelemetryError::LogLevel {
            level: logging.level.clone(),
            reason: e.to_string(),
        })?;

    // Option<Layer> implements Layer, so exactly one formatter is active
    let (json_layer, text_layer) = if logging.json() {
        (
            Some(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_target(true),
            ),
            None,
        )
    } else {
        (None, Some(fmt::layer().with_target(true)))
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(text_layer)
        .try_init()
        .map_err(|e| TelemetryError::SubscriberInit(e.to_string()))
}

/// Install the global meter provider when an endpoint is configured
///
/// Must run inside a Tokio runtime. The returned provider should be shut
/// down on exit so the last readings are flushed.
pub fn init_metrics(
    settings: &TelemetrySettings,
) -> Result<Option<SdkMeterProvider>, TelemetryError> {
    let Some(endpoint) = settings.otlp_endpoint.as_deref() else {
        return Ok(None);
    };

    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;

    let reader = PeriodicReader::builder(exporter, runtime::Tokio).build();

    let provider = SdkMeterProvider::builder()
        .with_reader(reader)
        .with_resource(build_resource(&settings.service_name))
        .build();

    global::set_meter_provider(provider.clone());
    Ok(Some(provider))
}

fn build_resource(service_name: &str) -> Resource {
    let mut attributes = vec![
        KeyValue::new(
            opentelemetry_semantic_conventions::resource::SERVICE_NAME,
            service_name.to_string(),
        ),
        KeyValue::new(
            opentelemetry_semantic_conventions::resource::SERVICE_VERSION,
            env!("CARGO_PKG_VERSION"),
        ),
    ];
    if let Ok(host) = hostname::get() {
        attributes.push(KeyValue::new(
            "host.name",
            host.to_string_lossy().into_owned(),
        ));
    }
    Resource::new(attributes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_endpoint_means_no_provider() {
        let settings = TelemetrySettings::default();
        assert!(init_metrics(&settings).unwrap().is_none());
    }

    #[test]
    fn resource_carries_service_name() {
        let resource = build_resource("warden-test");
        let name = resource.get(opentelemetry::Key::new(
            opentelemetry_semantic_conventions::resource::SERVICE_NAME,
        ));
        assert_eq!(name.map(|v| v.to_string()).as_deref(), Some("warden-test"));
    }

    #[test]
    fn bad_log_level_is_reported() {
        // RUST_LOG would mask the configured level
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        let logging = LoggingSettings {
            level: "warden=loud".to_string(),
            format: "text".to_string(),
        };
        assert!(matches!(
            init_tracing(&logging),
            Err(TelemetryError::LogLevel { .. })
        ));
    }
}
