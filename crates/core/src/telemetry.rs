// Telemetry Module
//
// Structured logging for Pulse processes:
// - TelemetryConfig read from the environment
// - A tracing-subscriber registry with an EnvFilter and a JSON or pretty fmt layer

use tracing_subscriber::{
    layer::SubscriberExt, util::SubscriberInitExt, util::TryInitError, EnvFilter, Layer,
};

/// Output format of the fmt layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl LogFormat {
    fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "json" => Self::Json,
            _ => Self::Pretty,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name attached to the startup event
    pub service_name: String,
    /// Log filter (e.g., "info", "pulse_collector=debug")
    pub log_filter: Option<String>,
    pub format: LogFormat,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "pulse-collector".to_string(),
            log_filter: None,
            format: LogFormat::Pretty,
        }
    }
}

impl TelemetryConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `PULSE_SERVICE_NAME`: Service name (default: "pulse-collector")
    /// - `RUST_LOG` or `LOG_LEVEL`: Log filter
    /// - `PULSE_LOG_FORMAT`: `json` or `pretty` (default)
    pub fn from_env() -> Self {
        Self {
            service_name: std::env::var("PULSE_SERVICE_NAME")
                .unwrap_or_else(|_| "pulse-collector".to_string()),
            log_filter: std::env::var("RUST_LOG")
                .ok()
                .or_else(|| std::env::var("LOG_LEVEL").ok()),
            format: std::env::var("PULSE_LOG_FORMAT")
                .map(|v| LogFormat::parse(&v))
                .unwrap_or_default(),
        }
    }

    fn env_filter(&self) -> EnvFilter {
        self.log_filter
            .as_ref()
            .and_then(|f| EnvFilter::try_new(f).ok())
            .unwrap_or_else(|| EnvFilter::new("info"))
    }
}

/// Install the global subscriber.
///
/// Fails if a global subscriber was already installed.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<(), TryInitError> {
    let filter = config.env_filter();

    let fmt_layer = match config.format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_filter(filter)
            .boxed(),
        LogFormat::Pretty => tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_filter(filter)
            .boxed(),
    };

    tracing_subscriber::registry().with(fmt_layer).try_init()?;

    tracing::info!(
        service = %config.service_name,
        format = ?config.format,
        "Telemetry initialized"
    );
    Ok(())
}
