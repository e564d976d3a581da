//! Tracing subscriber setup
//!
//! Structured logs go to stdout, as JSON by default so cluster log pipelines
//! can index the `certmerge`, `secret` and `namespace` fields. `RUST_LOG`
//! overrides the configured level when set.

use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Errors that can occur during telemetry initialization
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// The level string is not a valid filter directive
    #[error("invalid log level {level:?}: {message}")]
    InvalidLevel {
        /// The rejected level
        level: String,
        /// Parser message
        message: String,
    },

    /// Failed to initialize tracing subscriber
    #[error("failed to initialize tracing subscriber: {0}")]
    SubscriberInit(String),
}

/// Configuration for telemetry initialization
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Default level when `RUST_LOG` is unset (e.g. `info`, `debug`)
    pub level: String,

    /// Emit JSON lines instead of human-readable text
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: true,
        }
    }
}

impl TelemetryConfig {
    /// Filter directives used when `RUST_LOG` is unset
    ///
    /// Client plumbing stays at warn so a debug operator log is still
    /// readable.
    pub fn default_directives(&self) -> String {
        format!("{},kube=info,tower=warn,hyper=warn,rustls=warn", self.level)
    }

    fn env_filter(&self) -> Result<EnvFilter, TelemetryError> {
        if let Ok(filter) = EnvFilter::try_from_default_env() {
            return Ok(filter);
        }
        EnvFilter::try_new(self.default_directives()).map_err(|e| TelemetryError::InvalidLevel {
            level: self.level.clone(),
            message: e.to_string(),
        })
    }
}

/// Initialize the global tracing subscriber
///
/// ```ignore
/// use certmerge::telemetry::{init_telemetry, TelemetryConfig};
///
/// init_telemetry(TelemetryConfig {
///     level: "debug".to_string(),
///     json: false,
/// })?;
/// ```
pub fn init_telemetry(config: TelemetryConfig) -> Result<(), TelemetryError> {
    let env_filter = config.env_filter()?;

    // Option<Layer> implements Layer, so exactly one of these is active
    let json_layer = config.json.then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_target(true)
            .with_file(false)
            .with_line_number(false)
    });
    let text_layer = (!config.json).then(|| tracing_subscriber::fmt::layer().with_target(true));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(text_layer)
        .try_init()
        .map_err(|e: tracing_subscriber::util::TryInitError| {
            TelemetryError::SubscriberInit(e.to_string())
        })?;

    Ok(())
}
