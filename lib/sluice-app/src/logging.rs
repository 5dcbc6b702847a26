//! Logging.

use serde::Deserialize;
use sluice_config::GenericConfiguration;
use sluice_core::{
    error::{ErrorContext as _, GenericError},
    generic_error,
};
use tracing_subscriber::{
    filter::LevelFilter, fmt, layer::SubscriberExt as _, util::SubscriberInitExt as _, EnvFilter, Layer as _,
};

/// Logs a message to standard error and exits the process with a non-zero exit code.
pub fn fatal_and_exit(message: String) {
    eprintln!("FATAL: {}", message);
    std::process::exit(1);
}

fn default_log_level() -> LogLevel {
    LogLevel(LevelFilter::INFO.to_string())
}

/// Logging configuration.
#[derive(Clone, Debug, Deserialize)]
pub struct LoggingConfiguration {
    /// Filtering directives, in the same syntax as `RUST_LOG`.
    ///
    /// Defaults to `info`.
    #[serde(default = "default_log_level", alias = "logLevel")]
    log_level: LogLevel,

    /// Whether to emit logs as JSON objects instead of human-readable lines.
    ///
    /// Defaults to `false`.
    #[serde(default, alias = "logFormatJson")]
    log_format_json: bool,
}

impl LoggingConfiguration {
    /// Creates a new `LoggingConfiguration` from the given configuration.
    ///
    /// # Errors
    ///
    /// If the configuration cannot be deserialized as `LoggingConfiguration`, or the log level is not a valid set of
    /// filtering directives, an error is returned.
    pub fn from_configuration(config: &GenericConfiguration) -> Result<Self, GenericError> {
        let logging_config = config.as_typed()?;
        Ok(logging_config)
    }

    /// Returns the filtering directives.
    pub fn log_level(&self) -> &str {
        &self.log_level.0
    }

    /// Returns `true` if logs are formatted as JSON.
    pub fn log_format_json(&self) -> bool {
        self.log_format_json
    }
}

impl Default for LoggingConfiguration {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format_json: false,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(try_from = "String")]
struct LogLevel(String);

impl LogLevel {
    fn as_env_filter(&self) -> EnvFilter {
        EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .parse_lossy(&self.0)
    }
}

impl TryFrom<String> for LogLevel {
    type Error = GenericError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let value = value.trim().to_string();
        if value.is_empty() {
            return Err(generic_error!("Log level cannot be empty."));
        }

        EnvFilter::builder()
            .parse(&value)
            .map(|_| Self(value))
            .error_context("Failed to parse valid log level.")
    }
}

/// Initializes the logging subsystem for `tracing`.
///
/// Logs are written to standard error, either as human-readable lines or, when `log_format_json` is set, as flattened
/// JSON objects carrying the target, file, and line of each event.
///
/// # Errors
///
/// If the logging subsystem was already initialized, an error is returned.
pub fn initialize_logging(config: &LoggingConfiguration) -> Result<(), GenericError> {
    let filter = config.log_level.as_env_filter();

    let layer = if config.log_format_json {
        fmt::Layer::new()
            .json()
            .flatten_event(true)
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        fmt::Layer::new().with_target(true).with_writer(std::io::stderr).boxed()
    };

    tracing_subscriber::registry()
        .with(layer.with_filter(filter))
        .try_init()
        .error_context("Failed to initialize logging subsystem.")
}
