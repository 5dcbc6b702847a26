//! Sink configuration.

use std::{fmt, time::Duration};

use serde::Deserialize;
use sluice_config::GenericConfiguration;
use snafu::{ResultExt as _, Snafu};

use crate::{
    encoder::{LineEncoder, Precision},
    error::GenericError,
    publisher::{InvalidEndpoint, WriteEndpoint},
    retry::RetrySchedule,
    scheduler::SchedulerConfig,
};

const fn default_buffer_interval_ms() -> u64 {
    1000
}

const fn default_buffering_count() -> usize {
    1000
}

const fn default_max_buffer_size() -> usize {
    10240
}

const fn default_wait_write_timeout_ms() -> u64 {
    5000
}

const fn default_request_timeout_ms() -> u64 {
    30000
}

fn default_retry_delays_ms() -> Vec<u64> {
    vec![200, 400, 600]
}

const fn default_true() -> bool {
    true
}

/// Errors found while validating a [`SinkConfiguration`].
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum InvalidConfiguration {
    /// The write endpoint could not be built from the URL and database settings.
    #[snafu(display("Invalid write endpoint: {}", source))]
    Endpoint {
        /// Underlying endpoint error.
        source: InvalidEndpoint,
    },

    /// The database name was empty.
    #[snafu(display("Database name must not be empty."))]
    EmptyDatabaseName,

    /// Only one of the username and password was set.
    #[snafu(display("Username and password must be set together."))]
    IncompleteCredentials,

    /// The count trigger was zero.
    #[snafu(display("Buffering count must be greater than zero."))]
    ZeroBufferingCount,

    /// The time trigger interval was zero.
    #[snafu(display("Buffer interval must be greater than zero."))]
    ZeroBufferInterval,

    /// The hard buffer ceiling was below the count trigger.
    #[snafu(display(
        "Maximum buffer size ({}) must be at least the buffering count ({}).",
        max_buffer_size,
        buffering_count
    ))]
    BufferTooSmall {
        /// Configured hard ceiling.
        max_buffer_size: usize,

        /// Configured count trigger.
        buffering_count: usize,
    },
}

/// Configuration for a [`Sink`][crate::sink::Sink].
///
/// Field names are snake_case. The camelCase spellings used by other line protocol sinks are accepted as aliases so
/// that existing configuration files can be reused.
#[derive(Clone, Deserialize)]
pub struct SinkConfiguration {
    /// Base URL of the database, such as `http://localhost:8086`.
    url: String,

    /// Database to write into.
    #[serde(alias = "databaseName")]
    database_name: String,

    /// Timestamp precision, used both for encoding and in the write URL.
    ///
    /// Defaults to milliseconds.
    #[serde(default)]
    precision: Precision,

    /// Retention policy to write into.
    ///
    /// Defaults to the database's default retention policy.
    #[serde(default, alias = "retentionPolicy")]
    retention_policy: Option<String>,

    /// Username sent with every write.
    #[serde(default)]
    username: Option<String>,

    /// Password sent with every write.
    #[serde(default)]
    password: Option<String>,

    /// Time trigger, in milliseconds.
    ///
    /// Defaults to 1000.
    #[serde(default = "default_buffer_interval_ms", alias = "bufferIntervalMs")]
    buffer_interval_ms: u64,

    /// Count trigger, which is also the maximum number of events per batch.
    ///
    /// Defaults to 1000.
    #[serde(default = "default_buffering_count", alias = "bufferingCount")]
    buffering_count: usize,

    /// Maximum number of pending events before new events are rejected.
    ///
    /// Defaults to 10240.
    #[serde(default = "default_max_buffer_size", alias = "maxBufferSize")]
    max_buffer_size: usize,

    /// How long shutdown waits for pending events to be written, in milliseconds.
    ///
    /// Defaults to 5000.
    #[serde(default = "default_wait_write_timeout_ms", alias = "waitWriteTimeoutMs")]
    wait_write_timeout_ms: u64,

    /// Timeout for a single HTTP attempt, in milliseconds.
    ///
    /// Defaults to 30000.
    #[serde(default = "default_request_timeout_ms", alias = "requestTimeoutMs")]
    request_timeout_ms: u64,

    /// Delays between attempts, in milliseconds.
    ///
    /// A payload is attempted once more than the number of delays. Defaults to `[200, 400, 600]`.
    #[serde(default = "default_retry_delays_ms", alias = "retryDelaysMs")]
    retry_delays_ms: Vec<u64>,

    /// Whether lines are folded to lower case.
    ///
    /// Defaults to `true`.
    #[serde(default = "default_true", alias = "lowercaseLines")]
    lowercase_lines: bool,

    /// Whether commas, spaces, and equals signs in names are escaped.
    ///
    /// Defaults to `false`.
    #[serde(default, alias = "escapeSpecialCharacters")]
    escape_special_characters: bool,
}

impl SinkConfiguration {
    /// Creates a new `SinkConfiguration` for the given server and database, with every other setting at its default.
    pub fn new<U: Into<String>, D: Into<String>>(url: U, database_name: D) -> Self {
        Self {
            url: url.into(),
            database_name: database_name.into(),
            precision: Precision::default(),
            retention_policy: None,
            username: None,
            password: None,
            buffer_interval_ms: default_buffer_interval_ms(),
            buffering_count: default_buffering_count(),
            max_buffer_size: default_max_buffer_size(),
            wait_write_timeout_ms: default_wait_write_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            retry_delays_ms: default_retry_delays_ms(),
            lowercase_lines: true,
            escape_special_characters: false,
        }
    }

    /// Reads the sink configuration from the given configuration.
    ///
    /// # Errors
    ///
    /// If the configuration could not be deserialized, or is invalid, an error is returned.
    pub fn from_configuration(config: &GenericConfiguration) -> Result<Self, GenericError> {
        let sink_config: Self = config.as_typed()?;
        sink_config.validate()?;
        Ok(sink_config)
    }

    /// Sets the time trigger.
    pub fn with_buffer_interval(mut self, interval: Duration) -> Self {
        self.buffer_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Sets the count trigger.
    pub fn with_buffering_count(mut self, count: usize) -> Self {
        self.buffering_count = count;
        self
    }

    /// Sets the maximum number of pending events.
    pub fn with_max_buffer_size(mut self, size: usize) -> Self {
        self.max_buffer_size = size;
        self
    }

    /// Sets how long shutdown waits for pending events to be written.
    pub fn with_wait_write_timeout(mut self, timeout: Duration) -> Self {
        self.wait_write_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Sets the delays between attempts, in milliseconds.
    pub fn with_retry_delays_ms<I: IntoIterator<Item = u64>>(mut self, delays: I) -> Self {
        self.retry_delays_ms = delays.into_iter().collect();
        self
    }

    /// Sets whether lines are folded to lower case.
    pub fn with_lowercase_lines(mut self, lowercase: bool) -> Self {
        self.lowercase_lines = lowercase;
        self
    }

    /// Checks that the configuration describes a usable sink.
    ///
    /// # Errors
    ///
    /// If any setting is out of range, or the URL is not a valid `http` or `https` URL, an error is returned.
    pub fn validate(&self) -> Result<(), InvalidConfiguration> {
        if self.database_name.trim().is_empty() {
            return Err(InvalidConfiguration::EmptyDatabaseName);
        }
        if self.username.is_some() != self.password.is_some() {
            return Err(InvalidConfiguration::IncompleteCredentials);
        }
        if self.buffering_count == 0 {
            return Err(InvalidConfiguration::ZeroBufferingCount);
        }
        if self.buffer_interval_ms == 0 {
            return Err(InvalidConfiguration::ZeroBufferInterval);
        }
        if self.max_buffer_size < self.buffering_count {
            return Err(InvalidConfiguration::BufferTooSmall {
                max_buffer_size: self.max_buffer_size,
                buffering_count: self.buffering_count,
            });
        }

        self.write_endpoint().map(|_| ())
    }

    /// Builds the write endpoint described by this configuration.
    ///
    /// # Errors
    ///
    /// If the URL is not a valid `http` or `https` URL, an error is returned.
    pub fn write_endpoint(&self) -> Result<WriteEndpoint, InvalidConfiguration> {
        let mut builder = WriteEndpoint::builder(&self.url, &self.database_name)
            .with_precision(self.precision)
            .with_retention_policy(self.retention_policy.as_deref());
        if let (Some(username), Some(password)) = (&self.username, &self.password) {
            builder = builder.with_credentials(username, password);
        }
        builder.build().context(Endpoint)
    }

    /// Builds the line encoder described by this configuration.
    pub fn line_encoder(&self) -> LineEncoder {
        LineEncoder::new()
            .with_precision(self.precision)
            .with_lowercase(self.lowercase_lines)
            .with_escaping(self.escape_special_characters)
    }

    /// Returns the retry schedule.
    pub fn retry_schedule(&self) -> RetrySchedule {
        RetrySchedule::from_millis(&self.retry_delays_ms)
    }

    /// Returns the batching settings.
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig::new(
            Duration::from_millis(self.buffer_interval_ms),
            self.buffering_count,
            self.max_buffer_size,
        )
    }

    /// Returns how long shutdown waits for pending events to be written.
    pub const fn wait_write_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_write_timeout_ms)
    }

    /// Returns the timeout for a single HTTP attempt.
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl fmt::Debug for SinkConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SinkConfiguration")
            .field("url", &self.url)
            .field("database_name", &self.database_name)
            .field("precision", &self.precision)
            .field("retention_policy", &self.retention_policy)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("buffer_interval_ms", &self.buffer_interval_ms)
            .field("buffering_count", &self.buffering_count)
            .field("max_buffer_size", &self.max_buffer_size)
            .field("wait_write_timeout_ms", &self.wait_write_timeout_ms)
            .field("request_timeout_ms", &self.request_timeout_ms)
            .field("retry_delays_ms", &self.retry_delays_ms)
            .field("lowercase_lines", &self.lowercase_lines)
            .field("escape_special_characters", &self.escape_special_characters)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::json;
    use sluice_config::ConfigurationLoader;

    use super::*;

    fn from_json(value: serde_json::Value) -> Result<SinkConfiguration, GenericError> {
        let values: BTreeMap<String, serde_json::Value> = serde_json::from_value(value).unwrap();
        let config = ConfigurationLoader::default().with_values(values).into_generic();
        SinkConfiguration::from_configuration(&config)
    }

    #[test]
    fn defaults() {
        let config = from_json(json!({ "url": "http://localhost:8086", "database_name": "telemetry" })).unwrap();

        assert_eq!(config.precision, Precision::Milliseconds);
        assert_eq!(config.wait_write_timeout(), Duration::from_secs(5));
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.retry_schedule(), RetrySchedule::default());
        assert!(config.lowercase_lines);
        assert!(!config.escape_special_characters);

        let scheduler = config.scheduler_config();
        assert_eq!(scheduler.interval(), Duration::from_secs(1));
        assert_eq!(scheduler.batch_size(), 1000);
        assert_eq!(scheduler.capacity(), 10240);
    }

    #[test]
    fn camel_case_aliases() {
        let config = from_json(json!({
            "url": "http://localhost:8086",
            "databaseName": "telemetry",
            "bufferingCount": 50,
            "bufferIntervalMs": 250,
            "maxBufferSize": 100,
        }))
        .unwrap();

        let scheduler = config.scheduler_config();
        assert_eq!(scheduler.batch_size(), 50);
        assert_eq!(scheduler.interval(), Duration::from_millis(250));
        assert_eq!(scheduler.capacity(), 100);
    }

    #[test]
    fn missing_url_is_an_error() {
        assert!(from_json(json!({ "database_name": "telemetry" })).is_err());
    }

    #[test]
    fn validation() {
        let base = || SinkConfiguration::new("http://localhost:8086", "telemetry");
        assert!(base().validate().is_ok());

        assert!(matches!(
            SinkConfiguration::new("http://localhost:8086", " ").validate(),
            Err(InvalidConfiguration::EmptyDatabaseName)
        ));
        assert!(matches!(
            SinkConfiguration::new("localhost:8086", "telemetry").validate(),
            Err(InvalidConfiguration::Endpoint { .. })
        ));
        assert!(matches!(
            base().with_buffering_count(0).validate(),
            Err(InvalidConfiguration::ZeroBufferingCount)
        ));
        assert!(matches!(
            base().with_buffer_interval(Duration::ZERO).validate(),
            Err(InvalidConfiguration::ZeroBufferInterval)
        ));
        assert!(matches!(
            base().with_buffering_count(100).with_max_buffer_size(10).validate(),
            Err(InvalidConfiguration::BufferTooSmall { .. })
        ));

        let mut config = base();
        config.username = Some("writer".to_string());
        assert!(matches!(
            config.validate(),
            Err(InvalidConfiguration::IncompleteCredentials)
        ));
    }

    #[test]
    fn debug_output_redacts_password() {
        let mut config = SinkConfiguration::new("http://localhost:8086", "telemetry");
        config.username = Some("writer".to_string());
        config.password = Some("hunter2".to_string());

        let rendered = format!("{:?}", config);
        assert!(rendered.contains("writer"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn endpoint_carries_all_query_parameters() {
        let config = from_json(json!({
            "url": "https://metrics.example.com",
            "database_name": "telemetry",
            "precision": "s",
            "retention_policy": "autogen",
            "username": "writer",
            "password": "secret",
        }))
        .unwrap();

        assert_eq!(
            config.write_endpoint().unwrap().uri().to_string(),
            "https://metrics.example.com/write?db=telemetry&precision=s&rp=autogen&u=writer&p=secret"
        );
        assert_eq!(config.line_encoder().precision(), Precision::Seconds);
    }
}
