//! Line encoding.
//!
//! Each [`MetricEvent`] becomes one line of the form `measurement[,tag=value...] value=<number> <timestamp>`. Lines in
//! a batch are joined with a single newline.

use std::{borrow::Cow, fmt::Write as _};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::Deserialize;
use snafu::Snafu;
use tracing::debug;

use crate::event::MetricEvent;

const MEASUREMENT_SPECIALS: &[char] = &[',', ' '];
const TAG_SPECIALS: &[char] = &[',', '=', ' '];

/// Timestamp precision.
///
/// Determines both the unit timestamps are rendered in and the `precision` parameter sent with each write, so the two
/// always agree.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
pub enum Precision {
    /// Nanoseconds.
    #[serde(rename = "ns", alias = "n")]
    Nanoseconds,

    /// Microseconds.
    #[serde(rename = "u", alias = "us")]
    Microseconds,

    /// Milliseconds.
    #[default]
    #[serde(rename = "ms")]
    Milliseconds,

    /// Seconds.
    #[serde(rename = "s")]
    Seconds,

    /// Minutes.
    #[serde(rename = "m")]
    Minutes,

    /// Hours.
    #[serde(rename = "h")]
    Hours,
}

impl Precision {
    /// Returns the value of the `precision` query parameter for this precision.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Nanoseconds => "ns",
            Self::Microseconds => "u",
            Self::Milliseconds => "ms",
            Self::Seconds => "s",
            Self::Minutes => "m",
            Self::Hours => "h",
        }
    }

    /// Converts the given instant to the number of units of this precision since the Unix epoch.
    pub fn since_epoch(&self, dt: DateTime<Utc>) -> i64 {
        match self {
            // Nanosecond timestamps only cover roughly 1677 to 2262.
            Self::Nanoseconds => dt
                .timestamp_nanos_opt()
                .unwrap_or_else(|| dt.timestamp_micros().saturating_mul(1000)),
            Self::Microseconds => dt.timestamp_micros(),
            Self::Milliseconds => dt.timestamp_millis(),
            Self::Seconds => dt.timestamp(),
            Self::Minutes => dt.timestamp().div_euclid(60),
            Self::Hours => dt.timestamp().div_euclid(3600),
        }
    }
}

/// An error encoding a single event.
#[derive(Debug, PartialEq, Snafu)]
#[snafu(context(suffix(false)))]
pub enum EncodeError {
    /// The event has no measurement name, or an empty one.
    #[snafu(display("Event has no measurement name."))]
    MissingMeasurement,

    /// The event's value is NaN or infinite, which the line format cannot represent.
    #[snafu(display("Event value {} is not a finite number.", value))]
    NonFiniteValue {
        /// The offending value.
        value: f64,
    },
}

/// The result of encoding a batch of events.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EncodedBatch {
    payload: String,
    lines: usize,
    skipped: usize,
}

impl EncodedBatch {
    /// Returns the newline-joined payload.
    pub fn payload(&self) -> &str {
        &self.payload
    }

    /// Returns the number of lines in the payload.
    pub fn lines(&self) -> usize {
        self.lines
    }

    /// Returns the number of events that were skipped because they could not be encoded.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Returns `true` if no event in the batch could be encoded.
    pub fn is_empty(&self) -> bool {
        self.lines == 0
    }

    /// Consumes the batch, returning the payload as bytes.
    pub fn into_bytes(self) -> Bytes {
        Bytes::from(self.payload)
    }
}

/// Encodes metric events into lines.
///
/// Encoding is pure: the same event and the same "now" always produce the same line. Tags are emitted sorted
/// ascending by key, and tags with an empty key or an empty value are left out since the line format cannot carry them.
///
/// # Case folding
///
/// By default the measurement name, tag keys and tag values are folded to lower case. Folding happens before tags are
/// sorted, so the emitted tags are in ascending order of the keys as written. This matches the behavior of existing
/// deployments, but it does alter case-sensitive names and can be disabled with
/// [`with_lowercase`][Self::with_lowercase].
///
/// # Escaping
///
/// By default no escaping is applied, so a comma, space or equals sign inside a name or tag will corrupt the line. When
/// escaping is enabled, measurement names have commas and spaces backslash-escaped, and tag keys and values have
/// commas, equals signs and spaces backslash-escaped.
#[derive(Clone, Debug)]
pub struct LineEncoder {
    precision: Precision,
    lowercase: bool,
    escape: bool,
}

impl LineEncoder {
    /// Creates a new `LineEncoder` with millisecond precision, lower-casing enabled and escaping disabled.
    pub fn new() -> Self {
        Self {
            precision: Precision::Milliseconds,
            lowercase: true,
            escape: false,
        }
    }

    /// Sets the timestamp precision.
    pub fn with_precision(mut self, precision: Precision) -> Self {
        self.precision = precision;
        self
    }

    /// Sets whether names, tag keys and tag values are folded to lower case.
    pub fn with_lowercase(mut self, lowercase: bool) -> Self {
        self.lowercase = lowercase;
        self
    }

    /// Sets whether special characters in names, tag keys and tag values are escaped.
    pub fn with_escaping(mut self, escape: bool) -> Self {
        self.escape = escape;
        self
    }

    /// Returns the timestamp precision.
    pub fn precision(&self) -> Precision {
        self.precision
    }

    /// Encodes a single event, using the current time if the event has no usable timestamp.
    ///
    /// # Errors
    ///
    /// If the event has no measurement name, or its value is not finite, an error is returned.
    pub fn encode_event(&self, event: &MetricEvent) -> Result<String, EncodeError> {
        self.encode_event_at(event, Utc::now())
    }

    /// Encodes a single event, using `now` if the event has no usable timestamp.
    ///
    /// # Errors
    ///
    /// If the event has no measurement name, or its value is not finite, an error is returned.
    pub fn encode_event_at(&self, event: &MetricEvent, now: DateTime<Utc>) -> Result<String, EncodeError> {
        let mut line = String::new();
        self.write_line(&mut line, event, now)?;
        Ok(line)
    }

    /// Encodes a batch of events, using the current time for events with no usable timestamp.
    ///
    /// Events that cannot be encoded are skipped, and counted in [`EncodedBatch::skipped`].
    pub fn encode_batch(&self, events: &[MetricEvent]) -> EncodedBatch {
        self.encode_batch_at(events, Utc::now())
    }

    /// Encodes a batch of events, using `now` for events with no usable timestamp.
    ///
    /// Events that cannot be encoded are skipped, and counted in [`EncodedBatch::skipped`].
    pub fn encode_batch_at(&self, events: &[MetricEvent], now: DateTime<Utc>) -> EncodedBatch {
        let mut batch = EncodedBatch {
            payload: String::with_capacity(events.len() * 64),
            ..Default::default()
        };

        for event in events {
            let line_start = batch.payload.len();
            if batch.lines > 0 {
                batch.payload.push('\n');
            }

            match self.write_line(&mut batch.payload, event, now) {
                Ok(()) => batch.lines += 1,
                Err(e) => {
                    debug!(error = %e, "Skipping event that could not be encoded.");
                    batch.payload.truncate(line_start);
                    batch.skipped += 1;
                }
            }
        }

        batch
    }

    fn write_line(&self, buf: &mut String, event: &MetricEvent, now: DateTime<Utc>) -> Result<(), EncodeError> {
        let measurement = event.measurement().ok_or(EncodeError::MissingMeasurement)?;
        let value = event.value();
        if !value.is_finite() {
            return Err(EncodeError::NonFiniteValue { value });
        }

        // Folding can make distinct keys equal. The tag added last wins, as with `MetricEvent::with_tag`.
        let mut tags = IndexMap::with_capacity(event.tags().len());
        for (key, value) in event.tags() {
            if !key.is_empty() && !value.is_empty() {
                tags.insert(self.fold(key), self.fold(value));
            }
        }
        if tags.len() > 1 {
            tags.sort_by(|a, _, b, _| a.as_bytes().cmp(b.as_bytes()));
        }

        self.write_component(buf, &self.fold(measurement), MEASUREMENT_SPECIALS);
        for (key, value) in &tags {
            buf.push(',');
            self.write_component(buf, key, TAG_SPECIALS);
            buf.push('=');
            self.write_component(buf, value, TAG_SPECIALS);
        }

        let timestamp = event.timestamp().and_then(|ts| ts.as_datetime()).unwrap_or(now);

        // Writing to a `String` cannot fail.
        let _ = write!(buf, " value={} {}", value, self.precision.since_epoch(timestamp));
        Ok(())
    }

    fn fold<'a>(&self, s: &'a str) -> Cow<'a, str> {
        if self.lowercase && s.chars().any(char::is_uppercase) {
            Cow::Owned(s.to_lowercase())
        } else {
            Cow::Borrowed(s)
        }
    }

    fn write_component(&self, buf: &mut String, s: &str, specials: &[char]) {
        if !self.escape || !s.contains(specials) {
            buf.push_str(s);
            return;
        }

        for c in s.chars() {
            if specials.contains(&c) {
                buf.push('\\');
            }
            buf.push(c);
        }
    }
}

impl Default for LineEncoder {
    fn default() -> Self {
        Self::new()
    }
}
