//! Metric events and the host records they are derived from.

use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use indexmap::IndexMap;
use snafu::Snafu;

const NAIVE_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

/// The point in time a metric sample was observed at.
///
/// Timestamps given as text are parsed eagerly, but text that cannot be understood is kept rather than rejected: the
/// encoder substitutes the current time for it when the event is written out.
#[derive(Clone, Debug, PartialEq)]
pub enum Timestamp {
    /// A resolved instant.
    At(DateTime<Utc>),

    /// Text that could not be parsed as a timestamp.
    Unparsed(String),
}

impl Timestamp {
    /// Parses a timestamp from text.
    ///
    /// Accepts RFC 3339, naive `YYYY-MM-DD[T ]HH:MM:SS[.fff]` (interpreted as UTC), RFC 2822, and bare dates
    /// (midnight UTC). Anything else yields [`Timestamp::Unparsed`].
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();

        if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
            return Self::At(dt.with_timezone(&Utc));
        }

        for format in NAIVE_FORMATS {
            if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, format) {
                return Self::At(naive.and_utc());
            }
        }

        if let Ok(dt) = DateTime::parse_from_rfc2822(trimmed) {
            return Self::At(dt.with_timezone(&Utc));
        }

        if let Some(midnight) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
            .ok()
            .and_then(|date| date.and_hms_opt(0, 0, 0))
        {
            return Self::At(midnight.and_utc());
        }

        Self::Unparsed(raw.to_string())
    }

    /// Returns the resolved instant, if this timestamp was parseable.
    pub fn as_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::At(dt) => Some(*dt),
            Self::Unparsed(_) => None,
        }
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(dt: DateTime<Utc>) -> Self {
        Self::At(dt)
    }
}

/// One metric sample.
///
/// An event carries a measurement name, an unordered set of uniquely-keyed tags, exactly one numeric value, and an
/// optional timestamp. An event without a measurement name can be constructed (host records may lack one) but cannot
/// be encoded.
#[derive(Clone, Debug, PartialEq)]
pub struct MetricEvent {
    measurement: Option<String>,
    tags: IndexMap<String, String>,
    value: f64,
    timestamp: Option<Timestamp>,
}

impl MetricEvent {
    /// Creates a new event for the given measurement.
    pub fn new<M>(measurement: M, value: f64) -> Self
    where
        M: Into<String>,
    {
        Self {
            measurement: Some(measurement.into()),
            tags: IndexMap::new(),
            value,
            timestamp: None,
        }
    }

    /// Creates a new event with no measurement name.
    pub fn unnamed(value: f64) -> Self {
        Self {
            measurement: None,
            tags: IndexMap::new(),
            value,
            timestamp: None,
        }
    }

    /// Adds a tag, replacing the value of any existing tag with the same key.
    pub fn with_tag<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Sets the timestamp.
    pub fn with_timestamp<T>(mut self, timestamp: T) -> Self
    where
        T: Into<Timestamp>,
    {
        self.timestamp = Some(timestamp.into());
        self
    }

    /// Returns the measurement name, if present and non-empty.
    pub fn measurement(&self) -> Option<&str> {
        self.measurement.as_deref().filter(|name| !name.is_empty())
    }

    /// Returns the tags, in insertion order.
    pub fn tags(&self) -> &IndexMap<String, String> {
        &self.tags
    }

    /// Returns the value.
    pub fn value(&self) -> f64 {
        self.value
    }

    /// Returns the timestamp, if one was given.
    pub fn timestamp(&self) -> Option<&Timestamp> {
        self.timestamp.as_ref()
    }

    /// Builds an event from a host record.
    ///
    /// Each field is dispatched on its [`FieldRole`]: the measurement, value and timestamp fields populate those parts
    /// of the event, and every other field becomes a tag keyed by the field name. When several fields resolve to the
    /// same role, the last one wins.
    ///
    /// # Errors
    ///
    /// If the record has no value field, or the value field is not numeric, an error is returned.
    pub fn from_record(record: &EventRecord) -> Result<Self, RecordError> {
        let mut measurement = None;
        let mut value = None;
        let mut timestamp = None;
        let mut tags = IndexMap::with_capacity(record.fields.len());

        for (name, field) in &record.fields {
            match FieldRole::resolve(name) {
                FieldRole::Measurement => measurement = field.as_text(),
                FieldRole::Value => value = Some((name.as_str(), field)),
                FieldRole::Timestamp => timestamp = field.as_timestamp(),
                FieldRole::Tag => {
                    tags.insert(name.clone(), field.as_text().unwrap_or_default());
                }
            }
        }

        let value = match value {
            None | Some((_, FieldValue::Null)) => return Err(RecordError::MissingValue),
            Some((name, field)) => field.as_number().ok_or_else(|| RecordError::NonNumericValue {
                field: name.to_string(),
                found: field.to_string(),
            })?,
        };

        Ok(Self {
            measurement,
            tags,
            value,
            timestamp,
        })
    }
}

/// An error converting a host record into a [`MetricEvent`].
#[derive(Debug, PartialEq, Snafu)]
#[snafu(context(suffix(false)))]
pub enum RecordError {
    /// The record had no value field.
    #[snafu(display("Record has no 'value' field."))]
    MissingValue,

    /// The value field could not be interpreted as a number.
    #[snafu(display("Field '{}' must be numeric, found '{}'.", field, found))]
    NonNumericValue {
        /// Name of the value field, as given in the record.
        field: String,

        /// The value found, rendered as text.
        found: String,
    },
}

/// The role a host record field plays when building a [`MetricEvent`].
///
/// Resolution is by case-insensitive name: `metrictype` names the measurement, `value` carries the numeric value,
/// `currenttime` carries the timestamp, and any other name is a tag.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FieldRole {
    /// The measurement name.
    Measurement,

    /// The numeric value.
    Value,

    /// The timestamp.
    Timestamp,

    /// A tag.
    Tag,
}

impl FieldRole {
    /// Resolves the role of a field by name.
    pub fn resolve(name: &str) -> Self {
        if name.eq_ignore_ascii_case("metrictype") {
            Self::Measurement
        } else if name.eq_ignore_ascii_case("value") {
            Self::Value
        } else if name.eq_ignore_ascii_case("currenttime") {
            Self::Timestamp
        } else {
            Self::Tag
        }
    }
}

/// A single field value in a host record.
#[derive(Clone, Debug, PartialEq)]
pub enum FieldValue {
    /// No value.
    Null,

    /// A boolean.
    Bool(bool),

    /// A signed integer.
    Integer(i64),

    /// A floating-point number.
    Float(f64),

    /// Text.
    Text(String),

    /// A resolved point in time.
    Timestamp(DateTime<Utc>),
}

impl FieldValue {
    fn as_text(&self) -> Option<String> {
        match self {
            Self::Null => None,
            Self::Text(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    fn as_number(&self) -> Option<f64> {
        match self {
            Self::Integer(n) => Some(*n as f64),
            Self::Float(n) => Some(*n),
            Self::Text(s) => s.trim().parse().ok(),
            Self::Null | Self::Bool(_) | Self::Timestamp(_) => None,
        }
    }

    fn as_timestamp(&self) -> Option<Timestamp> {
        match self {
            Self::Null => None,
            Self::Timestamp(dt) => Some(Timestamp::At(*dt)),
            // Integers are taken as milliseconds since the epoch.
            Self::Integer(ms) => Some(
                DateTime::from_timestamp_millis(*ms)
                    .map(Timestamp::At)
                    .unwrap_or_else(|| Timestamp::Unparsed(ms.to_string())),
            ),
            Self::Text(s) => Some(Timestamp::parse(s)),
            other => Some(Timestamp::Unparsed(other.to_string())),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => Ok(()),
            Self::Bool(b) => write!(f, "{}", b),
            Self::Integer(n) => write!(f, "{}", n),
            Self::Float(n) => write!(f, "{}", n),
            Self::Text(s) => f.write_str(s),
            Self::Timestamp(dt) => f.write_str(&dt.to_rfc3339()),
        }
    }
}

impl From<serde_json::Value> for FieldValue {
    fn from(value: serde_json::Value) -> Self {
        use serde_json::Value;

        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Self::Integer(i),
                None => n.as_f64().map(Self::Float).unwrap_or(Self::Null),
            },
            Value::String(s) => Self::Text(s),
            nested => Self::Text(nested.to_string()),
        }
    }
}

/// A structured record delivered by the host: an ordered list of named fields.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EventRecord {
    fields: Vec<(String, FieldValue)>,
}

impl EventRecord {
    /// Creates an empty record.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a field.
    pub fn with_field<N, V>(mut self, name: N, value: V) -> Self
    where
        N: Into<String>,
        V: Into<FieldValue>,
    {
        self.fields.push((name.into(), value.into()));
        self
    }

    /// Returns the fields, in the order they were added.
    pub fn fields(&self) -> &[(String, FieldValue)] {
        &self.fields
    }
}

impl From<serde_json::Map<String, serde_json::Value>> for EventRecord {
    fn from(object: serde_json::Map<String, serde_json::Value>) -> Self {
        Self {
            fields: object.into_iter().map(|(name, value)| (name, value.into())).collect(),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<i64> for FieldValue {
    fn from(n: i64) -> Self {
        Self::Integer(n)
    }
}

impl From<f64> for FieldValue {
    fn from(n: f64) -> Self {
        Self::Float(n)
    }
}

impl From<bool> for FieldValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<DateTime<Utc>> for FieldValue {
    fn from(dt: DateTime<Utc>) -> Self {
        Self::Timestamp(dt)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone as _;

    use super::*;

    #[test]
    fn field_roles_resolve_case_insensitively() {
        assert_eq!(FieldRole::resolve("MetricType"), FieldRole::Measurement);
        assert_eq!(FieldRole::resolve("metrictype"), FieldRole::Measurement);
        assert_eq!(FieldRole::resolve("VALUE"), FieldRole::Value);
        assert_eq!(FieldRole::resolve("CurrentTime"), FieldRole::Timestamp);
        assert_eq!(FieldRole::resolve("host"), FieldRole::Tag);
        assert_eq!(FieldRole::resolve("metric_type"), FieldRole::Tag);
    }

    #[test]
    fn timestamp_parsing() {
        let expected = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

        assert_eq!(Timestamp::parse("2024-01-01T00:00:00Z"), Timestamp::At(expected));
        assert_eq!(Timestamp::parse("2024-01-01T02:00:00+02:00"), Timestamp::At(expected));
        assert_eq!(Timestamp::parse("2024-01-01 00:00:00"), Timestamp::At(expected));
        assert_eq!(Timestamp::parse("2024-01-01T00:00:00.000"), Timestamp::At(expected));
        assert_eq!(Timestamp::parse("Mon, 1 Jan 2024 00:00:00 +0000"), Timestamp::At(expected));
        assert_eq!(Timestamp::parse("2024-01-01"), Timestamp::At(expected));
        assert_eq!(
            Timestamp::parse("yesterday-ish"),
            Timestamp::Unparsed("yesterday-ish".to_string())
        );
    }

    #[test]
    fn empty_measurement_is_absent() {
        assert_eq!(MetricEvent::new("", 1.0).measurement(), None);
        assert_eq!(MetricEvent::unnamed(1.0).measurement(), None);
        assert_eq!(MetricEvent::new("cpu", 1.0).measurement(), Some("cpu"));
    }

    #[test]
    fn record_conversion() {
        let record = EventRecord::new()
            .with_field("MetricType", "cpu")
            .with_field("Value", 42i64)
            .with_field("CurrentTime", "2024-01-01T00:00:00Z")
            .with_field("host", "a")
            .with_field("core", 3i64);

        let event = MetricEvent::from_record(&record).expect("record is valid");
        assert_eq!(event.measurement(), Some("cpu"));
        assert_eq!(event.value(), 42.0);
        assert_eq!(
            event.timestamp().and_then(Timestamp::as_datetime),
            Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
        );

        let tags: Vec<_> = event.tags().iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        assert_eq!(tags, vec![("host", "a"), ("core", "3")]);
    }

    #[test]
    fn record_without_measurement_still_converts() {
        let record = EventRecord::new().with_field("value", 1.5);
        let event = MetricEvent::from_record(&record).expect("record is valid");
        assert_eq!(event.measurement(), None);
        assert_eq!(event.value(), 1.5);
    }

    #[test]
    fn record_value_errors() {
        let missing = EventRecord::new().with_field("metrictype", "cpu");
        assert_eq!(MetricEvent::from_record(&missing), Err(RecordError::MissingValue));

        let null = EventRecord::new()
            .with_field("metrictype", "cpu")
            .with_field("value", FieldValue::Null);
        assert_eq!(MetricEvent::from_record(&null), Err(RecordError::MissingValue));

        let text = EventRecord::new()
            .with_field("metrictype", "cpu")
            .with_field("Value", "lots");
        assert_eq!(
            MetricEvent::from_record(&text),
            Err(RecordError::NonNumericValue {
                field: "Value".to_string(),
                found: "lots".to_string(),
            })
        );
    }

    #[test]
    fn numeric_text_value_is_accepted() {
        let record = EventRecord::new()
            .with_field("metrictype", "cpu")
            .with_field("value", " 12.5 ");
        assert_eq!(MetricEvent::from_record(&record).map(|e| e.value()), Ok(12.5));
    }

    #[test]
    fn unparseable_timestamp_is_kept() {
        let record = EventRecord::new()
            .with_field("metrictype", "cpu")
            .with_field("value", 1i64)
            .with_field("currenttime", "not a time");

        let event = MetricEvent::from_record(&record).expect("record is valid");
        assert_eq!(event.timestamp(), Some(&Timestamp::Unparsed("not a time".to_string())));
    }

    #[test]
    fn integer_timestamp_is_epoch_millis() {
        let record = EventRecord::new()
            .with_field("metrictype", "cpu")
            .with_field("value", 1i64)
            .with_field("currenttime", 1_704_067_200_000i64);

        let event = MetricEvent::from_record(&record).expect("record is valid");
        assert_eq!(
            event.timestamp().and_then(Timestamp::as_datetime),
            Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn record_from_json_object() {
        let object = serde_json::json!({
            "metrictype": "mem",
            "value": 0.25,
            "region": "eu",
            "primary": true,
        });
        let serde_json::Value::Object(map) = object else {
            unreachable!()
        };

        let event = MetricEvent::from_record(&EventRecord::from(map)).expect("record is valid");
        assert_eq!(event.measurement(), Some("mem"));
        assert_eq!(event.value(), 0.25);
        assert_eq!(event.tags().get("region").map(String::as_str), Some("eu"));
        assert_eq!(event.tags().get("primary").map(String::as_str), Some("true"));
    }
}
