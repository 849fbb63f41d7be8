//! Typed value model
//!
//! A closed enumeration of logical value kinds ([`QValueKind`]) and a tagged
//! sum of values ([`QValue`]) shared by every source driver and destination
//! codec. Keeping the tag and the payload in one enum makes impossible
//! states unrepresentable: a `Numeric` value is always a decimal, a
//! `TimestampTz` is always an instant, and conversion failures are typed
//! errors rather than silent coercions.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Timelike, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Logical kind of a replicated value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QValueKind {
    /// Unrecognised source type, carried best-effort as text
    Invalid,
    String,
    Uuid,
    Geometry,
    Geography,
    Point,
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
    Boolean,
    Bytes,
    Bit,
    Numeric,
    Time,
    TimeTz,
    Date,
    Timestamp,
    TimestampTz,
    HStore,
    Json,
    Struct,
    ArrayInt32,
    ArrayInt64,
    ArrayFloat32,
    ArrayFloat64,
    ArrayString,
}

impl QValueKind {
    /// Whether this kind is one of the typed array kinds.
    pub fn is_array(&self) -> bool {
        matches!(
            self,
            Self::ArrayInt32
                | Self::ArrayInt64
                | Self::ArrayFloat32
                | Self::ArrayFloat64
                | Self::ArrayString
        )
    }

    /// Whether this kind is a date/time kind.
    pub fn is_temporal(&self) -> bool {
        matches!(
            self,
            Self::Time | Self::TimeTz | Self::Date | Self::Timestamp | Self::TimestampTz
        )
    }
}

impl std::fmt::Display for QValueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Invalid => "invalid",
            Self::String => "string",
            Self::Uuid => "uuid",
            Self::Geometry => "geometry",
            Self::Geography => "geography",
            Self::Point => "point",
            Self::Int16 => "int16",
            Self::Int32 => "int32",
            Self::Int64 => "int64",
            Self::Float32 => "float32",
            Self::Float64 => "float64",
            Self::Boolean => "boolean",
            Self::Bytes => "bytes",
            Self::Bit => "bit",
            Self::Numeric => "numeric",
            Self::Time => "time",
            Self::TimeTz => "timetz",
            Self::Date => "date",
            Self::Timestamp => "timestamp",
            Self::TimestampTz => "timestamptz",
            Self::HStore => "hstore",
            Self::Json => "json",
            Self::Struct => "struct",
            Self::ArrayInt32 => "array_int32",
            Self::ArrayInt64 => "array_int64",
            Self::ArrayFloat32 => "array_float32",
            Self::ArrayFloat64 => "array_float64",
            Self::ArrayString => "array_string",
        };
        write!(f, "{}", name)
    }
}

/// A typed replicated value.
///
/// The variant is the runtime proof that the payload matches its declared
/// kind. Typed nulls carry the kind they stand in for so downstream codecs
/// can still pick the right schema branch.
#[derive(Debug, Clone, PartialEq)]
pub enum QValue {
    /// Typed NULL
    Null(QValueKind),
    /// Unrecognised source value carried as text
    Invalid(String),
    String(String),
    Uuid(Uuid),
    /// Geometry in WKT form
    Geometry(String),
    /// Geography in WKT form
    Geography(String),
    Point(String),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    Boolean(bool),
    Bytes(Vec<u8>),
    Bit(Vec<u8>),
    Numeric(Decimal),
    Time(NaiveTime),
    /// Time with zone, normalized to UTC
    TimeTz(NaiveTime),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
    /// hstore literal (converted to JSON at encode time)
    HStore(String),
    /// JSON document in text form
    Json(String),
    /// Composite value in text form
    Struct(String),
    ArrayInt32(Vec<i32>),
    ArrayInt64(Vec<i64>),
    ArrayFloat32(Vec<f32>),
    ArrayFloat64(Vec<f64>),
    ArrayString(Vec<String>),
}

impl QValue {
    /// The kind this value belongs to.
    pub fn kind(&self) -> QValueKind {
        match self {
            Self::Null(kind) => *kind,
            Self::Invalid(_) => QValueKind::Invalid,
            Self::String(_) => QValueKind::String,
            Self::Uuid(_) => QValueKind::Uuid,
            Self::Geometry(_) => QValueKind::Geometry,
            Self::Geography(_) => QValueKind::Geography,
            Self::Point(_) => QValueKind::Point,
            Self::Int16(_) => QValueKind::Int16,
            Self::Int32(_) => QValueKind::Int32,
            Self::Int64(_) => QValueKind::Int64,
            Self::Float32(_) => QValueKind::Float32,
            Self::Float64(_) => QValueKind::Float64,
            Self::Boolean(_) => QValueKind::Boolean,
            Self::Bytes(_) => QValueKind::Bytes,
            Self::Bit(_) => QValueKind::Bit,
            Self::Numeric(_) => QValueKind::Numeric,
            Self::Time(_) => QValueKind::Time,
            Self::TimeTz(_) => QValueKind::TimeTz,
            Self::Date(_) => QValueKind::Date,
            Self::Timestamp(_) => QValueKind::Timestamp,
            Self::TimestampTz(_) => QValueKind::TimestampTz,
            Self::HStore(_) => QValueKind::HStore,
            Self::Json(_) => QValueKind::Json,
            Self::Struct(_) => QValueKind::Struct,
            Self::ArrayInt32(_) => QValueKind::ArrayInt32,
            Self::ArrayInt64(_) => QValueKind::ArrayInt64,
            Self::ArrayFloat32(_) => QValueKind::ArrayFloat32,
            Self::ArrayFloat64(_) => QValueKind::ArrayFloat64,
            Self::ArrayString(_) => QValueKind::ArrayString,
        }
    }

    /// Check if value is a typed NULL.
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null(_))
    }

    /// Microseconds since the Unix epoch for instant kinds, since midnight
    /// for time-of-day kinds. `None` for non-temporal values.
    pub fn timestamp_micros(&self) -> Option<i64> {
        match self {
            Self::Timestamp(ts) => Some(ts.and_utc().timestamp_micros()),
            Self::TimestampTz(ts) => Some(ts.timestamp_micros()),
            Self::Date(d) => Some(d.and_hms_opt(0, 0, 0)?.and_utc().timestamp_micros()),
            Self::Time(t) | Self::TimeTz(t) => Some(
                i64::from(t.num_seconds_from_midnight()) * 1_000_000
                    + i64::from(t.nanosecond() / 1_000),
            ),
            _ => None,
        }
    }

    /// JSON projection, used for the raw-table payload column.
    ///
    /// Bytes render as base64, temporal kinds as RFC 3339 text, numerics as
    /// strings so precision survives the trip.
    pub fn to_json(&self) -> serde_json::Value {
        use base64::Engine as _;
        use serde_json::Value as J;

        match self {
            Self::Null(_) => J::Null,
            Self::Invalid(s)
            | Self::String(s)
            | Self::Geometry(s)
            | Self::Geography(s)
            | Self::Point(s)
            | Self::HStore(s)
            | Self::Struct(s) => J::String(s.clone()),
            Self::Json(s) => {
                serde_json::from_str(s).unwrap_or_else(|_| J::String(s.clone()))
            }
            Self::Uuid(u) => J::String(u.to_string()),
            Self::Int16(n) => J::from(*n),
            Self::Int32(n) => J::from(*n),
            Self::Int64(n) => J::from(*n),
            Self::Float32(n) => serde_json::Number::from_f64(f64::from(*n))
                .map(J::Number)
                .unwrap_or(J::Null),
            Self::Float64(n) => serde_json::Number::from_f64(*n)
                .map(J::Number)
                .unwrap_or(J::Null),
            Self::Boolean(b) => J::Bool(*b),
            Self::Bytes(b) | Self::Bit(b) => {
                J::String(base64::engine::general_purpose::STANDARD.encode(b))
            }
            Self::Numeric(d) => J::String(d.to_string()),
            Self::Time(t) | Self::TimeTz(t) => J::String(t.format("%H:%M:%S%.6f").to_string()),
            Self::Date(d) => J::String(d.to_string()),
            Self::Timestamp(ts) => J::String(ts.and_utc().to_rfc3339()),
            Self::TimestampTz(ts) => J::String(ts.to_rfc3339()),
            Self::ArrayInt32(xs) => J::from(xs.clone()),
            Self::ArrayInt64(xs) => J::from(xs.clone()),
            Self::ArrayFloat32(xs) => J::from(xs.clone()),
            Self::ArrayFloat64(xs) => J::from(xs.clone()),
            Self::ArrayString(xs) => J::from(xs.clone()),
        }
    }
}

impl From<bool> for QValue {
    fn from(v: bool) -> Self {
        Self::Boolean(v)
    }
}

impl From<i16> for QValue {
    fn from(v: i16) -> Self {
        Self::Int16(v)
    }
}

impl From<i32> for QValue {
    fn from(v: i32) -> Self {
        Self::Int32(v)
    }
}

impl From<i64> for QValue {
    fn from(v: i64) -> Self {
        Self::Int64(v)
    }
}

impl From<f32> for QValue {
    fn from(v: f32) -> Self {
        Self::Float32(v)
    }
}

impl From<f64> for QValue {
    fn from(v: f64) -> Self {
        Self::Float64(v)
    }
}

impl From<&str> for QValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_owned())
    }
}

impl From<String> for QValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<Decimal> for QValue {
    fn from(v: Decimal) -> Self {
        Self::Numeric(v)
    }
}

impl From<Uuid> for QValue {
    fn from(v: Uuid) -> Self {
        Self::Uuid(v)
    }
}

impl From<DateTime<Utc>> for QValue {
    fn from(v: DateTime<Utc>) -> Self {
        Self::TimestampTz(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_kind_roundtrip() {
        assert_eq!(QValue::Int64(7).kind(), QValueKind::Int64);
        assert_eq!(QValue::Null(QValueKind::Json).kind(), QValueKind::Json);
        assert_eq!(
            QValue::ArrayString(vec!["a".into()]).kind(),
            QValueKind::ArrayString
        );
    }

    #[test]
    fn test_is_null() {
        assert!(QValue::Null(QValueKind::String).is_null());
        assert!(!QValue::String(String::new()).is_null());
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(QValueKind::TimestampTz.to_string(), "timestamptz");
        assert_eq!(QValueKind::ArrayFloat64.to_string(), "array_float64");
    }

    #[test]
    fn test_timestamp_micros() {
        let ts = DateTime::<Utc>::from_timestamp(1_700_000_000, 123_000).unwrap();
        assert_eq!(
            QValue::TimestampTz(ts).timestamp_micros(),
            Some(1_700_000_000_000_123)
        );

        let t = NaiveTime::from_hms_micro_opt(1, 0, 0, 500).unwrap();
        assert_eq!(QValue::Time(t).timestamp_micros(), Some(3_600_000_500));

        assert_eq!(QValue::Int32(1).timestamp_micros(), None);
    }

    #[test]
    fn test_to_json_scalars() {
        assert_eq!(QValue::Int32(5).to_json(), serde_json::json!(5));
        assert_eq!(QValue::Boolean(true).to_json(), serde_json::json!(true));
        assert_eq!(QValue::Null(QValueKind::Int32).to_json(), serde_json::Value::Null);
        assert_eq!(
            QValue::Numeric(Decimal::from_str("12.340").unwrap()).to_json(),
            serde_json::json!("12.340")
        );
    }

    #[test]
    fn test_to_json_structured() {
        let json = QValue::Json(r#"{"a":1}"#.into()).to_json();
        assert_eq!(json, serde_json::json!({"a": 1}));

        let bytes = QValue::Bytes(vec![0xde, 0xad]).to_json();
        assert_eq!(bytes, serde_json::json!("3q0="));

        let arr = QValue::ArrayInt64(vec![1, 2, 3]).to_json();
        assert_eq!(arr, serde_json::json!([1, 2, 3]));
    }

    #[test]
    fn test_temporal_kind_checks() {
        assert!(QValueKind::Date.is_temporal());
        assert!(QValueKind::ArrayInt32.is_array());
        assert!(!QValueKind::Json.is_temporal());
    }
}
