//! PostgreSQL type mapping and row decoding.
//!
//! Maps type OIDs to value kinds and decodes rows on both source paths:
//! binary protocol rows from the query path and text tuples from the
//! logical replication path. An unrecognised OID is a typed error, never a
//! silent string fallback.

use crate::error::{Result, SyncError};
use bytes::Buf;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use peerflow_model::{QField, QRecordSchema, QValue, QValueKind};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::str::FromStr;
use tokio_postgres::types::{FromSql, Type};
use uuid::Uuid;

// Built-in type OIDs, from pg_type.dat.
const BOOL: u32 = 16;
const BYTEA: u32 = 17;
const CHAR: u32 = 18;
const NAME: u32 = 19;
const INT8: u32 = 20;
const INT2: u32 = 21;
const INT4: u32 = 23;
const TEXT: u32 = 25;
const OID: u32 = 26;
const JSON: u32 = 114;
const POINT: u32 = 600;
const FLOAT4: u32 = 700;
const FLOAT8: u32 = 701;
const INT4_ARRAY: u32 = 1007;
const TEXT_ARRAY: u32 = 1009;
const VARCHAR_ARRAY: u32 = 1015;
const INT8_ARRAY: u32 = 1016;
const FLOAT4_ARRAY: u32 = 1021;
const FLOAT8_ARRAY: u32 = 1022;
const BPCHAR: u32 = 1042;
const VARCHAR: u32 = 1043;
const DATE: u32 = 1082;
const TIME: u32 = 1083;
const TIMESTAMP: u32 = 1114;
const TIMESTAMPTZ: u32 = 1184;
const TIMETZ: u32 = 1266;
const BIT: u32 = 1560;
const VARBIT: u32 = 1562;
const NUMERIC: u32 = 1700;
const UUID_OID: u32 = 2950;
const JSONB: u32 = 3802;

/// Value kind for a type OID.
///
/// Extension types (hstore, PostGIS) have installation-specific OIDs;
/// `custom_types` maps those OIDs to their type names, fetched once per
/// connection from `pg_type`.
pub fn kind_for_oid(oid: u32, custom_types: &HashMap<u32, String>) -> Result<QValueKind> {
    let kind = match oid {
        BOOL => QValueKind::Boolean,
        BYTEA => QValueKind::Bytes,
        INT2 => QValueKind::Int16,
        INT4 => QValueKind::Int32,
        INT8 | OID => QValueKind::Int64,
        FLOAT4 => QValueKind::Float32,
        FLOAT8 => QValueKind::Float64,
        NUMERIC => QValueKind::Numeric,
        CHAR | NAME | TEXT | BPCHAR | VARCHAR => QValueKind::String,
        JSON | JSONB => QValueKind::Json,
        DATE => QValueKind::Date,
        TIME => QValueKind::Time,
        TIMETZ => QValueKind::TimeTz,
        TIMESTAMP => QValueKind::Timestamp,
        TIMESTAMPTZ => QValueKind::TimestampTz,
        BIT | VARBIT => QValueKind::Bit,
        UUID_OID => QValueKind::Uuid,
        POINT => QValueKind::Point,
        INT4_ARRAY => QValueKind::ArrayInt32,
        INT8_ARRAY => QValueKind::ArrayInt64,
        FLOAT4_ARRAY => QValueKind::ArrayFloat32,
        FLOAT8_ARRAY => QValueKind::ArrayFloat64,
        TEXT_ARRAY | VARCHAR_ARRAY => QValueKind::ArrayString,
        _ => match custom_types.get(&oid).map(String::as_str) {
            Some("hstore") => QValueKind::HStore,
            Some("geometry") => QValueKind::Geometry,
            Some("geography") => QValueKind::Geography,
            _ => return Err(SyncError::UnsupportedOid { oid }),
        },
    };
    Ok(kind)
}

/// Derive a record schema from a prepared statement's result columns.
///
/// Statement metadata does not expose nullability, so every column is
/// declared nullable, matching how staged Avro schemas are generated from
/// query results.
pub fn schema_from_columns(
    columns: &[tokio_postgres::Column],
    custom_types: &HashMap<u32, String>,
) -> Result<QRecordSchema> {
    let mut fields = Vec::with_capacity(columns.len());
    for column in columns {
        let oid = column.type_().oid();
        let kind = match kind_for_oid(oid, custom_types) {
            Ok(kind) => kind,
            // The prepared statement already resolved extension type names.
            Err(SyncError::UnsupportedOid { .. }) => {
                let mut resolved = HashMap::new();
                resolved.insert(oid, column.type_().name().to_string());
                kind_for_oid(oid, &resolved)?
            }
            Err(other) => return Err(other),
        };
        fields.push(QField::new(column.name(), kind, true));
    }
    QRecordSchema::new(fields).map_err(Into::into)
}

/// Decode one binary-protocol row into typed values, in schema order.
pub fn row_to_qvalues(row: &tokio_postgres::Row, schema: &QRecordSchema) -> Result<Vec<QValue>> {
    schema
        .fields()
        .iter()
        .enumerate()
        .map(|(idx, field)| row_value(row, idx, field.kind, &field.name))
        .collect()
}

fn row_value(
    row: &tokio_postgres::Row,
    idx: usize,
    kind: QValueKind,
    column: &str,
) -> Result<QValue> {
    fn get<'a, T>(
        row: &'a tokio_postgres::Row,
        idx: usize,
        kind: QValueKind,
        column: &str,
    ) -> Result<Option<T>>
    where
        T: FromSql<'a>,
    {
        row.try_get::<_, Option<T>>(idx)
            .map_err(|e| SyncError::conversion(format!("column {} ({}): {}", column, kind, e)))
    }

    macro_rules! typed {
        ($ty:ty, $variant:path) => {
            get::<$ty>(row, idx, kind, column)?
                .map($variant)
                .unwrap_or(QValue::Null(kind))
        };
    }

    let value = match kind {
        QValueKind::Boolean => typed!(bool, QValue::Boolean),
        QValueKind::Int16 => typed!(i16, QValue::Int16),
        QValueKind::Int32 => typed!(i32, QValue::Int32),
        QValueKind::Int64 => typed!(i64, QValue::Int64),
        QValueKind::Float32 => typed!(f32, QValue::Float32),
        QValueKind::Float64 => typed!(f64, QValue::Float64),
        QValueKind::Numeric => typed!(Decimal, QValue::Numeric),
        QValueKind::String => typed!(String, QValue::String),
        QValueKind::Invalid => typed!(String, QValue::Invalid),
        QValueKind::Struct => typed!(String, QValue::Struct),
        QValueKind::Bytes => typed!(Vec<u8>, QValue::Bytes),
        QValueKind::Date => typed!(NaiveDate, QValue::Date),
        QValueKind::Time => typed!(NaiveTime, QValue::Time),
        QValueKind::Timestamp => typed!(NaiveDateTime, QValue::Timestamp),
        QValueKind::TimestampTz => typed!(DateTime<Utc>, QValue::TimestampTz),
        QValueKind::Uuid => typed!(Uuid, QValue::Uuid),
        QValueKind::Json => get::<serde_json::Value>(row, idx, kind, column)?
            .map(|v| QValue::Json(v.to_string()))
            .unwrap_or(QValue::Null(kind)),
        QValueKind::TimeTz => get::<TimeTzWire>(row, idx, kind, column)?
            .map(|w| QValue::TimeTz(w.0))
            .unwrap_or(QValue::Null(kind)),
        QValueKind::Bit => get::<BitWire>(row, idx, kind, column)?
            .map(|w| QValue::Bit(w.0))
            .unwrap_or(QValue::Null(kind)),
        QValueKind::HStore => get::<HstoreWire>(row, idx, kind, column)?
            .map(|w| QValue::HStore(w.0))
            .unwrap_or(QValue::Null(kind)),
        QValueKind::Geometry => get::<RawWire>(row, idx, kind, column)?
            .map(|w| QValue::Geometry(hex::encode_upper(w.0)))
            .unwrap_or(QValue::Null(kind)),
        QValueKind::Geography => get::<RawWire>(row, idx, kind, column)?
            .map(|w| QValue::Geography(hex::encode_upper(w.0)))
            .unwrap_or(QValue::Null(kind)),
        QValueKind::Point => get::<PointWire>(row, idx, kind, column)?
            .map(|w| QValue::Point(w.0))
            .unwrap_or(QValue::Null(kind)),
        QValueKind::ArrayInt32 => typed!(Vec<i32>, QValue::ArrayInt32),
        QValueKind::ArrayInt64 => typed!(Vec<i64>, QValue::ArrayInt64),
        QValueKind::ArrayFloat32 => typed!(Vec<f32>, QValue::ArrayFloat32),
        QValueKind::ArrayFloat64 => typed!(Vec<f64>, QValue::ArrayFloat64),
        QValueKind::ArrayString => typed!(Vec<String>, QValue::ArrayString),
    };
    Ok(value)
}

/// timetz wire value normalized to UTC.
struct TimeTzWire(NaiveTime);

impl<'a> FromSql<'a> for TimeTzWire {
    fn from_sql(
        _ty: &Type,
        mut raw: &'a [u8],
    ) -> std::result::Result<Self, Box<dyn std::error::Error + Sync + Send>> {
        if raw.len() != 12 {
            return Err("timetz expects 12 bytes".into());
        }
        let micros = raw.get_i64();
        // Zone is seconds west of UTC; adding it normalizes to UTC.
        let zone_secs = raw.get_i32();
        let utc_micros =
            (micros + i64::from(zone_secs) * 1_000_000).rem_euclid(86_400_000_000);
        let time = NaiveTime::from_num_seconds_from_midnight_opt(
            (utc_micros / 1_000_000) as u32,
            ((utc_micros % 1_000_000) * 1_000) as u32,
        )
        .ok_or("timetz out of range")?;
        Ok(Self(time))
    }

    fn accepts(ty: &Type) -> bool {
        ty.oid() == TIMETZ
    }
}

/// bit/varbit wire value as packed bytes.
struct BitWire(Vec<u8>);

impl<'a> FromSql<'a> for BitWire {
    fn from_sql(
        _ty: &Type,
        mut raw: &'a [u8],
    ) -> std::result::Result<Self, Box<dyn std::error::Error + Sync + Send>> {
        if raw.len() < 4 {
            return Err("bit value too short".into());
        }
        let _bit_len = raw.get_i32();
        Ok(Self(raw.to_vec()))
    }

    fn accepts(ty: &Type) -> bool {
        matches!(ty.oid(), BIT | VARBIT)
    }
}

/// hstore wire value converted to its text literal form.
struct HstoreWire(String);

impl<'a> FromSql<'a> for HstoreWire {
    fn from_sql(
        _ty: &Type,
        mut raw: &'a [u8],
    ) -> std::result::Result<Self, Box<dyn std::error::Error + Sync + Send>> {
        if raw.len() < 4 {
            return Err("hstore value too short".into());
        }
        let count = raw.get_i32();
        let mut pairs = Vec::with_capacity(count.max(0) as usize);
        for _ in 0..count {
            let key_len = raw.get_i32();
            if key_len < 0 {
                return Err("hstore key cannot be null".into());
            }
            let key = std::str::from_utf8(&raw[..key_len as usize])?.to_string();
            raw.advance(key_len as usize);

            let value_len = raw.get_i32();
            let value = if value_len < 0 {
                None
            } else {
                let v = std::str::from_utf8(&raw[..value_len as usize])?.to_string();
                raw.advance(value_len as usize);
                Some(v)
            };
            pairs.push((key, value));
        }

        let literal = pairs
            .iter()
            .map(|(k, v)| match v {
                Some(v) => format!(
                    "\"{}\"=>\"{}\"",
                    escape_hstore(k),
                    escape_hstore(v)
                ),
                None => format!("\"{}\"=>NULL", escape_hstore(k)),
            })
            .collect::<Vec<_>>()
            .join(", ");
        Ok(Self(literal))
    }

    fn accepts(ty: &Type) -> bool {
        ty.name() == "hstore"
    }
}

fn escape_hstore(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Raw bytes of extension types carried as hex (PostGIS EWKB).
struct RawWire(Vec<u8>);

impl<'a> FromSql<'a> for RawWire {
    fn from_sql(
        _ty: &Type,
        raw: &'a [u8],
    ) -> std::result::Result<Self, Box<dyn std::error::Error + Sync + Send>> {
        Ok(Self(raw.to_vec()))
    }

    fn accepts(ty: &Type) -> bool {
        matches!(ty.name(), "geometry" | "geography")
    }
}

/// point wire value rendered in PostgreSQL's `(x,y)` form.
struct PointWire(String);

impl<'a> FromSql<'a> for PointWire {
    fn from_sql(
        _ty: &Type,
        mut raw: &'a [u8],
    ) -> std::result::Result<Self, Box<dyn std::error::Error + Sync + Send>> {
        if raw.len() != 16 {
            return Err("point expects 16 bytes".into());
        }
        let x = raw.get_f64();
        let y = raw.get_f64();
        Ok(Self(format!("({},{})", x, y)))
    }

    fn accepts(ty: &Type) -> bool {
        ty.oid() == POINT
    }
}

/// Decode one pgoutput text column into its typed value.
pub fn decode_text(kind: QValueKind, column: &str, text: &str) -> Result<QValue> {
    let conversion_err = |detail: String| {
        SyncError::conversion(format!("column {} ({}): {}", column, kind, detail))
    };

    let value = match kind {
        QValueKind::Invalid => QValue::Invalid(text.to_string()),
        QValueKind::Struct => QValue::Struct(text.to_string()),
        QValueKind::String => QValue::String(text.to_string()),
        QValueKind::Json => QValue::Json(text.to_string()),
        QValueKind::HStore => QValue::HStore(text.to_string()),
        QValueKind::Geometry => QValue::Geometry(text.to_string()),
        QValueKind::Geography => QValue::Geography(text.to_string()),
        QValueKind::Point => QValue::Point(text.to_string()),
        QValueKind::Boolean => match text {
            "t" | "true" => QValue::Boolean(true),
            "f" | "false" => QValue::Boolean(false),
            other => return Err(conversion_err(format!("invalid boolean {:?}", other))),
        },
        QValueKind::Int16 => QValue::Int16(
            text.parse()
                .map_err(|e| conversion_err(format!("{}", e)))?,
        ),
        QValueKind::Int32 => QValue::Int32(
            text.parse()
                .map_err(|e| conversion_err(format!("{}", e)))?,
        ),
        QValueKind::Int64 => QValue::Int64(
            text.parse()
                .map_err(|e| conversion_err(format!("{}", e)))?,
        ),
        QValueKind::Float32 => QValue::Float32(
            text.parse()
                .map_err(|e| conversion_err(format!("{}", e)))?,
        ),
        QValueKind::Float64 => QValue::Float64(
            text.parse()
                .map_err(|e| conversion_err(format!("{}", e)))?,
        ),
        QValueKind::Numeric => QValue::Numeric(
            Decimal::from_str(text)
                .or_else(|_| Decimal::from_scientific(text))
                .map_err(|e| conversion_err(format!("{}", e)))?,
        ),
        QValueKind::Bytes => {
            let hex_part = text
                .strip_prefix("\\x")
                .ok_or_else(|| conversion_err("bytea text must start with \\x".to_string()))?;
            QValue::Bytes(hex::decode(hex_part).map_err(|e| conversion_err(format!("{}", e)))?)
        }
        QValueKind::Bit => QValue::Bit(pack_bits(text).map_err(conversion_err)?),
        QValueKind::Uuid => QValue::Uuid(
            Uuid::parse_str(text).map_err(|e| conversion_err(format!("{}", e)))?,
        ),
        QValueKind::Date => QValue::Date(
            NaiveDate::parse_from_str(text, "%Y-%m-%d")
                .map_err(|e| conversion_err(format!("{}", e)))?,
        ),
        QValueKind::Time => QValue::Time(
            NaiveTime::parse_from_str(text, "%H:%M:%S%.f")
                .map_err(|e| conversion_err(format!("{}", e)))?,
        ),
        QValueKind::TimeTz => QValue::TimeTz(parse_timetz(text).map_err(conversion_err)?),
        QValueKind::Timestamp => QValue::Timestamp(
            NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
                .map_err(|e| conversion_err(format!("{}", e)))?,
        ),
        QValueKind::TimestampTz => QValue::TimestampTz(
            DateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f%#z")
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| conversion_err(format!("{}", e)))?,
        ),
        QValueKind::ArrayInt32 => QValue::ArrayInt32(parse_array(text, column, kind)?),
        QValueKind::ArrayInt64 => QValue::ArrayInt64(parse_array(text, column, kind)?),
        QValueKind::ArrayFloat32 => QValue::ArrayFloat32(parse_array(text, column, kind)?),
        QValueKind::ArrayFloat64 => QValue::ArrayFloat64(parse_array(text, column, kind)?),
        QValueKind::ArrayString => {
            QValue::ArrayString(split_array_elements(text, column, kind)?)
        }
    };
    Ok(value)
}

/// Parse `HH:MM:SS[.ffffff]±HH[:MM]` and normalize to UTC.
fn parse_timetz(text: &str) -> std::result::Result<NaiveTime, String> {
    let split_at = text
        .rfind(['+', '-'])
        .filter(|&i| i > 0)
        .ok_or_else(|| format!("timetz {:?} has no offset", text))?;
    let (time_part, offset_part) = text.split_at(split_at);

    let time = NaiveTime::parse_from_str(time_part, "%H:%M:%S%.f")
        .map_err(|e| format!("invalid timetz {:?}: {}", text, e))?;

    let sign: i64 = if offset_part.starts_with('-') { -1 } else { 1 };
    let digits = &offset_part[1..];
    let (hours, minutes) = match digits.split_once(':') {
        Some((h, m)) => (
            h.parse::<i64>().map_err(|e| e.to_string())?,
            m.parse::<i64>().map_err(|e| e.to_string())?,
        ),
        None => (digits.parse::<i64>().map_err(|e| e.to_string())?, 0),
    };
    let offset_secs = sign * (hours * 3600 + minutes * 60);

    use chrono::Timelike;
    let local_micros = i64::from(time.num_seconds_from_midnight()) * 1_000_000
        + i64::from(time.nanosecond() / 1_000);
    let utc_micros = (local_micros - offset_secs * 1_000_000).rem_euclid(86_400_000_000);
    NaiveTime::from_num_seconds_from_midnight_opt(
        (utc_micros / 1_000_000) as u32,
        ((utc_micros % 1_000_000) * 1_000) as u32,
    )
    .ok_or_else(|| format!("timetz {:?} out of range", text))
}

/// Pack a bit-string literal (`1010...`) MSB-first.
fn pack_bits(text: &str) -> std::result::Result<Vec<u8>, String> {
    let mut out = vec![0u8; text.len().div_ceil(8)];
    for (i, c) in text.chars().enumerate() {
        match c {
            '1' => out[i / 8] |= 0x80 >> (i % 8),
            '0' => {}
            other => return Err(format!("invalid bit {:?}", other)),
        }
    }
    Ok(out)
}

fn parse_array<T: FromStr>(text: &str, column: &str, kind: QValueKind) -> Result<Vec<T>>
where
    T::Err: std::fmt::Display,
{
    split_array_elements(text, column, kind)?
        .into_iter()
        .map(|elem| {
            elem.parse::<T>().map_err(|e| {
                SyncError::conversion(format!("column {} ({}): {}", column, kind, e))
            })
        })
        .collect()
}

/// Split a one-dimensional array literal into element strings.
///
/// Arrays carry no per-element null unions in the staged schema, so a NULL
/// element is a conversion error.
fn split_array_elements(text: &str, column: &str, kind: QValueKind) -> Result<Vec<String>> {
    let conversion_err = |detail: &str| {
        SyncError::conversion(format!("column {} ({}): {}", column, kind, detail))
    };

    let inner = text
        .strip_prefix('{')
        .and_then(|t| t.strip_suffix('}'))
        .ok_or_else(|| conversion_err("array literal must be wrapped in braces"))?;
    if inner.is_empty() {
        return Ok(Vec::new());
    }

    let mut elements = Vec::new();
    let mut current = String::new();
    let mut chars = inner.chars().peekable();
    let mut quoted = false;

    loop {
        match chars.next() {
            Some('"') => {
                quoted = true;
                loop {
                    match chars.next() {
                        Some('\\') => match chars.next() {
                            Some(escaped) => current.push(escaped),
                            None => return Err(conversion_err("unterminated escape")),
                        },
                        Some('"') => break,
                        Some(c) => current.push(c),
                        None => return Err(conversion_err("unterminated quoted element")),
                    }
                }
            }
            Some(',') => {
                push_element(&mut elements, &mut current, quoted, column, kind)?;
                quoted = false;
            }
            Some(c) => current.push(c),
            None => {
                push_element(&mut elements, &mut current, quoted, column, kind)?;
                break;
            }
        }
    }
    Ok(elements)
}

fn push_element(
    elements: &mut Vec<String>,
    current: &mut String,
    quoted: bool,
    column: &str,
    kind: QValueKind,
) -> Result<()> {
    let elem = std::mem::take(current);
    if !quoted && elem.eq_ignore_ascii_case("null") {
        return Err(SyncError::conversion(format!(
            "column {} ({}): NULL array elements are not supported",
            column, kind
        )));
    }
    elements.push(elem);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_custom() -> HashMap<u32, String> {
        HashMap::new()
    }

    #[test]
    fn test_kind_for_builtin_oids() {
        assert_eq!(kind_for_oid(16, &no_custom()).unwrap(), QValueKind::Boolean);
        assert_eq!(kind_for_oid(20, &no_custom()).unwrap(), QValueKind::Int64);
        assert_eq!(kind_for_oid(25, &no_custom()).unwrap(), QValueKind::String);
        assert_eq!(kind_for_oid(1700, &no_custom()).unwrap(), QValueKind::Numeric);
        assert_eq!(kind_for_oid(3802, &no_custom()).unwrap(), QValueKind::Json);
        assert_eq!(kind_for_oid(1184, &no_custom()).unwrap(), QValueKind::TimestampTz);
        assert_eq!(kind_for_oid(1007, &no_custom()).unwrap(), QValueKind::ArrayInt32);
    }

    #[test]
    fn test_unknown_oid_is_typed_error() {
        let err = kind_for_oid(99999, &no_custom()).unwrap_err();
        assert!(matches!(err, SyncError::UnsupportedOid { oid: 99999 }));
    }

    #[test]
    fn test_custom_oid_resolution() {
        let mut custom = HashMap::new();
        custom.insert(123456u32, "hstore".to_string());
        custom.insert(123457u32, "geography".to_string());
        assert_eq!(kind_for_oid(123456, &custom).unwrap(), QValueKind::HStore);
        assert_eq!(kind_for_oid(123457, &custom).unwrap(), QValueKind::Geography);
    }

    #[test]
    fn test_decode_text_scalars() {
        assert_eq!(
            decode_text(QValueKind::Boolean, "b", "t").unwrap(),
            QValue::Boolean(true)
        );
        assert_eq!(
            decode_text(QValueKind::Int64, "id", "42").unwrap(),
            QValue::Int64(42)
        );
        assert_eq!(
            decode_text(QValueKind::Float64, "f", "1.5").unwrap(),
            QValue::Float64(1.5)
        );
        assert_eq!(
            decode_text(QValueKind::Numeric, "n", "12.340").unwrap(),
            QValue::Numeric(Decimal::from_str("12.340").unwrap())
        );
    }

    #[test]
    fn test_decode_text_bytea() {
        assert_eq!(
            decode_text(QValueKind::Bytes, "b", "\\xdead").unwrap(),
            QValue::Bytes(vec![0xde, 0xad])
        );
        assert!(decode_text(QValueKind::Bytes, "b", "dead").is_err());
    }

    #[test]
    fn test_decode_text_temporal() {
        assert_eq!(
            decode_text(QValueKind::Date, "d", "2024-02-29").unwrap(),
            QValue::Date(NaiveDate::from_ymd_opt(2024, 2, 29).unwrap())
        );
        assert_eq!(
            decode_text(QValueKind::Timestamp, "ts", "2024-01-02 03:04:05.123456").unwrap(),
            QValue::Timestamp(
                NaiveDate::from_ymd_opt(2024, 1, 2)
                    .unwrap()
                    .and_hms_micro_opt(3, 4, 5, 123_456)
                    .unwrap()
            )
        );
        let tstz = decode_text(QValueKind::TimestampTz, "ts", "2024-01-02 03:04:05+00").unwrap();
        assert_eq!(
            tstz,
            QValue::TimestampTz(
                NaiveDate::from_ymd_opt(2024, 1, 2)
                    .unwrap()
                    .and_hms_opt(3, 4, 5)
                    .unwrap()
                    .and_utc()
            )
        );
    }

    #[test]
    fn test_decode_text_timetz_normalizes_to_utc() {
        assert_eq!(
            decode_text(QValueKind::TimeTz, "t", "12:00:00+02").unwrap(),
            QValue::TimeTz(NaiveTime::from_hms_opt(10, 0, 0).unwrap())
        );
        assert_eq!(
            decode_text(QValueKind::TimeTz, "t", "01:00:00-02:30").unwrap(),
            QValue::TimeTz(NaiveTime::from_hms_opt(3, 30, 0).unwrap())
        );
    }

    #[test]
    fn test_decode_text_uuid() {
        let u = "6ba7b810-9dad-11d1-80b4-00c04fd430c8";
        assert_eq!(
            decode_text(QValueKind::Uuid, "id", u).unwrap(),
            QValue::Uuid(Uuid::parse_str(u).unwrap())
        );
    }

    #[test]
    fn test_decode_text_bit_packing() {
        assert_eq!(
            decode_text(QValueKind::Bit, "b", "10100000").unwrap(),
            QValue::Bit(vec![0b1010_0000])
        );
        assert_eq!(
            decode_text(QValueKind::Bit, "b", "101").unwrap(),
            QValue::Bit(vec![0b1010_0000])
        );
        assert!(decode_text(QValueKind::Bit, "b", "102").is_err());
    }

    #[test]
    fn test_decode_text_arrays() {
        assert_eq!(
            decode_text(QValueKind::ArrayInt32, "xs", "{1,2,3}").unwrap(),
            QValue::ArrayInt32(vec![1, 2, 3])
        );
        assert_eq!(
            decode_text(QValueKind::ArrayFloat64, "xs", "{1.5,-2.25}").unwrap(),
            QValue::ArrayFloat64(vec![1.5, -2.25])
        );
        assert_eq!(
            decode_text(QValueKind::ArrayString, "xs", r#"{plain,"with, comma","esc\"aped"}"#)
                .unwrap(),
            QValue::ArrayString(vec![
                "plain".into(),
                "with, comma".into(),
                "esc\"aped".into()
            ])
        );
        assert_eq!(
            decode_text(QValueKind::ArrayString, "xs", "{}").unwrap(),
            QValue::ArrayString(vec![])
        );
    }

    #[test]
    fn test_decode_text_null_array_element_rejected() {
        let err = decode_text(QValueKind::ArrayInt32, "xs", "{1,NULL,3}").unwrap_err();
        assert!(err.to_string().contains("NULL array elements"));
    }

    #[test]
    fn test_decode_text_quoted_null_is_literal() {
        assert_eq!(
            decode_text(QValueKind::ArrayString, "xs", r#"{"NULL"}"#).unwrap(),
            QValue::ArrayString(vec!["NULL".into()])
        );
    }

    #[test]
    fn test_decode_text_invalid_kind_best_effort() {
        assert_eq!(
            decode_text(QValueKind::Invalid, "x", "whatever").unwrap(),
            QValue::Invalid("whatever".into())
        );
    }

    #[test]
    fn test_pack_bits() {
        assert_eq!(pack_bits("1111000010").unwrap(), vec![0b1111_0000, 0b1000_0000]);
    }
}
