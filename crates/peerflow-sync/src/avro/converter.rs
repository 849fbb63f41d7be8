//! Destination-aware conversion from typed values to Avro values.
//!
//! This is the single place destination quirks touch value encoding:
//! Snowflake's stringified timestamps and its oversize-text cap live here
//! so the staging writer and the destination sync paths stay generic.

use crate::dest::{DestinationProfile, OversizePolicy, TimeEncoding};
use crate::error::{Result, SyncError};
use apache_avro::types::Value as AvroValue;
use peerflow_model::{parse_hstore, QValue, QValueKind};
use rust_decimal::Decimal;
use tracing::warn;

/// Convert one value for the Avro staging file.
///
/// `nullable` must match the field's schema: nullable fields are emitted
/// as `["null", T]` unions and values are wrapped with the branch tag.
/// Conversion failure is an error, never silent coercion.
pub fn to_avro(
    column: &str,
    value: &QValue,
    profile: &DestinationProfile,
    nullable: bool,
) -> Result<AvroValue> {
    if value.is_null() {
        if nullable {
            return Ok(AvroValue::Union(0, Box::new(AvroValue::Null)));
        }
        return Err(SyncError::conversion(format!(
            "NULL in non-nullable column {}",
            column
        )));
    }

    let converted = match value {
        QValue::Null(_) => unreachable!("handled above"),
        QValue::Invalid(s) | QValue::String(s) => {
            AvroValue::String(capped_text(column, s, profile))
        }
        QValue::Json(s) => AvroValue::String(capped_text(column, s, profile)),
        QValue::HStore(s) => {
            let json = parse_hstore(s)?;
            AvroValue::String(capped_text(column, &json, profile))
        }
        QValue::Uuid(u) => AvroValue::String(u.to_string()),
        QValue::Geometry(s) | QValue::Geography(s) | QValue::Point(s) => {
            AvroValue::String(s.clone())
        }
        QValue::Int16(n) => AvroValue::Long(i64::from(*n)),
        QValue::Int32(n) => AvroValue::Long(i64::from(*n)),
        QValue::Int64(n) => AvroValue::Long(*n),
        QValue::Float32(n) => AvroValue::Float(*n),
        QValue::Float64(n) => AvroValue::Double(*n),
        QValue::Boolean(b) => AvroValue::Boolean(*b),
        QValue::Bytes(b) | QValue::Bit(b) => AvroValue::Bytes(b.clone()),
        QValue::Numeric(d) => decimal_to_avro(column, d)?,
        QValue::Time(_)
        | QValue::TimeTz(_)
        | QValue::Date(_)
        | QValue::Timestamp(_)
        | QValue::TimestampTz(_) => {
            let micros = value.timestamp_micros().ok_or_else(|| {
                SyncError::conversion(format!("temporal value out of range in column {}", column))
            })?;
            match profile.time_encoding {
                TimeEncoding::Micros => AvroValue::TimestampMicros(micros),
                TimeEncoding::MicrosString => AvroValue::String(micros.to_string()),
            }
        }
        QValue::Struct(_) => {
            return Err(SyncError::conversion(format!(
                "struct values are not supported in avro staging (column {})",
                column
            )));
        }
        QValue::ArrayInt32(xs) => {
            AvroValue::Array(xs.iter().map(|x| AvroValue::Int(*x)).collect())
        }
        QValue::ArrayInt64(xs) => {
            AvroValue::Array(xs.iter().map(|x| AvroValue::Long(*x)).collect())
        }
        QValue::ArrayFloat32(xs) => {
            AvroValue::Array(xs.iter().map(|x| AvroValue::Float(*x)).collect())
        }
        QValue::ArrayFloat64(xs) => {
            AvroValue::Array(xs.iter().map(|x| AvroValue::Double(*x)).collect())
        }
        QValue::ArrayString(xs) => {
            AvroValue::Array(xs.iter().map(|x| AvroValue::String(x.clone())).collect())
        }
    };

    if nullable {
        Ok(AvroValue::Union(1, Box::new(converted)))
    } else {
        Ok(converted)
    }
}

/// Apply the destination's oversize policy to a text payload.
///
/// Replacement is documented behavior, not silent data loss: the warning
/// names the column, the observed size and the cap.
fn capped_text(column: &str, text: &str, profile: &DestinationProfile) -> String {
    if let OversizePolicy::Truncate { limit } = profile.oversize_policy {
        if text.len() > limit {
            warn!(
                column,
                size_bytes = text.len(),
                limit_bytes = limit,
                "text value exceeds destination cap, replaced with empty string"
            );
            return String::new();
        }
    }
    text.to_string()
}

/// Encode a decimal as two's-complement unscaled bytes at scale 9, the
/// scale declared by the staging schema's decimal logical type.
fn decimal_to_avro(column: &str, value: &Decimal) -> Result<AvroValue> {
    const TARGET_SCALE: u32 = 9;

    let rounded = value.round_dp(TARGET_SCALE);
    let rescale = 10i128
        .checked_pow(TARGET_SCALE - rounded.scale())
        .ok_or_else(|| invalid_numeric(column))?;
    let unscaled = rounded
        .mantissa()
        .checked_mul(rescale)
        .ok_or_else(|| invalid_numeric(column))?;

    Ok(AvroValue::Decimal(apache_avro::Decimal::from(
        min_twos_complement(unscaled),
    )))
}

fn invalid_numeric(column: &str) -> SyncError {
    SyncError::conversion(format!(
        "numeric value in column {} does not fit the declared decimal scale",
        column
    ))
}

/// Big-endian two's-complement with redundant sign bytes trimmed.
fn min_twos_complement(value: i128) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let mut start = 0;
    while start < bytes.len() - 1 {
        let sign_extends = (bytes[start] == 0x00 && bytes[start + 1] & 0x80 == 0)
            || (bytes[start] == 0xFF && bytes[start + 1] & 0x80 != 0);
        if !sign_extends {
            break;
        }
        start += 1;
    }
    bytes[start..].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dest::DwhType;
    use chrono::DateTime;
    use std::str::FromStr;

    fn bigquery() -> DestinationProfile {
        DestinationProfile::for_dwh(DwhType::BigQuery)
    }

    fn snowflake() -> DestinationProfile {
        DestinationProfile::for_dwh(DwhType::Snowflake)
    }

    #[test]
    fn test_nullable_union_wrapping() {
        let v = to_avro("name", &QValue::String("a".into()), &bigquery(), true).unwrap();
        assert_eq!(v, AvroValue::Union(1, Box::new(AvroValue::String("a".into()))));

        let v = to_avro("name", &QValue::Null(QValueKind::String), &bigquery(), true).unwrap();
        assert_eq!(v, AvroValue::Union(0, Box::new(AvroValue::Null)));
    }

    #[test]
    fn test_null_in_non_nullable_errors() {
        let err =
            to_avro("id", &QValue::Null(QValueKind::Int64), &bigquery(), false).unwrap_err();
        assert!(matches!(err, SyncError::Conversion(_)));
    }

    #[test]
    fn test_timestamp_encoding_per_destination() {
        let ts = QValue::TimestampTz(DateTime::from_timestamp(1_700_000_000, 0).unwrap());

        let v = to_avro("ts", &ts, &bigquery(), false).unwrap();
        assert_eq!(v, AvroValue::TimestampMicros(1_700_000_000_000_000));

        let v = to_avro("ts", &ts, &snowflake(), false).unwrap();
        assert_eq!(v, AvroValue::String("1700000000000000".into()));
    }

    #[test]
    fn test_oversize_string_truncated_for_snowflake() {
        let big = "x".repeat(crate::dest::SNOWFLAKE_MAX_STRING_BYTES + 1);

        let v = to_avro("body", &QValue::String(big.clone()), &snowflake(), false).unwrap();
        assert_eq!(v, AvroValue::String(String::new()));

        // Other destinations pass the value through untouched.
        let v = to_avro("body", &QValue::String(big.clone()), &bigquery(), false).unwrap();
        assert_eq!(v, AvroValue::String(big));
    }

    #[test]
    fn test_oversize_json_truncated_for_snowflake() {
        let big = format!("\"{}\"", "j".repeat(crate::dest::SNOWFLAKE_MAX_STRING_BYTES + 1));
        let v = to_avro("doc", &QValue::Json(big), &snowflake(), true).unwrap();
        assert_eq!(v, AvroValue::Union(1, Box::new(AvroValue::String(String::new()))));
    }

    #[test]
    fn test_uuid_canonical_string() {
        let u = uuid::Uuid::from_bytes([0x11; 16]);
        let v = to_avro("id", &QValue::Uuid(u), &bigquery(), false).unwrap();
        assert_eq!(
            v,
            AvroValue::String("11111111-1111-1111-1111-111111111111".into())
        );
    }

    #[test]
    fn test_hstore_converted_to_json() {
        let v = to_avro(
            "attrs",
            &QValue::HStore(r#""a"=>"1""#.into()),
            &bigquery(),
            false,
        )
        .unwrap();
        assert_eq!(v, AvroValue::String(r#"{"a":"1"}"#.into()));
    }

    #[test]
    fn test_struct_unsupported() {
        let err = to_avro("s", &QValue::Struct("(1,2)".into()), &bigquery(), false).unwrap_err();
        assert!(err.to_string().contains("struct"));
    }

    #[test]
    fn test_arrays_have_no_element_unions() {
        let v = to_avro("xs", &QValue::ArrayInt32(vec![1, 2]), &bigquery(), false).unwrap();
        assert_eq!(
            v,
            AvroValue::Array(vec![AvroValue::Int(1), AvroValue::Int(2)])
        );
    }

    #[test]
    fn test_int_kinds_widen_to_long() {
        assert_eq!(
            to_avro("n", &QValue::Int16(3), &bigquery(), false).unwrap(),
            AvroValue::Long(3)
        );
    }

    #[test]
    fn test_decimal_scale_9_encoding() {
        // 12.5 at scale 9 -> unscaled 12_500_000_000
        let v = to_avro(
            "amount",
            &QValue::Numeric(Decimal::from_str("12.5").unwrap()),
            &bigquery(),
            false,
        )
        .unwrap();
        let expected = apache_avro::Decimal::from(min_twos_complement(12_500_000_000));
        assert_eq!(v, AvroValue::Decimal(expected));
    }

    #[test]
    fn test_min_twos_complement() {
        assert_eq!(min_twos_complement(0), vec![0x00]);
        assert_eq!(min_twos_complement(1), vec![0x01]);
        assert_eq!(min_twos_complement(-1), vec![0xFF]);
        assert_eq!(min_twos_complement(128), vec![0x00, 0x80]);
        assert_eq!(min_twos_complement(-129), vec![0xFF, 0x7F]);
    }
}
