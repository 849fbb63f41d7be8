//! Avro schema derivation from record schemas.

use crate::dest::{DestinationProfile, TimeEncoding};
use crate::error::Result;
use peerflow_model::{QRecordSchema, QValueKind};
use serde_json::{json, Value};
use std::collections::HashSet;

/// Canonical Avro schema fragment for a value kind.
///
/// Total over all kinds: `Invalid` and `Struct` fall back to `"string"`
/// best effort. Temporal kinds follow the destination profile's time
/// encoding.
pub fn avro_schema_for_kind(kind: QValueKind, profile: &DestinationProfile) -> Value {
    match kind {
        QValueKind::Invalid
        | QValueKind::String
        | QValueKind::Uuid
        | QValueKind::Geometry
        | QValueKind::Geography
        | QValueKind::Point
        | QValueKind::HStore
        | QValueKind::Json
        | QValueKind::Struct => json!("string"),
        QValueKind::Int16 | QValueKind::Int32 | QValueKind::Int64 => json!("long"),
        QValueKind::Float32 => json!("float"),
        QValueKind::Float64 => json!("double"),
        QValueKind::Boolean => json!("boolean"),
        QValueKind::Bytes | QValueKind::Bit => json!("bytes"),
        QValueKind::Numeric => json!({
            "type": "bytes",
            "logicalType": "decimal",
            "precision": 38,
            "scale": 9,
        }),
        QValueKind::Time
        | QValueKind::TimeTz
        | QValueKind::Date
        | QValueKind::Timestamp
        | QValueKind::TimestampTz => match profile.time_encoding {
            TimeEncoding::Micros => json!({
                "type": "long",
                "logicalType": "timestamp-micros",
            }),
            TimeEncoding::MicrosString => json!("string"),
        },
        QValueKind::ArrayInt32 => json!({"type": "array", "items": "int"}),
        QValueKind::ArrayInt64 => json!({"type": "array", "items": "long"}),
        QValueKind::ArrayFloat32 => json!({"type": "array", "items": "float"}),
        QValueKind::ArrayFloat64 => json!({"type": "array", "items": "double"}),
        QValueKind::ArrayString => json!({"type": "array", "items": "string"}),
    }
}

/// A parsed Avro record schema plus the record schema it was derived from.
#[derive(Debug, Clone)]
pub struct QRecordAvroSchema {
    /// Parsed Avro schema handed to the OCF writer
    pub schema: apache_avro::Schema,
    /// The (reserved-column-free) record schema fields were derived from
    pub record: QRecordSchema,
    /// Fields wrapped in a `["null", T]` union
    pub nullable_fields: HashSet<String>,
}

/// Build the Avro record schema for a destination table.
///
/// Callers strip reserved destination columns from `record` first; fields
/// are emitted in declaration order and nullable fields become
/// `["null", T]` unions.
pub fn define_avro_schema(
    record_name: &str,
    record: &QRecordSchema,
    profile: &DestinationProfile,
) -> Result<QRecordAvroSchema> {
    let mut fields = Vec::with_capacity(record.len());
    let mut nullable_fields = HashSet::new();

    for field in record.fields() {
        let mut avro_type = avro_schema_for_kind(field.kind, profile);
        if field.nullable {
            avro_type = json!(["null", avro_type]);
            nullable_fields.insert(field.name.clone());
        }
        fields.push(json!({
            "name": field.name,
            "type": avro_type,
        }));
    }

    let schema_json = json!({
        "type": "record",
        "name": sanitize_avro_name(record_name),
        "fields": fields,
    });

    let schema = apache_avro::Schema::parse(&schema_json)?;
    Ok(QRecordAvroSchema {
        schema,
        record: record.clone(),
        nullable_fields,
    })
}

/// Avro record names must be identifiers; table names may carry dots or
/// dashes.
fn sanitize_avro_name(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if out.is_empty() || out.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}
