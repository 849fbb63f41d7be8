//! Record schemas
//!
//! A [`QRecordSchema`] is the ordered column list stamped once on a record
//! stream. It is immutable for the stream's lifetime; producers validate
//! row arity against it and destination codecs derive Avro schemas from it.

use crate::error::{ModelError, Result};
use crate::qvalue::{QValue, QValueKind};
use serde::{Deserialize, Serialize};

/// A single column declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QField {
    /// Column name, unique within the schema
    pub name: String,
    /// Logical kind of the column
    pub kind: QValueKind,
    /// Whether NULL values are allowed
    pub nullable: bool,
}

impl QField {
    /// Create a new field.
    pub fn new(name: impl Into<String>, kind: QValueKind, nullable: bool) -> Self {
        Self {
            name: name.into(),
            kind,
            nullable,
        }
    }
}

/// One row of typed values, in schema order.
pub type QRecord = Vec<QValue>;

/// Ordered, immutable column list for a record stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QRecordSchema {
    fields: Vec<QField>,
}

impl QRecordSchema {
    /// Build a schema, rejecting duplicate column names.
    pub fn new(fields: Vec<QField>) -> Result<Self> {
        let mut seen = std::collections::HashSet::with_capacity(fields.len());
        for field in &fields {
            if !seen.insert(field.name.as_str()) {
                return Err(ModelError::schema(format!(
                    "duplicate column name: {}",
                    field.name
                )));
            }
        }
        Ok(Self { fields })
    }

    /// The declared fields, in order.
    pub fn fields(&self) -> &[QField] {
        &self.fields
    }

    /// Number of columns.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether the schema has no columns.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Column names in declaration order.
    pub fn column_names(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.name.as_str()).collect()
    }

    /// Look up a field by name.
    pub fn field(&self, name: &str) -> Option<&QField> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// A copy of this schema with the named columns removed.
    ///
    /// Used to strip the reserved destination columns before deriving the
    /// staging Avro schema.
    pub fn without_columns(&self, skip: &[&str]) -> Self {
        Self {
            fields: self
                .fields
                .iter()
                .filter(|f| !skip.contains(&f.name.as_str()))
                .cloned()
                .collect(),
        }
    }

    /// Validate a row against this schema: arity and kind tags.
    ///
    /// A typed NULL in a non-nullable column is a schema violation; a
    /// non-null value whose kind differs from the declared kind is a
    /// conversion error.
    pub fn validate_record(&self, record: &[QValue]) -> Result<()> {
        if record.len() != self.fields.len() {
            return Err(ModelError::schema(format!(
                "row has {} values, schema declares {} columns",
                record.len(),
                self.fields.len()
            )));
        }
        for (field, value) in self.fields.iter().zip(record) {
            if value.is_null() {
                if !field.nullable {
                    return Err(ModelError::schema(format!(
                        "NULL in non-nullable column {}",
                        field.name
                    )));
                }
            } else if value.kind() != field.kind {
                return Err(ModelError::conversion(
                    &field.name,
                    field.kind,
                    format!("got {}", value.kind()),
                ));
            }
        }
        Ok(())
    }
}
