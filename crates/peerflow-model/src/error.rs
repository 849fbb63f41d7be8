//! Error types for the value model and record streams.

use crate::qvalue::QValueKind;
use thiserror::Error;

/// Errors raised by the typed value model and the record stream plumbing.
///
/// All variants carry owned strings so errors can be cloned into the
/// terminal item of a record stream and observed by both halves.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    /// Declared schema mismatches the actual row shape.
    #[error("schema error: {0}")]
    Schema(String),

    /// A value could not be represented as its declared kind.
    #[error("conversion error in column {column}: expected {expected}, {detail}")]
    Conversion {
        column: String,
        expected: QValueKind,
        detail: String,
    },

    /// The stream terminated without a checkpoint (producer dropped).
    #[error("record stream closed: {0}")]
    StreamClosed(String),

    /// The consumer went away while the producer was still pushing.
    #[error("record stream cancelled: {0}")]
    Cancelled(String),

    /// Malformed hstore literal.
    #[error("hstore parse error: {0}")]
    Hstore(String),
}

impl ModelError {
    /// Create a new schema error.
    pub fn schema(msg: impl Into<String>) -> Self {
        Self::Schema(msg.into())
    }

    /// Create a new conversion error.
    pub fn conversion(
        column: impl Into<String>,
        expected: QValueKind,
        detail: impl Into<String>,
    ) -> Self {
        Self::Conversion {
            column: column.into(),
            expected,
            detail: detail.into(),
        }
    }

    /// Create a new hstore error.
    pub fn hstore(msg: impl Into<String>) -> Self {
        Self::Hstore(msg.into())
    }
}

/// Result type for model operations
pub type Result<T> = std::result::Result<T, ModelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ModelError::conversion("amount", QValueKind::Numeric, "got a string");
        let msg = err.to_string();
        assert!(msg.contains("amount"));
        assert!(msg.contains("numeric"));
        assert!(msg.contains("got a string"));
    }

    #[test]
    fn test_error_clone_eq() {
        let err = ModelError::schema("arity mismatch");
        assert_eq!(err.clone(), err);
    }
}
