//! Error types for sync activities.
//!
//! Classification drives the workflow host's retry decisions: transient
//! I/O retries with backoff, schema and conversion failures are fatal for
//! the batch or partition, unique violations on metadata mean the work was
//! already applied, and cancellation is returned verbatim.

use peerflow_model::ModelError;
use thiserror::Error;

/// Errors raised by staging, load and merge operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Value model or record stream error
    #[error(transparent)]
    Model(#[from] ModelError),

    /// PostgreSQL error (source or destination)
    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// Avro schema or encoding error
    #[error("avro error: {0}")]
    Avro(#[from] apache_avro::Error),

    /// Object storage error
    #[error("object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    /// Local filesystem error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encode/decode error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid peer or flow configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Declared schema mismatches the actual data
    #[error("schema error: {0}")]
    Schema(String),

    /// A value could not be represented in the destination's Avro mapping
    #[error("conversion error: {0}")]
    Conversion(String),

    /// Source type OID with no decoder
    #[error("unsupported source type oid {oid}")]
    UnsupportedOid { oid: u32 },

    /// Replication protocol error
    #[error("replication error: {0}")]
    Replication(String),

    /// Destination load or DML failure, rolled back
    #[error("destination error: {0}")]
    Destination(String),

    /// Unique violation on a metadata key: the batch or partition was
    /// already applied
    #[error("metadata unique violation: {0}")]
    UniqueViolation(String),

    /// Operation timed out
    #[error("timeout: {0}")]
    Timeout(String),

    /// Context cancelled; no retry semantics attached
    #[error("cancelled: {0}")]
    Cancelled(String),
}

impl SyncError {
    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a schema error.
    pub fn schema(msg: impl Into<String>) -> Self {
        Self::Schema(msg.into())
    }

    /// Create a conversion error.
    pub fn conversion(msg: impl Into<String>) -> Self {
        Self::Conversion(msg.into())
    }

    /// Create a replication error.
    pub fn replication(msg: impl Into<String>) -> Self {
        Self::Replication(msg.into())
    }

    /// Create a destination error.
    pub fn destination(msg: impl Into<String>) -> Self {
        Self::Destination(msg.into())
    }

    /// Create a timeout error.
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a cancellation error.
    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    /// Whether the workflow host should retry this activity with backoff.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Postgres(e) => is_transient_pg_error(e),
            Self::Io(e) => {
                use std::io::ErrorKind;
                matches!(
                    e.kind(),
                    ErrorKind::ConnectionReset
                        | ErrorKind::ConnectionAborted
                        | ErrorKind::TimedOut
                        | ErrorKind::Interrupted
                )
            }
            Self::ObjectStore(_) | Self::Timeout(_) | Self::Destination(_) => true,
            Self::Replication(msg) => {
                msg.contains("connection reset") || msg.contains("connection lost")
            }

            Self::Model(_)
            | Self::Avro(_)
            | Self::Serialization(_)
            | Self::Config(_)
            | Self::Schema(_)
            | Self::Conversion(_)
            | Self::UnsupportedOid { .. }
            | Self::UniqueViolation(_)
            | Self::Cancelled(_) => false,
        }
    }

    /// Whether this error means the metadata key already exists, i.e. an
    /// idempotent retry found its work already applied.
    pub fn is_unique_violation(&self) -> bool {
        match self {
            Self::UniqueViolation(_) => true,
            Self::Postgres(e) => e
                .as_db_error()
                .is_some_and(|db| db.code() == &tokio_postgres::error::SqlState::UNIQUE_VIOLATION),
            _ => false,
        }
    }
}

/// SQLSTATE classes that signal a transient PostgreSQL failure.
fn is_transient_pg_error(e: &tokio_postgres::Error) -> bool {
    if let Some(db_error) = e.as_db_error() {
        let code = db_error.code().code();
        // Connection exception (08xxx), transaction rollback (40xxx),
        // insufficient resources (53xxx), operator intervention (57xxx
        // except query_canceled).
        return code.starts_with("08")
            || code.starts_with("40")
            || code.starts_with("53")
            || (code.starts_with("57") && code != "57014");
    }
    let msg = e.to_string().to_lowercase();
    msg.contains("connection") || msg.contains("closed") || msg.contains("timeout")
}

/// Result type for sync operations
pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retriable_classification() {
        assert!(SyncError::timeout("load").is_retriable());
        assert!(SyncError::destination("rate limited").is_retriable());
        assert!(!SyncError::schema("bad column").is_retriable());
        assert!(!SyncError::conversion("struct unsupported").is_retriable());
        assert!(!SyncError::cancelled("ctx").is_retriable());
        assert!(!SyncError::UnsupportedOid { oid: 9999 }.is_retriable());
    }

    #[test]
    fn test_unique_violation_classification() {
        assert!(SyncError::UniqueViolation("(flow, 3)".into()).is_unique_violation());
        assert!(!SyncError::schema("x").is_unique_violation());
    }

    #[test]
    fn test_model_error_propagates() {
        let err: SyncError = ModelError::schema("arity").into();
        assert!(err.to_string().contains("arity"));
        assert!(!err.is_retriable());
    }
}
