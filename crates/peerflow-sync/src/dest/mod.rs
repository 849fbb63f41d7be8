//! Destination abstraction.
//!
//! Destination SDKs live outside this crate; the pipeline consumes them
//! through [`Destination`], a seam exposing "load an OCF" and "execute
//! DDL/DML" primitives plus the metadata queries the sync activities need
//! for idempotent restart.
//!
//! Warehouse-specific quirks are not scattered through the pipeline as
//! conditionals; they are centralized in [`DestinationProfile`] and
//! selected once per activity.

pub mod memory;

use crate::avro::writer::AvroFile;
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Reserved destination column recording when a row was synced.
pub const SYNCED_AT_COLUMN: &str = "_PEERDB_SYNCED_AT";

/// Reserved destination column for soft deletes.
pub const IS_DELETED_COLUMN: &str = "_PEERDB_IS_DELETED";

/// Snowflake rejects Avro string values beyond this size.
pub const SNOWFLAKE_MAX_STRING_BYTES: usize = 15 * 1024 * 1024;

/// Supported warehouse types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DwhType {
    BigQuery,
    Snowflake,
    Postgres,
    S3,
}

/// How temporal values are encoded into Avro.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeEncoding {
    /// `long` with logical type `timestamp-micros`
    Micros,
    /// Decimal string of the microsecond count. Snowflake misreads Avro
    /// timestamp logical types, so it gets the stringified form.
    MicrosString,
}

/// What to do with string payloads beyond a destination's size cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OversizePolicy {
    /// Pass the value through untouched
    Pass,
    /// Replace the value with the empty string and log a warning
    Truncate { limit: usize },
}

/// Destination-specific behavior, selected once per activity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationProfile {
    pub dwh: DwhType,
    pub time_encoding: TimeEncoding,
    pub oversize_policy: OversizePolicy,
    /// Wrap staged JSON columns with `PARSE_JSON(.., wide_number_mode=>'round')`
    /// in the merge projection
    pub parse_json_on_merge: bool,
    /// Wrap staged geography columns with `ST_GEOGFROMTEXT` in the merge
    /// projection
    pub geography_from_text: bool,
    /// Cast staged date columns with `CAST(.. AS DATE)` in the merge
    /// projection
    pub cast_date_on_merge: bool,
    /// Identifier quote character for generated SQL
    pub identifier_quote: char,
    /// The staged file is the destination artifact (object-storage
    /// destinations); it must survive activity exit instead of being
    /// cleaned up
    pub stage_is_destination: bool,
}

impl DestinationProfile {
    /// The profile for a warehouse type.
    pub fn for_dwh(dwh: DwhType) -> Self {
        match dwh {
            DwhType::BigQuery => Self {
                dwh,
                time_encoding: TimeEncoding::Micros,
                oversize_policy: OversizePolicy::Pass,
                parse_json_on_merge: true,
                geography_from_text: true,
                cast_date_on_merge: true,
                identifier_quote: '`',
                stage_is_destination: false,
            },
            DwhType::Snowflake => Self {
                dwh,
                time_encoding: TimeEncoding::MicrosString,
                oversize_policy: OversizePolicy::Truncate {
                    limit: SNOWFLAKE_MAX_STRING_BYTES,
                },
                parse_json_on_merge: false,
                geography_from_text: false,
                cast_date_on_merge: false,
                identifier_quote: '"',
                stage_is_destination: false,
            },
            DwhType::Postgres | DwhType::S3 => Self {
                dwh,
                time_encoding: TimeEncoding::Micros,
                oversize_policy: OversizePolicy::Pass,
                parse_json_on_merge: false,
                geography_from_text: false,
                cast_date_on_merge: false,
                identifier_quote: '"',
                stage_is_destination: matches!(dwh, DwhType::S3),
            },
        }
    }

    /// Quote an identifier for this destination's SQL dialect. Dotted
    /// paths quote each segment separately, so `schema.table` becomes a
    /// schema-qualified reference rather than one identifier with a
    /// period in it.
    pub fn quote(&self, ident: &str) -> String {
        let q = self.identifier_quote;
        ident
            .split('.')
            .map(|segment| format!("{q}{segment}{q}", q = q, segment = segment.replace(q, "")))
            .collect::<Vec<_>>()
            .join(".")
    }
}

/// Load disposition for staging tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteDisposition {
    /// Replace the staging table's contents. Retries overwrite cleanly.
    Truncate,
    /// Append to existing contents
    Append,
}

/// How QRep rows are applied to the destination table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum WriteMode {
    Append,
    Upsert { key_columns: Vec<String> },
}

/// Destination client seam.
///
/// Implementations wrap a warehouse SDK. All DML passed to
/// [`execute_transaction`](Destination::execute_transaction) must commit or
/// roll back atomically; the pipeline's correctness rests on that.
#[async_trait]
pub trait Destination: Send + Sync {
    /// The destination's quirk profile.
    fn profile(&self) -> &DestinationProfile;

    /// Create the metadata tables if they do not exist.
    async fn setup_metadata_tables(&self) -> Result<()>;

    /// Load an Avro OCF into `table`. Returns the row count loaded.
    async fn load_avro(
        &self,
        table: &str,
        file: &AvroFile,
        disposition: WriteDisposition,
    ) -> Result<u64>;

    /// Execute statements in one transaction.
    async fn execute_transaction(&self, statements: &[String]) -> Result<()>;

    /// Drop a table. Callers treat failures as non-fatal.
    async fn drop_table(&self, table: &str) -> Result<()>;

    /// Block until `table` is queryable. Destinations with eventually
    /// consistent metadata poll up to `timeout`; others return immediately.
    async fn wait_for_table_ready(&self, _table: &str, _timeout: Duration) -> Result<()> {
        Ok(())
    }

    /// Whether a QRep partition was already applied.
    async fn has_partition(&self, flow_job_name: &str, partition_id: &str) -> Result<bool>;

    /// Last committed sync batch and checkpoint for a flow. `(0, None)` for
    /// a flow that has never synced.
    async fn last_sync_batch(&self, flow_job_name: &str) -> Result<(i64, Option<String>)>;

    /// Last batch id the normalize pass has applied for a flow.
    async fn last_normalized_batch(&self, flow_job_name: &str) -> Result<i64>;
}
