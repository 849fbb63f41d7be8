//! Metadata tables and statement builders.
//!
//! Progress checkpoints ride the same destination transaction as the data
//! they describe. The builders here produce those statements; the
//! destination client executes them atomically with the merge.
//!
//! Keys: QRep metadata is keyed `(flow_job_name, partition_id)`, CDC
//! metadata `(flow_job_name)`. A unique violation on either key means an
//! idempotent retry found its work already applied.

use crate::error::{Result, SyncError};
use chrono::{DateTime, Utc};
use peerflow_model::{Checkpoint, QRepPartition};
use serde::{Deserialize, Serialize};

/// QRep partition metadata table.
pub const QREP_METADATA_TABLE: &str = "_peerdb_qrep_metadata";

/// CDC sync-state metadata table.
pub const CDC_METADATA_TABLE: &str = "_peerdb_sync_metadata";

/// Normalize progress table.
pub const NORMALIZE_METADATA_TABLE: &str = "_peerdb_normalize_metadata";

/// One committed CDC sync batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncBatch {
    /// Strictly increasing per flow
    pub batch_id: i64,
    pub flow_job_name: String,
    pub source_checkpoint: Checkpoint,
    pub record_count: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Builds metadata DDL and DML for a destination.
#[derive(Debug, Clone, Default)]
pub struct MetadataTables;

impl MetadataTables {
    pub fn new() -> Self {
        Self
    }

    /// DDL for all metadata tables.
    pub fn setup_statements(&self) -> Vec<String> {
        vec![
            format!(
                "CREATE TABLE IF NOT EXISTS {} (\
                 flow_job_name TEXT NOT NULL, \
                 partition_id TEXT NOT NULL, \
                 partition_json TEXT NOT NULL, \
                 start_time TIMESTAMP NOT NULL, \
                 end_time TIMESTAMP NOT NULL, \
                 PRIMARY KEY (flow_job_name, partition_id))",
                QREP_METADATA_TABLE
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (\
                 flow_job_name TEXT PRIMARY KEY, \
                 last_batch_id BIGINT NOT NULL, \
                 last_checkpoint TEXT NOT NULL, \
                 updated_at TIMESTAMP NOT NULL)",
                CDC_METADATA_TABLE
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (\
                 flow_job_name TEXT PRIMARY KEY, \
                 last_normalized_batch_id BIGINT NOT NULL, \
                 updated_at TIMESTAMP NOT NULL)",
                NORMALIZE_METADATA_TABLE
            ),
        ]
    }

    /// Insert recording a completed partition.
    ///
    /// The partition serializes to JSON; an encode failure surfaces here
    /// rather than being shadowed by a later statement error.
    pub fn qrep_partition_insert(
        &self,
        flow_job_name: &str,
        partition: &QRepPartition,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    ) -> Result<String> {
        let partition_json = serde_json::to_string(partition).map_err(SyncError::Serialization)?;
        Ok(format!(
            "INSERT INTO {} (flow_job_name, partition_id, partition_json, start_time, end_time) \
             VALUES ('{}', '{}', '{}', '{}', '{}')",
            QREP_METADATA_TABLE,
            escape_literal(flow_job_name),
            escape_literal(&partition.partition_id),
            escape_literal(&partition_json),
            start_time.to_rfc3339(),
            end_time.to_rfc3339(),
        ))
    }

    /// Upsert advancing `(last_batch_id, last_checkpoint)` atomically.
    pub fn cdc_state_upsert(
        &self,
        flow_job_name: &str,
        batch_id: i64,
        checkpoint: &Checkpoint,
    ) -> String {
        let checkpoint_text = escape_literal(&checkpoint.to_text());
        format!(
            "INSERT INTO {table} (flow_job_name, last_batch_id, last_checkpoint, updated_at) \
             VALUES ('{flow}', {batch}, '{cp}', CURRENT_TIMESTAMP) \
             ON CONFLICT (flow_job_name) DO UPDATE SET \
             last_batch_id = {batch}, last_checkpoint = '{cp}', updated_at = CURRENT_TIMESTAMP",
            table = CDC_METADATA_TABLE,
            flow = escape_literal(flow_job_name),
            batch = batch_id,
            cp = checkpoint_text,
        )
    }

    /// Upsert advancing the normalize high-water mark.
    pub fn normalize_state_upsert(&self, flow_job_name: &str, batch_id: i64) -> String {
        format!(
            "INSERT INTO {table} (flow_job_name, last_normalized_batch_id, updated_at) \
             VALUES ('{flow}', {batch}, CURRENT_TIMESTAMP) \
             ON CONFLICT (flow_job_name) DO UPDATE SET \
             last_normalized_batch_id = {batch}, updated_at = CURRENT_TIMESTAMP",
            table = NORMALIZE_METADATA_TABLE,
            flow = escape_literal(flow_job_name),
            batch = batch_id,
        )
    }

    /// Query for a partition's metadata row.
    pub fn qrep_partition_lookup(&self, flow_job_name: &str, partition_id: &str) -> String {
        format!(
            "SELECT partition_id FROM {} WHERE flow_job_name = '{}' AND partition_id = '{}'",
            QREP_METADATA_TABLE,
            escape_literal(flow_job_name),
            escape_literal(partition_id),
        )
    }
}

/// Double single quotes for embedding in a SQL string literal.
fn escape_literal(value: &str) -> String {
    value.replace('\'', "''")
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerflow_model::PartitionRange;

    #[test]
    fn test_qrep_insert_statement() {
        let partition = QRepPartition {
            partition_id: "abc-123".into(),
            range: PartitionRange::Int { start: 0, end: 10 },
            watermark_column: "id".into(),
        };
        let stmt = MetadataTables::new()
            .qrep_partition_insert("flow_a", &partition, Utc::now(), Utc::now())
            .unwrap();

        assert!(stmt.starts_with(&format!("INSERT INTO {}", QREP_METADATA_TABLE)));
        assert!(stmt.contains("'flow_a'"));
        assert!(stmt.contains("'abc-123'"));
        assert!(stmt.contains("watermark_column"));
    }

    #[test]
    fn test_cdc_upsert_statement() {
        let stmt =
            MetadataTables::new().cdc_state_upsert("flow_a", 7, &Checkpoint::Lsn(0x10_0000));
        assert!(stmt.contains("last_batch_id = 7"));
        assert!(stmt.contains("'0/100000'"));
        assert!(stmt.contains("ON CONFLICT (flow_job_name)"));
    }

    #[test]
    fn test_literal_escaping() {
        let stmt = MetadataTables::new().qrep_partition_lookup("o'flow", "p1");
        assert!(stmt.contains("'o''flow'"));
    }

    #[test]
    fn test_setup_statements_cover_all_tables() {
        let ddl = MetadataTables::new().setup_statements();
        assert_eq!(ddl.len(), 3);
        assert!(ddl[0].contains(QREP_METADATA_TABLE));
        assert!(ddl[1].contains(CDC_METADATA_TABLE));
        assert!(ddl[2].contains(NORMALIZE_METADATA_TABLE));
    }
}
