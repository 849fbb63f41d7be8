//! In-memory destination.
//!
//! Reference implementation of the [`Destination`](super::Destination)
//! seam: tables are row counters, transactions apply the canonical
//! metadata statements produced by [`crate::metadata::MetadataTables`], and
//! failures can be scripted. Tests drive the full stage/load/merge path
//! against it; single-process tools can use it as a dry-run destination.

use super::{Destination, DestinationProfile, DwhType, WriteDisposition};
use crate::avro::writer::AvroFile;
use crate::error::{Result, SyncError};
use crate::metadata::{CDC_METADATA_TABLE, NORMALIZE_METADATA_TABLE, QREP_METADATA_TABLE};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

/// One recorded `load_avro` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadRecord {
    pub table: String,
    pub num_records: usize,
    pub truncate: bool,
}

#[derive(Debug, Default)]
struct State {
    /// Row counts per table
    tables: HashMap<String, u64>,
    /// Applied QRep partitions, keyed (flow, partition_id)
    partitions: HashSet<(String, String)>,
    /// Last committed sync batch and checkpoint per flow
    sync_state: HashMap<String, (i64, String)>,
    /// Committed batch ids per flow, in commit order
    sync_history: HashMap<String, Vec<i64>>,
    /// Normalize high-water mark per flow
    normalized: HashMap<String, i64>,
    /// Every committed transaction, in order
    transactions: Vec<Vec<String>>,
    /// Every load, in order
    loads: Vec<LoadRecord>,
    /// Dropped tables, in order
    dropped: Vec<String>,
    fail_next_transaction: Option<String>,
    fail_next_load: Option<String>,
}

/// In-memory [`Destination`].
pub struct MemoryDestination {
    profile: DestinationProfile,
    state: Mutex<State>,
}

impl MemoryDestination {
    pub fn new(dwh: DwhType) -> Self {
        Self {
            profile: DestinationProfile::for_dwh(dwh),
            state: Mutex::new(State::default()),
        }
    }

    /// Fail the next `execute_transaction` call with a destination error.
    pub fn fail_next_transaction(&self, message: impl Into<String>) {
        self.state.lock().unwrap().fail_next_transaction = Some(message.into());
    }

    /// Fail the next `load_avro` call with a destination error.
    pub fn fail_next_load(&self, message: impl Into<String>) {
        self.state.lock().unwrap().fail_next_load = Some(message.into());
    }

    /// Row count of a table, 0 when absent.
    pub fn table_rows(&self, table: &str) -> u64 {
        self.state
            .lock()
            .unwrap()
            .tables
            .get(table)
            .copied()
            .unwrap_or(0)
    }

    /// Whether a table currently exists.
    pub fn table_exists(&self, table: &str) -> bool {
        self.state.lock().unwrap().tables.contains_key(table)
    }

    /// All committed transactions.
    pub fn transactions(&self) -> Vec<Vec<String>> {
        self.state.lock().unwrap().transactions.clone()
    }

    /// All recorded loads.
    pub fn loads(&self) -> Vec<LoadRecord> {
        self.state.lock().unwrap().loads.clone()
    }

    /// All dropped tables.
    pub fn dropped_tables(&self) -> Vec<String> {
        self.state.lock().unwrap().dropped.clone()
    }

    /// Batch ids committed for a flow, in order.
    pub fn batch_history(&self, flow_job_name: &str) -> Vec<i64> {
        self.state
            .lock()
            .unwrap()
            .sync_history
            .get(flow_job_name)
            .cloned()
            .unwrap_or_default()
    }

    /// Apply one statement's effects. Returns an error without side
    /// effects when the statement violates a metadata key.
    fn apply(state: &mut State, stmt: &str) -> Result<()> {
        if let Some(rest) = stmt.strip_prefix(&format!("INSERT INTO {} ", QREP_METADATA_TABLE)) {
            let literals = quoted_literals(rest);
            let (flow, partition_id) = match (literals.first(), literals.get(1)) {
                (Some(flow), Some(partition)) => (flow.clone(), partition.clone()),
                _ => {
                    return Err(SyncError::destination(format!(
                        "malformed qrep metadata insert: {}",
                        stmt
                    )));
                }
            };
            if !state.partitions.insert((flow.clone(), partition_id.clone())) {
                return Err(SyncError::UniqueViolation(format!(
                    "({}, {})",
                    flow, partition_id
                )));
            }
        } else if stmt.starts_with(&format!("INSERT INTO {} ", CDC_METADATA_TABLE)) {
            let flow = quoted_literals(stmt)
                .into_iter()
                .next()
                .ok_or_else(|| SyncError::destination("malformed cdc metadata upsert"))?;
            let batch_id = integer_after(stmt, "last_batch_id = ")
                .ok_or_else(|| SyncError::destination("malformed cdc metadata upsert"))?;
            let checkpoint = quoted_literals(stmt)
                .get(1)
                .cloned()
                .unwrap_or_default();

            let last = state.sync_state.get(&flow).map(|(id, _)| *id).unwrap_or(0);
            if batch_id <= last {
                return Err(SyncError::UniqueViolation(format!(
                    "batch {} already applied for flow {} (last {})",
                    batch_id, flow, last
                )));
            }
            state.sync_state.insert(flow.clone(), (batch_id, checkpoint));
            state.sync_history.entry(flow).or_default().push(batch_id);
        } else if stmt.starts_with(&format!("INSERT INTO {} ", NORMALIZE_METADATA_TABLE)) {
            let flow = quoted_literals(stmt)
                .into_iter()
                .next()
                .ok_or_else(|| SyncError::destination("malformed normalize metadata upsert"))?;
            let batch_id = integer_after(stmt, "last_normalized_batch_id = ")
                .ok_or_else(|| SyncError::destination("malformed normalize metadata upsert"))?;
            state.normalized.insert(flow, batch_id);
        } else if let Some(rest) = stmt.strip_prefix("INSERT INTO ") {
            // INSERT INTO <dst> SELECT ... FROM <src>
            let mut words = rest.split_whitespace();
            let dst = unquote(words.next().unwrap_or_default());
            let src = rest
                .rsplit_once(" FROM ")
                .map(|(_, src)| unquote(src.trim_end_matches(';').trim()));
            if let Some(src) = src {
                let rows = state.tables.get(&src).copied().unwrap_or(0);
                *state.tables.entry(dst).or_insert(0) += rows;
            }
        }
        // DDL and merge statements with no row-count effect are recorded
        // only.
        Ok(())
    }
}

#[async_trait]
impl Destination for MemoryDestination {
    fn profile(&self) -> &DestinationProfile {
        &self.profile
    }

    async fn setup_metadata_tables(&self) -> Result<()> {
        Ok(())
    }

    async fn load_avro(
        &self,
        table: &str,
        file: &AvroFile,
        disposition: WriteDisposition,
    ) -> Result<u64> {
        let mut state = self.state.lock().unwrap();
        if let Some(message) = state.fail_next_load.take() {
            return Err(SyncError::destination(message));
        }
        let truncate = matches!(disposition, WriteDisposition::Truncate);
        let rows = state.tables.entry(table.to_string()).or_insert(0);
        if truncate {
            *rows = file.num_records as u64;
        } else {
            *rows += file.num_records as u64;
        }
        state.loads.push(LoadRecord {
            table: table.to_string(),
            num_records: file.num_records,
            truncate,
        });
        Ok(file.num_records as u64)
    }

    async fn execute_transaction(&self, statements: &[String]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(message) = state.fail_next_transaction.take() {
            return Err(SyncError::destination(message));
        }

        // Validate-then-apply on a scratch copy keeps the transaction
        // atomic: a key violation mid-list must leave no effects.
        let mut scratch = State {
            tables: state.tables.clone(),
            partitions: state.partitions.clone(),
            sync_state: state.sync_state.clone(),
            sync_history: state.sync_history.clone(),
            normalized: state.normalized.clone(),
            ..State::default()
        };
        for stmt in statements {
            Self::apply(&mut scratch, stmt)?;
        }

        state.tables = scratch.tables;
        state.partitions = scratch.partitions;
        state.sync_state = scratch.sync_state;
        state.sync_history = scratch.sync_history;
        state.normalized = scratch.normalized;
        state.transactions.push(statements.to_vec());
        Ok(())
    }

    async fn drop_table(&self, table: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.tables.remove(table);
        state.dropped.push(table.to_string());
        Ok(())
    }

    async fn wait_for_table_ready(&self, table: &str, _timeout: Duration) -> Result<()> {
        if self.state.lock().unwrap().tables.contains_key(table) {
            Ok(())
        } else {
            Err(SyncError::timeout(format!(
                "table {} never became queryable",
                table
            )))
        }
    }

    async fn has_partition(&self, flow_job_name: &str, partition_id: &str) -> Result<bool> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .partitions
            .contains(&(flow_job_name.to_string(), partition_id.to_string())))
    }

    async fn last_sync_batch(&self, flow_job_name: &str) -> Result<(i64, Option<String>)> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .sync_state
            .get(flow_job_name)
            .map(|(id, cp)| (*id, Some(cp.clone())))
            .unwrap_or((0, None)))
    }

    async fn last_normalized_batch(&self, flow_job_name: &str) -> Result<i64> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .normalized
            .get(flow_job_name)
            .copied()
            .unwrap_or(0))
    }
}

/// Strip identifier quoting so table names key consistently; dotted paths
/// arrive as `` `schema`.`table` ``.
fn unquote(ident: &str) -> String {
    ident.replace(['`', '"'], "")
}

/// Extract `'...'` literals, un-doubling embedded quotes.
fn quoted_literals(stmt: &str) -> Vec<String> {
    let mut literals = Vec::new();
    let mut chars = stmt.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\'' {
            continue;
        }
        let mut literal = String::new();
        loop {
            match chars.next() {
                Some('\'') => {
                    if chars.peek() == Some(&'\'') {
                        chars.next();
                        literal.push('\'');
                    } else {
                        break;
                    }
                }
                Some(other) => literal.push(other),
                None => break,
            }
        }
        literals.push(literal);
    }
    literals
}

/// Parse the integer immediately following `marker`.
fn integer_after(stmt: &str, marker: &str) -> Option<i64> {
    let rest = stmt.split(marker).nth(1)?;
    let digits: String = rest
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '-')
        .collect();
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::MetadataTables;
    use chrono::Utc;
    use peerflow_model::{Checkpoint, PartitionRange, QRepPartition};

    fn avro_file(num_records: usize) -> AvroFile {
        AvroFile::local(num_records, num_records * 16, "/tmp/test.avro")
    }

    fn partition(id: &str) -> QRepPartition {
        QRepPartition {
            partition_id: id.into(),
            range: PartitionRange::Int { start: 0, end: 10 },
            watermark_column: "id".into(),
        }
    }

    #[tokio::test]
    async fn test_load_dispositions() {
        let dest = MemoryDestination::new(DwhType::BigQuery);
        dest.load_avro("staging", &avro_file(5), WriteDisposition::Truncate)
            .await
            .unwrap();
        dest.load_avro("staging", &avro_file(3), WriteDisposition::Append)
            .await
            .unwrap();
        assert_eq!(dest.table_rows("staging"), 8);

        dest.load_avro("staging", &avro_file(2), WriteDisposition::Truncate)
            .await
            .unwrap();
        assert_eq!(dest.table_rows("staging"), 2);
    }

    #[tokio::test]
    async fn test_qrep_metadata_unique_violation() {
        let dest = MemoryDestination::new(DwhType::BigQuery);
        let meta = MetadataTables::new();
        let stmt = meta
            .qrep_partition_insert("flow_a", &partition("p1"), Utc::now(), Utc::now())
            .unwrap();

        dest.execute_transaction(&[stmt.clone()]).await.unwrap();
        assert!(dest.has_partition("flow_a", "p1").await.unwrap());

        let err = dest.execute_transaction(&[stmt]).await.unwrap_err();
        assert!(err.is_unique_violation());
    }

    #[tokio::test]
    async fn test_transaction_atomicity() {
        let dest = MemoryDestination::new(DwhType::BigQuery);
        let meta = MetadataTables::new();
        dest.load_avro("events_staging", &avro_file(4), WriteDisposition::Truncate)
            .await
            .unwrap();

        let insert = "INSERT INTO events SELECT * FROM events_staging".to_string();
        let dup = meta
            .qrep_partition_insert("flow_a", &partition("p1"), Utc::now(), Utc::now())
            .unwrap();
        dest.execute_transaction(&[dup.clone()]).await.unwrap();

        // Second transaction hits the unique violation; the insert's row
        // effect must not survive.
        let err = dest
            .execute_transaction(&[insert, dup])
            .await
            .unwrap_err();
        assert!(err.is_unique_violation());
        assert_eq!(dest.table_rows("events"), 0);
    }

    #[tokio::test]
    async fn test_cdc_state_monotonic() {
        let dest = MemoryDestination::new(DwhType::BigQuery);
        let meta = MetadataTables::new();

        dest.execute_transaction(&[meta.cdc_state_upsert("flow_a", 1, &Checkpoint::Lsn(10))])
            .await
            .unwrap();
        dest.execute_transaction(&[meta.cdc_state_upsert("flow_a", 2, &Checkpoint::Lsn(20))])
            .await
            .unwrap();
        assert_eq!(
            dest.last_sync_batch("flow_a").await.unwrap(),
            (2, Some("0/14".into()))
        );

        // Replaying an old batch id is a key violation, not data loss.
        let err = dest
            .execute_transaction(&[meta.cdc_state_upsert("flow_a", 2, &Checkpoint::Lsn(20))])
            .await
            .unwrap_err();
        assert!(err.is_unique_violation());
        assert_eq!(dest.batch_history("flow_a"), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_scripted_failures() {
        let dest = MemoryDestination::new(DwhType::BigQuery);
        dest.fail_next_load("quota exhausted");
        let err = dest
            .load_avro("t", &avro_file(1), WriteDisposition::Truncate)
            .await
            .unwrap_err();
        assert!(err.is_retriable());

        dest.fail_next_transaction("deadline exceeded");
        let err = dest
            .execute_transaction(&["SELECT 1".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Destination(_)));

        // One-shot: the next call succeeds.
        dest.execute_transaction(&["SELECT 1".to_string()])
            .await
            .unwrap();
    }

    #[test]
    fn test_quoted_literals() {
        assert_eq!(
            quoted_literals("VALUES ('a', 'b''c', 3)"),
            vec!["a".to_string(), "b'c".to_string()]
        );
    }

    #[test]
    fn test_integer_after() {
        assert_eq!(integer_after("SET last_batch_id = 42,", "last_batch_id = "), Some(42));
        assert_eq!(integer_after("none here", "last_batch_id = "), None);
    }
}
