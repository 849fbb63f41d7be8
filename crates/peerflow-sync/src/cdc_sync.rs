//! CDC batch sync.
//!
//! Turns the committed-event stream into destination-applied batches. Each
//! batch gets a freshly allocated monotonic batch id, stages to Avro under
//! `<raw_table>_<batch_id>_staging`, loads with truncate disposition, and
//! merges into the raw table in the same transaction that advances
//! `(last_batch_id, last_checkpoint)`. Only after that transaction commits
//! may the source's replication slot be acknowledged up to the checkpoint.

use crate::avro::schema::define_avro_schema;
use crate::avro::writer::{OcfWriter, StorageTarget};
use crate::context::{ActivityContext, HeartbeatRoutine, HEARTBEAT_INTERVAL};
use crate::dest::{Destination, WriteDisposition};
use crate::error::{Result, SyncError};
use crate::metadata::{MetadataTables, SyncBatch};
use peerflow_model::{
    channel, BatchCounts, CdcItem, CdcReceiver, CdcRecord, Checkpoint, QField, QRecord,
    QRecordSchema, QValue, QValueKind, RecordBuffer,
};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// States an activity invocation moves through. `Cleanup` always runs;
/// any state may fall to `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Init,
    Staging,
    Loading,
    Merging,
    Committed,
    Cleanup,
    Failed,
}

/// CDC sync configuration for one flow.
#[derive(Debug, Clone)]
pub struct CdcSyncConfig {
    pub flow_job_name: String,
    /// Destination-side landing table for raw events
    pub raw_table: String,
    /// Flush a batch at this many events
    pub max_batch_size: usize,
    /// Flush a partial batch after this much source silence
    pub idle_timeout: Duration,
    pub staging: StorageTarget,
    /// `schema.table` at the source to destination table name
    pub table_mappings: HashMap<String, String>,
}

/// Outcome of one committed batch.
#[derive(Debug, Clone)]
pub struct SyncResult {
    /// The committed batch record
    pub batch: SyncBatch,
    pub counts: BatchCounts,
    /// States traversed, for stall diagnosis
    pub states: Vec<SyncState>,
}

impl SyncResult {
    pub fn batch_id(&self) -> i64 {
        self.batch.batch_id
    }

    /// Highest source checkpoint covered by the batch; may be acknowledged
    /// upstream now that it is durable.
    pub fn checkpoint(&self) -> &Checkpoint {
        &self.batch.source_checkpoint
    }

    pub fn num_records(&self) -> usize {
        self.batch.record_count
    }
}

/// Unified cross-op schema of the raw landing table.
pub fn raw_table_schema() -> QRecordSchema {
    QRecordSchema::new(vec![
        QField::new("_peerdb_uid", QValueKind::String, false),
        QField::new("_peerdb_timestamp", QValueKind::Int64, false),
        QField::new("_peerdb_destination_table_name", QValueKind::String, false),
        QField::new("_peerdb_data", QValueKind::Json, false),
        QField::new("_peerdb_record_type", QValueKind::Int64, false),
        QField::new("_peerdb_match_data", QValueKind::Json, true),
        QField::new("_peerdb_batch_id", QValueKind::Int64, false),
        QField::new("_peerdb_unchanged_toast_columns", QValueKind::String, true),
    ])
    .expect("raw table schema has unique column names")
}

/// Raw-table row for one event.
fn raw_record(record: &CdcRecord, destination_table: &str, batch_id: i64) -> Result<QRecord> {
    let payload = record
        .payload()
        .map(|items| items.to_json().to_string())
        .ok_or_else(|| {
            SyncError::schema(format!(
                "{} event for {} carries no row image",
                record.op,
                record.qualified_name()
            ))
        })?;
    let match_data = record
        .match_data()
        .map(|items| QValue::Json(items.to_json().to_string()))
        .unwrap_or(QValue::Null(QValueKind::Json));
    let unchanged_toast = if record.unchanged_toast_columns.is_empty() {
        QValue::Null(QValueKind::String)
    } else {
        QValue::String(record.unchanged_toast_columns.join(","))
    };

    Ok(vec![
        QValue::String(Uuid::new_v4().to_string()),
        QValue::Int64(record.source_ts.timestamp_micros()),
        QValue::String(destination_table.to_string()),
        QValue::Json(payload),
        QValue::Int64(record.op.record_type()),
        match_data,
        QValue::Int64(batch_id),
        unchanged_toast,
    ])
}

/// CDC sync against an Avro-staging destination.
pub struct CdcSync<'a, D: Destination + ?Sized> {
    destination: &'a D,
    metadata: MetadataTables,
}

impl<'a, D: Destination + ?Sized> CdcSync<'a, D> {
    pub fn new(destination: &'a D) -> Self {
        Self {
            destination,
            metadata: MetadataTables::new(),
        }
    }

    /// Accumulate and apply one batch. `Ok(None)` when the stream is
    /// drained or the idle timeout elapsed with nothing buffered.
    pub async fn sync_batch(
        &self,
        ctx: &ActivityContext,
        config: &CdcSyncConfig,
        receiver: &mut CdcReceiver,
    ) -> Result<Option<SyncResult>> {
        ctx.check_cancelled()?;
        if receiver.is_terminated() {
            return Ok(None);
        }

        let mut states = vec![SyncState::Init];
        let mut buffer = RecordBuffer::new(config.max_batch_size);
        let mut end_checkpoint: Option<Checkpoint> = None;

        loop {
            let item = tokio::select! {
                _ = ctx.cancel.cancelled() => {
                    return Err(SyncError::cancelled(format!(
                        "cdc sync cancelled for flow {}",
                        ctx.flow_job_name
                    )));
                }
                item = tokio::time::timeout(config.idle_timeout, receiver.next()) => item,
            };
            match item {
                Err(_) => {
                    // Idle timeout: flush what we have, or report nothing
                    // to sync.
                    if buffer.is_empty() {
                        return Ok(None);
                    }
                    break;
                }
                Ok(CdcItem::Record(record)) => {
                    if !config.table_mappings.contains_key(&record.qualified_name()) {
                        debug!(
                            table = %record.qualified_name(),
                            "event for unmapped table, skipping"
                        );
                        continue;
                    }
                    if buffer.push(record) {
                        break;
                    }
                }
                Ok(CdcItem::End(checkpoint)) => {
                    end_checkpoint = Some(checkpoint);
                    break;
                }
                Ok(CdcItem::Err(error)) => return Err(error.into()),
            }
        }

        if buffer.is_empty() {
            // Stream drained with nothing pending.
            return Ok(None);
        }

        let checkpoint = match end_checkpoint {
            Some(Checkpoint::Lsn(lsn)) => Checkpoint::Lsn(lsn.max(buffer.max_lsn())),
            Some(other) => other,
            None => Checkpoint::Lsn(buffer.max_lsn()),
        };
        let counts = buffer.counts();
        let records = buffer.take();

        let (batch_id, _) = self.destination.last_sync_batch(&config.flow_job_name).await?;
        let batch_id = batch_id + 1;

        let result = self
            .apply_batch(ctx, config, batch_id, checkpoint, counts, records, &mut states)
            .await;
        match result {
            Ok(result) => Ok(Some(result)),
            Err(err) => {
                error!(
                    flow = %config.flow_job_name,
                    batch_id,
                    states = ?states,
                    error = %err,
                    "batch sync failed"
                );
                Err(err)
            }
        }
    }

    async fn apply_batch(
        &self,
        ctx: &ActivityContext,
        config: &CdcSyncConfig,
        batch_id: i64,
        checkpoint: Checkpoint,
        counts: BatchCounts,
        records: Vec<CdcRecord>,
        states: &mut Vec<SyncState>,
    ) -> Result<SyncResult> {
        let started_at = chrono::Utc::now();
        let staging_table = format!("{}_{}_staging", config.raw_table, batch_id);
        let profile = self.destination.profile().clone();
        let schema = raw_table_schema();

        // Convert up front so conversion failures surface before any
        // destination work.
        let mut rows = Vec::with_capacity(records.len());
        for record in &records {
            let destination_table = config
                .table_mappings
                .get(&record.qualified_name())
                .cloned()
                .unwrap_or_else(|| record.qualified_name());
            rows.push(raw_record(record, &destination_table, batch_id)?);
        }

        states.push(SyncState::Staging);
        let avro_schema = define_avro_schema(&config.raw_table, &schema, &profile)?;
        let writer = OcfWriter::new(avro_schema, profile.clone());

        let (mut sender, mut stream_rx) = channel(rows.len().max(1));
        sender.set_schema(schema)?;
        let checkpoint_for_stream = checkpoint.clone();
        let producer = tokio::spawn(async move {
            for row in rows {
                if sender.push(row).await.is_err() {
                    return;
                }
            }
            let _ = sender.close(checkpoint_for_stream).await;
        });

        let staged = writer
            .write(
                ctx,
                &mut stream_rx,
                &config.staging,
                &batch_id.to_string(),
                &staging_table,
            )
            .await;
        producer.abort();
        let (file, _) = match staged {
            Ok(staged) => staged,
            Err(err) => {
                states.push(SyncState::Failed);
                states.push(SyncState::Cleanup);
                return Err(err);
            }
        };

        let merge_result = async {
            states.push(SyncState::Loading);
            self.destination
                .load_avro(&staging_table, &file, WriteDisposition::Truncate)
                .await?;
            self.destination
                .wait_for_table_ready(&staging_table, Duration::from_secs(30))
                .await?;
            ctx.check_cancelled()?;

            states.push(SyncState::Merging);
            let _heartbeat = {
                let flow = config.flow_job_name.clone();
                let raw_table = config.raw_table.clone();
                HeartbeatRoutine::spawn(ctx, HEARTBEAT_INTERVAL, move || {
                    format!(
                        "flow {}: merging batch {} into raw table {}",
                        flow, batch_id, raw_table
                    )
                })
            };
            ctx.heartbeat(format!(
                "flow {}: applying batch {} to raw table {}",
                config.flow_job_name, batch_id, config.raw_table
            ));

            let insert = format!(
                "INSERT INTO {} SELECT * FROM {};",
                profile.quote(&config.raw_table),
                profile.quote(&staging_table),
            );
            let advance =
                self.metadata
                    .cdc_state_upsert(&config.flow_job_name, batch_id, &checkpoint);

            match self.destination.execute_transaction(&[insert, advance]).await {
                Ok(()) => Ok(()),
                Err(error) if error.is_unique_violation() => {
                    warn!(
                        flow = %config.flow_job_name,
                        batch_id,
                        "batch already applied, treating as committed"
                    );
                    Ok(())
                }
                Err(error) => Err(error),
            }
        }
        .await;

        if merge_result.is_ok() {
            states.push(SyncState::Committed);
        } else {
            states.push(SyncState::Failed);
        }
        states.push(SyncState::Cleanup);

        if let Err(err) = self.destination.drop_table(&staging_table).await {
            warn!(staging_table, error = %err, "failed to drop staging table");
        }
        if !profile.stage_is_destination {
            file.cleanup().await;
        }

        merge_result?;
        info!(
            flow = %config.flow_job_name,
            batch_id,
            num_records = file.num_records,
            checkpoint = %checkpoint.to_text(),
            "batch committed"
        );
        Ok(SyncResult {
            batch: SyncBatch {
                batch_id,
                flow_job_name: config.flow_job_name.clone(),
                source_checkpoint: checkpoint,
                record_count: file.num_records,
                started_at,
                finished_at: chrono::Utc::now(),
            },
            counts,
            states: states.clone(),
        })
    }

    /// Run consecutive batch syncs, acknowledging each committed
    /// checkpoint to the source driver, until the stream drains or
    /// `total_sync_flows` batches have committed.
    pub async fn run_sync_flows(
        &self,
        ctx: &ActivityContext,
        config: &CdcSyncConfig,
        receiver: &mut CdcReceiver,
        total_sync_flows: usize,
        acked_lsn: Option<&tokio::sync::watch::Sender<u64>>,
    ) -> Result<Vec<SyncResult>> {
        let mut results = Vec::new();
        for _ in 0..total_sync_flows {
            match self.sync_batch(ctx, config, receiver).await? {
                Some(result) => {
                    // The slot's confirmed flush position may advance only
                    // now that the destination transaction committed.
                    if let (Some(acked), Some(lsn)) = (acked_lsn, result.checkpoint().lsn()) {
                        let _ = acked.send(lsn);
                    }
                    results.push(result);
                }
                None => break,
            }
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use peerflow_model::{CdcOp, RecordItems};
    use std::sync::Arc;

    fn relation_schema() -> Arc<QRecordSchema> {
        Arc::new(
            QRecordSchema::new(vec![
                QField::new("id", QValueKind::Int64, false),
                QField::new("key", QValueKind::String, false),
            ])
            .unwrap(),
        )
    }

    fn insert_record(id: i64, lsn: u64) -> CdcRecord {
        CdcRecord {
            op: CdcOp::Insert,
            before: None,
            after: Some(
                RecordItems::new(
                    relation_schema(),
                    vec![QValue::Int64(id), QValue::String(format!("k{}", id))],
                )
                .unwrap(),
            ),
            source_ts: DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap(),
            lsn,
            relation_id: 16384,
            schema_name: "public".into(),
            table_name: "events".into(),
            unchanged_toast_columns: Vec::new(),
        }
    }

    #[test]
    fn test_raw_table_schema_shape() {
        let schema = raw_table_schema();
        assert_eq!(schema.len(), 8);
        assert_eq!(schema.fields()[0].name, "_peerdb_uid");
        assert!(schema.field("_peerdb_batch_id").is_some());
        assert!(schema.field("_peerdb_match_data").unwrap().nullable);
    }

    #[test]
    fn test_raw_record_insert() {
        let row = raw_record(&insert_record(7, 100), "analytics.events", 3).unwrap();
        raw_table_schema().validate_record(&row).unwrap();

        assert_eq!(row[2], QValue::String("analytics.events".into()));
        assert_eq!(row[4], QValue::Int64(0));
        assert_eq!(row[5], QValue::Null(QValueKind::Json));
        assert_eq!(row[6], QValue::Int64(3));
        match &row[3] {
            QValue::Json(payload) => {
                let parsed: serde_json::Value = serde_json::from_str(payload).unwrap();
                assert_eq!(parsed, serde_json::json!({"id": 7, "key": "k7"}));
            }
            other => panic!("expected json payload, got {:?}", other),
        }
    }

    #[test]
    fn test_raw_record_delete_uses_before_image() {
        let mut record = insert_record(7, 100);
        record.op = CdcOp::Delete;
        record.before = record.after.take();

        let row = raw_record(&record, "analytics.events", 1).unwrap();
        assert_eq!(row[4], QValue::Int64(2));
        assert!(matches!(&row[5], QValue::Json(_)));
    }

    #[test]
    fn test_raw_record_missing_image_is_error() {
        let mut record = insert_record(7, 100);
        record.after = None;
        let err = raw_record(&record, "t", 1).unwrap_err();
        assert!(err.to_string().contains("no row image"));
    }

    #[test]
    fn test_raw_record_unchanged_toast_joined() {
        let mut record = insert_record(7, 100);
        record.unchanged_toast_columns = vec!["a".into(), "b".into()];
        let row = raw_record(&record, "t", 1).unwrap();
        assert_eq!(row[7], QValue::String("a,b".into()));
    }
}
