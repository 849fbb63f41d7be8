//! End-to-end QRep partition sync against the in-memory destination.

use chrono::{DateTime, Utc};
use peerflow_model::{
    channel, Checkpoint, PartitionRange, QField, QRecordReceiver, QRecordSchema, QRepPartition,
    QValue, QValueKind,
};
use peerflow_sync::avro::writer::StorageTarget;
use peerflow_sync::dest::memory::MemoryDestination;
use peerflow_sync::qrep_avro_sync::{staging_table_name, QRepAvroSync, QRepSyncRequest};
use peerflow_sync::{ActivityContext, Destination, DwhType, SyncError};

fn destination_schema() -> QRecordSchema {
    QRecordSchema::new(vec![
        QField::new("id", QValueKind::Int64, false),
        QField::new("name", QValueKind::String, true),
        QField::new("ts", QValueKind::TimestampTz, true),
        QField::new("_PEERDB_IS_DELETED", QValueKind::Boolean, true),
        QField::new("_PEERDB_SYNCED_AT", QValueKind::TimestampTz, true),
    ])
    .unwrap()
}

fn staged_schema() -> QRecordSchema {
    destination_schema().without_columns(&["_PEERDB_IS_DELETED", "_PEERDB_SYNCED_AT"])
}

fn partition(id: &str, start: i64, end: i64) -> QRepPartition {
    QRepPartition {
        partition_id: id.into(),
        range: PartitionRange::Int { start, end },
        watermark_column: "id".into(),
    }
}

fn request(dir: &std::path::Path, partition_id: &str) -> QRepSyncRequest {
    QRepSyncRequest {
        flow_job_name: "qrep_flow".into(),
        destination_table: "analytics.events".into(),
        destination_schema: destination_schema(),
        partition: partition(partition_id, 0, 100),
        synced_at_column: Some("_PEERDB_SYNCED_AT".into()),
        soft_delete_column: Some("_PEERDB_IS_DELETED".into()),
        staging: StorageTarget::Local {
            dir: dir.to_path_buf(),
        },
    }
}

async fn feed_rows(count: i64) -> QRecordReceiver {
    let (mut tx, rx) = channel(256);
    tx.set_schema(staged_schema()).unwrap();
    for i in 0..count {
        tx.push(vec![
            QValue::Int64(i),
            QValue::String(format!("row_{}", i)),
            QValue::TimestampTz(DateTime::<Utc>::from_timestamp(1_700_000_000 + i, 0).unwrap()),
        ])
        .await
        .unwrap();
    }
    tx.close(Checkpoint::Partition(PartitionRange::Int { start: 0, end: count }))
        .await
        .unwrap();
    rx
}

#[tokio::test]
async fn test_partition_append_records_metadata_atomically() {
    let dir = tempfile::tempdir().unwrap();
    let dest = MemoryDestination::new(DwhType::BigQuery);
    let ctx = ActivityContext::new("qrep_flow");
    let sync = QRepAvroSync::new(&dest);

    let request = request(dir.path(), "aaaa-bbbb-cccc");
    let applied = sync
        .sync_partition(&ctx, &request, feed_rows(20).await)
        .await
        .unwrap();
    assert_eq!(applied, 20);

    // Partition metadata exists iff the rows were merged.
    assert!(dest.has_partition("qrep_flow", "aaaa-bbbb-cccc").await.unwrap());
    assert_eq!(dest.table_rows("analytics.events"), 20);

    // One truncate load into the deterministic staging table, then
    // dropped.
    let loads = dest.loads();
    assert_eq!(loads.len(), 1);
    assert!(loads[0].truncate);
    let staging = staging_table_name("analytics.events", "aaaa-bbbb-cccc");
    assert_eq!(loads[0].table, staging);
    assert_eq!(dest.dropped_tables(), vec![staging]);

    // The merge transaction carried both the insert and the metadata row.
    let transactions = dest.transactions();
    assert_eq!(transactions.len(), 1);
    assert_eq!(transactions[0].len(), 2);
    assert!(transactions[0][0].contains("INSERT INTO `analytics`.`events`"));
    assert!(transactions[0][0].contains("FALSE, CURRENT_TIMESTAMP FROM"));
    assert!(transactions[0][1].contains("_peerdb_qrep_metadata"));

    // Local staging artifact removed.
    assert!(std::fs::read_dir(dir.path())
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(true));
}

#[tokio::test]
async fn test_applied_partition_is_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let dest = MemoryDestination::new(DwhType::BigQuery);
    let ctx = ActivityContext::new("qrep_flow");
    let sync = QRepAvroSync::new(&dest);

    let request = request(dir.path(), "1111-2222");
    sync.sync_partition(&ctx, &request, feed_rows(10).await)
        .await
        .unwrap();

    // Same partition again: skipped before any staging or load.
    let applied = sync
        .sync_partition(&ctx, &request, feed_rows(10).await)
        .await
        .unwrap();
    assert_eq!(applied, 0);
    assert_eq!(dest.loads().len(), 1);
    assert_eq!(dest.table_rows("analytics.events"), 10);
}

#[tokio::test]
async fn test_crash_between_load_and_merge_retries_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let dest = MemoryDestination::new(DwhType::BigQuery);
    let ctx = ActivityContext::new("qrep_flow");
    let sync = QRepAvroSync::new(&dest);
    let request = request(dir.path(), "3333-4444");

    // First attempt dies after the staging load, before the merge commits.
    dest.fail_next_transaction("backend disconnected");
    let err = sync
        .sync_partition(&ctx, &request, feed_rows(15).await)
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Destination(_)));
    assert!(!dest.has_partition("qrep_flow", "3333-4444").await.unwrap());
    assert_eq!(dest.table_rows("analytics.events"), 0);

    // Retry overwrites the staging table (truncate) and merges exactly
    // once.
    let applied = sync
        .sync_partition(&ctx, &request, feed_rows(15).await)
        .await
        .unwrap();
    assert_eq!(applied, 15);
    assert_eq!(dest.table_rows("analytics.events"), 15);
    assert!(dest.has_partition("qrep_flow", "3333-4444").await.unwrap());

    let loads = dest.loads();
    assert_eq!(loads.len(), 2);
    assert!(loads.iter().all(|l| l.truncate));
    // Staged artifacts cleaned on both attempts.
    assert!(std::fs::read_dir(dir.path())
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(true));
}

#[tokio::test]
async fn test_empty_partition_skips_load_and_merge() {
    let dir = tempfile::tempdir().unwrap();
    let dest = MemoryDestination::new(DwhType::BigQuery);
    let ctx = ActivityContext::new("qrep_flow");
    let sync = QRepAvroSync::new(&dest);

    let applied = sync
        .sync_partition(&ctx, &request(dir.path(), "5555-6666"), feed_rows(0).await)
        .await
        .unwrap();
    assert_eq!(applied, 0);
    assert!(dest.loads().is_empty());
    assert!(dest.transactions().is_empty());
}

#[tokio::test]
async fn test_cancellation_before_merge() {
    let dir = tempfile::tempdir().unwrap();
    let dest = MemoryDestination::new(DwhType::BigQuery);
    let ctx = ActivityContext::new("qrep_flow");
    let sync = QRepAvroSync::new(&dest);

    ctx.cancel.cancel();
    let err = sync
        .sync_partition(&ctx, &request(dir.path(), "7777-8888"), feed_rows(5).await)
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Cancelled(_)));
    assert!(dest.loads().is_empty());
    assert!(!dest.has_partition("qrep_flow", "7777-8888").await.unwrap());
}

#[tokio::test]
async fn test_snowflake_profile_stages_string_timestamps() {
    let dir = tempfile::tempdir().unwrap();
    let dest = MemoryDestination::new(DwhType::Snowflake);
    let ctx = ActivityContext::new("qrep_flow");
    let sync = QRepAvroSync::new(&dest);

    let applied = sync
        .sync_partition(&ctx, &request(dir.path(), "9999-aaaa"), feed_rows(2).await)
        .await
        .unwrap();
    assert_eq!(applied, 2);

    // No BigQuery-specific projection wrapping for Snowflake, and the
    // dotted destination quotes as a schema-qualified reference.
    let transactions = dest.transactions();
    assert!(!transactions[0][0].contains("PARSE_JSON"));
    assert!(transactions[0][0].contains("INSERT INTO \"analytics\".\"events\""));
}
