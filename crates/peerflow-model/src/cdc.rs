//! CDC row events and the CDC record stream.
//!
//! A [`CdcRecord`] is one typed row event from the source's logical
//! replication stream. The [`cdc_channel`] pipe mirrors the QRep record
//! stream but carries row events and terminates at the highest LSN
//! consumed. [`RecordBuffer`] accumulates events into a sync batch.

use crate::error::{ModelError, Result};
use crate::partition::Checkpoint;
use crate::qvalue::QValue;
use crate::schema::QRecordSchema;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

/// CDC operation type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CdcOp {
    Insert,
    Update,
    Delete,
}

impl CdcOp {
    /// Numeric tag stored in the raw table's record-type column.
    pub fn record_type(&self) -> i64 {
        match self {
            Self::Insert => 0,
            Self::Update => 1,
            Self::Delete => 2,
        }
    }
}

impl std::fmt::Display for CdcOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Insert => write!(f, "INSERT"),
            Self::Update => write!(f, "UPDATE"),
            Self::Delete => write!(f, "DELETE"),
        }
    }
}

/// A row image: column values paired with their relation's schema.
///
/// The schema is shared behind an `Arc` since every event of a relation
/// carries the same one.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordItems {
    schema: Arc<QRecordSchema>,
    values: Vec<QValue>,
}

impl RecordItems {
    /// Pair values with their schema, validating arity.
    pub fn new(schema: Arc<QRecordSchema>, values: Vec<QValue>) -> Result<Self> {
        if values.len() != schema.len() {
            return Err(ModelError::schema(format!(
                "row has {} values, relation declares {} columns",
                values.len(),
                schema.len()
            )));
        }
        Ok(Self { schema, values })
    }

    /// The relation schema.
    pub fn schema(&self) -> &QRecordSchema {
        &self.schema
    }

    /// The column values, in schema order.
    pub fn values(&self) -> &[QValue] {
        &self.values
    }

    /// Look up a value by column name.
    pub fn get(&self, name: &str) -> Option<&QValue> {
        self.schema
            .fields()
            .iter()
            .position(|f| f.name == name)
            .map(|i| &self.values[i])
    }

    /// JSON object projection of this row image.
    pub fn to_json(&self) -> serde_json::Value {
        let mut map = serde_json::Map::with_capacity(self.values.len());
        for (field, value) in self.schema.fields().iter().zip(&self.values) {
            map.insert(field.name.clone(), value.to_json());
        }
        serde_json::Value::Object(map)
    }
}

/// One change event captured from the source.
#[derive(Debug, Clone, PartialEq)]
pub struct CdcRecord {
    /// Operation type
    pub op: CdcOp,
    /// Previous row image (UPDATE with replica identity, DELETE)
    pub before: Option<RecordItems>,
    /// Current row image (INSERT, UPDATE)
    pub after: Option<RecordItems>,
    /// Commit timestamp at the source
    pub source_ts: DateTime<Utc>,
    /// WAL position of the change
    pub lsn: u64,
    /// Source relation OID
    pub relation_id: u32,
    /// Source schema name
    pub schema_name: String,
    /// Source table name
    pub table_name: String,
    /// Columns whose TOASTed values were unchanged and omitted from the
    /// new image
    pub unchanged_toast_columns: Vec<String>,
}

impl CdcRecord {
    /// `schema.table` of the source relation.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema_name, self.table_name)
    }

    /// The row image that lands in the raw table's data column: the new
    /// image for inserts and updates, the old image for deletes.
    pub fn payload(&self) -> Option<&RecordItems> {
        match self.op {
            CdcOp::Insert | CdcOp::Update => self.after.as_ref(),
            CdcOp::Delete => self.before.as_ref(),
        }
    }

    /// The old row image used to match existing destination rows, where the
    /// source provided one.
    pub fn match_data(&self) -> Option<&RecordItems> {
        match self.op {
            CdcOp::Insert => None,
            CdcOp::Update | CdcOp::Delete => self.before.as_ref(),
        }
    }
}

/// Items observed by the CDC stream consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum CdcItem {
    Record(CdcRecord),
    /// Terminal: highest LSN consumed
    End(Checkpoint),
    Err(ModelError),
}

/// Create a bounded CDC record stream.
pub fn cdc_channel(capacity: usize) -> (CdcSender, CdcReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (CdcSender { tx }, CdcReceiver { rx, done: false })
}

/// Producer half of a CDC record stream.
pub struct CdcSender {
    tx: mpsc::Sender<CdcItem>,
}

impl CdcSender {
    /// Push one event.
    pub async fn push(&self, record: CdcRecord) -> Result<()> {
        self.tx
            .send(CdcItem::Record(record))
            .await
            .map_err(|_| ModelError::Cancelled("cdc stream receiver dropped".into()))
    }

    /// Terminate successfully at the highest LSN consumed.
    pub async fn close(self, lsn: u64) -> Result<()> {
        self.tx
            .send(CdcItem::End(Checkpoint::Lsn(lsn)))
            .await
            .map_err(|_| ModelError::Cancelled("cdc stream receiver dropped".into()))
    }

    /// Terminate with an error, best effort.
    pub async fn fail(self, error: ModelError) {
        let _ = self.tx.send(CdcItem::Err(error)).await;
    }
}

/// Consumer half of a CDC record stream.
pub struct CdcReceiver {
    rx: mpsc::Receiver<CdcItem>,
    done: bool,
}

impl CdcReceiver {
    /// Whether a terminal item has already been observed.
    pub fn is_terminated(&self) -> bool {
        self.done
    }

    /// Next item; terminal items latch the stream closed.
    pub async fn next(&mut self) -> CdcItem {
        if self.done {
            return CdcItem::Err(ModelError::StreamClosed(
                "cdc stream already terminated".into(),
            ));
        }
        match self.rx.recv().await {
            Some(item @ CdcItem::Record(_)) => item,
            Some(item) => {
                self.done = true;
                item
            }
            None => {
                self.done = true;
                CdcItem::Err(ModelError::StreamClosed(
                    "producer dropped without a checkpoint".into(),
                ))
            }
        }
    }

    /// Non-blocking variant used by batch accumulation loops.
    pub fn try_next(&mut self) -> Option<CdcItem> {
        if self.done {
            return None;
        }
        match self.rx.try_recv() {
            Ok(item @ CdcItem::Record(_)) => Some(item),
            Ok(item) => {
                self.done = true;
                Some(item)
            }
            Err(mpsc::error::TryRecvError::Empty) => None,
            Err(mpsc::error::TryRecvError::Disconnected) => {
                self.done = true;
                Some(CdcItem::Err(ModelError::StreamClosed(
                    "producer dropped without a checkpoint".into(),
                )))
            }
        }
    }
}

/// Per-operation counts for one accumulated batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchCounts {
    pub inserts: usize,
    pub updates: usize,
    pub deletes: usize,
}

impl BatchCounts {
    pub fn total(&self) -> usize {
        self.inserts + self.updates + self.deletes
    }
}

/// Accumulates CDC events into one sync batch.
///
/// The buffer itself only tracks size and the high-water LSN; flush timing
/// (size cap, idle timeout, drain request) is the caller's loop.
#[derive(Debug)]
pub struct RecordBuffer {
    max_batch_size: usize,
    records: Vec<CdcRecord>,
    counts: BatchCounts,
    max_lsn: u64,
}

impl RecordBuffer {
    /// Create a buffer that reports full at `max_batch_size` events.
    pub fn new(max_batch_size: usize) -> Self {
        Self {
            max_batch_size: max_batch_size.max(1),
            records: Vec::with_capacity(max_batch_size.max(1)),
            counts: BatchCounts::default(),
            max_lsn: 0,
        }
    }

    /// Add an event. Returns true when the batch is full.
    pub fn push(&mut self, record: CdcRecord) -> bool {
        match record.op {
            CdcOp::Insert => self.counts.inserts += 1,
            CdcOp::Update => self.counts.updates += 1,
            CdcOp::Delete => self.counts.deletes += 1,
        }
        self.max_lsn = self.max_lsn.max(record.lsn);
        self.records.push(record);
        self.records.len() >= self.max_batch_size
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Per-op counts of the current batch.
    pub fn counts(&self) -> BatchCounts {
        self.counts
    }

    /// Highest LSN seen so far.
    pub fn max_lsn(&self) -> u64 {
        self.max_lsn
    }

    /// Take the accumulated batch, resetting the buffer.
    pub fn take(&mut self) -> Vec<CdcRecord> {
        self.counts = BatchCounts::default();
        std::mem::take(&mut self.records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::qvalue::QValueKind;
    use crate::schema::QField;

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
        let items = RecordItems::new(
            relation_schema(),
            vec![QValue::Int64(id), QValue::String(format!("k{}", id))],
        )
        .unwrap();
        CdcRecord {
            op: CdcOp::Insert,
            before: None,
            after: Some(items),
            source_ts: DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap(),
            lsn,
            relation_id: 16384,
            schema_name: "public".into(),
            table_name: "events".into(),
            unchanged_toast_columns: Vec::new(),
        }
    }

    #[test]
    fn test_record_items_arity() {
        let err = RecordItems::new(relation_schema(), vec![QValue::Int64(1)]).unwrap_err();
        assert!(matches!(err, ModelError::Schema(_)));
    }

    #[test]
    fn test_record_items_lookup_and_json() {
        let items = RecordItems::new(
            relation_schema(),
            vec![QValue::Int64(1), QValue::String("a".into())],
        )
        .unwrap();
        assert_eq!(items.get("id"), Some(&QValue::Int64(1)));
        assert_eq!(items.get("missing"), None);
        assert_eq!(items.to_json(), serde_json::json!({"id": 1, "key": "a"}));
    }

    #[test]
    fn test_payload_selection() {
        let record = insert_record(1, 10);
        assert!(record.payload().is_some());
        assert!(record.match_data().is_none());

        let mut delete = insert_record(1, 11);
        delete.op = CdcOp::Delete;
        delete.before = delete.after.take();
        assert!(delete.payload().is_some());
        assert!(delete.match_data().is_some());
    }

    #[test]
    fn test_record_type_codes() {
        assert_eq!(CdcOp::Insert.record_type(), 0);
        assert_eq!(CdcOp::Update.record_type(), 1);
        assert_eq!(CdcOp::Delete.record_type(), 2);
    }

    #[tokio::test]
    async fn test_cdc_stream_end_at_max_lsn() {
        let (tx, mut rx) = cdc_channel(8);
        tx.push(insert_record(1, 5)).await.unwrap();
        tx.push(insert_record(2, 9)).await.unwrap();
        tx.close(9).await.unwrap();

        assert!(matches!(rx.next().await, CdcItem::Record(_)));
        assert!(matches!(rx.next().await, CdcItem::Record(_)));
        assert_eq!(rx.next().await, CdcItem::End(Checkpoint::Lsn(9)));
        assert!(matches!(rx.next().await, CdcItem::Err(_)));
    }

    #[tokio::test]
    async fn test_cdc_try_next() {
        let (tx, mut rx) = cdc_channel(8);
        assert!(rx.try_next().is_none());
        tx.push(insert_record(1, 5)).await.unwrap();
        assert!(matches!(rx.try_next(), Some(CdcItem::Record(_))));
    }

    #[test]
    fn test_record_buffer_flush_at_capacity() {
        let mut buffer = RecordBuffer::new(3);
        assert!(!buffer.push(insert_record(1, 10)));
        assert!(!buffer.push(insert_record(2, 30)));
        assert!(buffer.push(insert_record(3, 20)));

        assert_eq!(buffer.counts().inserts, 3);
        assert_eq!(buffer.max_lsn(), 30);

        let batch = buffer.take();
        assert_eq!(batch.len(), 3);
        assert!(buffer.is_empty());
        assert_eq!(buffer.counts().total(), 0);
        // High-water LSN survives the take; it tracks stream progress.
        assert_eq!(buffer.max_lsn(), 30);
    }
}
