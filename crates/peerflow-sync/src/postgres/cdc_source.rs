//! PostgreSQL CDC source.
//!
//! Consumes the pgoutput logical replication stream into a CDC record
//! stream. Row events buffer within their transaction and flush on Commit,
//! so consumers only ever see committed changes. The replication slot's
//! confirmed flush position advances exclusively from the acknowledged-LSN
//! channel, which the sync activity bumps after the destination
//! transaction commits.

use crate::error::{Result, SyncError};
use crate::postgres::protocol::{self, ColumnData, PgOutputMessage, RelationDesc, TupleData};
use crate::postgres::replication::{
    pg_micros_to_utc, ReplicationClient, ReplicationConnectOptions,
};
use crate::postgres::type_mapper::{decode_text, kind_for_oid};
use bytes::Buf;
use peerflow_model::{CdcOp, CdcRecord, CdcSender, QRecordSchema, QValue, RecordItems};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long to wait for WAL before proactively reporting status. Keeps the
/// slot from accumulating WAL on idle sources.
const STATUS_UPDATE_INTERVAL: Duration = Duration::from_secs(10);

/// Replication slot name for a flow. The slot is exclusively owned by the
/// flow's CDC activity.
pub fn slot_name_for_flow(flow_job_name: &str) -> String {
    let suffix: String = flow_job_name
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_lowercase() || c.is_ascii_digit() {
                c
            } else {
                '_'
            }
        })
        .collect();
    let mut name = format!("peerflow_slot_{}", suffix);
    name.truncate(63);
    name
}

/// CDC source configuration.
#[derive(Debug, Clone)]
pub struct PostgresCdcConfig {
    pub connect: ReplicationConnectOptions,
    pub slot_name: String,
    pub publication: String,
    /// Resume point; 0 starts from the slot's confirmed position
    pub start_lsn: u64,
    /// OID to type-name map for extension types
    pub custom_types: HashMap<u32, String>,
}

/// A relation definition with resolved value kinds.
#[derive(Debug)]
struct CachedRelation {
    namespace: String,
    name: String,
    schema: Arc<QRecordSchema>,
}

impl CachedRelation {
    fn from_desc(desc: &RelationDesc, custom_types: &HashMap<u32, String>) -> Result<Self> {
        let mut fields = Vec::with_capacity(desc.columns.len());
        for column in &desc.columns {
            let kind = kind_for_oid(column.type_oid, custom_types)?;
            fields.push(peerflow_model::QField::new(&column.name, kind, true));
        }
        Ok(Self {
            namespace: desc.namespace.clone(),
            name: desc.name.clone(),
            schema: Arc::new(QRecordSchema::new(fields)?),
        })
    }

    /// Decode a tuple into a row image, collecting unchanged-TOAST column
    /// names.
    fn decode_tuple(&self, tuple: &TupleData) -> Result<(RecordItems, Vec<String>)> {
        if tuple.0.len() != self.schema.len() {
            return Err(SyncError::schema(format!(
                "relation {}.{} declares {} columns but tuple carries {}",
                self.namespace,
                self.name,
                self.schema.len(),
                tuple.0.len()
            )));
        }
        let mut values = Vec::with_capacity(tuple.0.len());
        let mut unchanged_toast = Vec::new();
        for (field, column) in self.schema.fields().iter().zip(&tuple.0) {
            let value = match column {
                ColumnData::Null => QValue::Null(field.kind),
                ColumnData::UnchangedToast => {
                    unchanged_toast.push(field.name.clone());
                    QValue::Null(field.kind)
                }
                ColumnData::Text(raw) => {
                    let text = std::str::from_utf8(raw).map_err(|e| {
                        SyncError::conversion(format!(
                            "column {} is not valid utf8: {}",
                            field.name, e
                        ))
                    })?;
                    decode_text(field.kind, &field.name, text)?
                }
            };
            values.push(value);
        }
        Ok((RecordItems::new(Arc::clone(&self.schema), values)?, unchanged_toast))
    }
}

/// PostgreSQL CDC source driver.
pub struct PostgresCdcSource {
    config: PostgresCdcConfig,
}

impl PostgresCdcSource {
    pub fn new(config: PostgresCdcConfig) -> Self {
        Self { config }
    }

    /// Run the replication loop, pushing committed row events into
    /// `sender` until the consumer goes away, the stream ends, or the
    /// context is cancelled.
    ///
    /// `acked_lsn` carries the highest checkpoint durably recorded at the
    /// destination; status updates never report a flush position beyond
    /// it.
    pub async fn run(
        self,
        cancel: CancellationToken,
        sender: CdcSender,
        acked_lsn: watch::Receiver<u64>,
    ) -> Result<()> {
        let mut client = ReplicationClient::connect(&self.config.connect).await?;
        client
            .create_replication_slot(&self.config.slot_name)
            .await?;
        let mut stream = client
            .start_replication(
                &self.config.slot_name,
                &self.config.publication,
                self.config.start_lsn,
            )
            .await?;

        let mut relations: HashMap<u32, CachedRelation> = HashMap::new();
        let mut txn_buffer: Vec<CdcRecord> = Vec::new();
        let mut txn_commit_ts = pg_micros_to_utc(0);
        let mut last_received = self.config.start_lsn;
        let mut last_committed = self.config.start_lsn;

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(SyncError::cancelled("cdc source cancelled"));
                }
                next = tokio::time::timeout(STATUS_UPDATE_INTERVAL, stream.next_message()) => next,
            };

            let message = match next {
                Ok(message) => message?,
                Err(_) => {
                    // Idle source; report progress so WAL can be recycled
                    // up to the acknowledged checkpoint.
                    stream
                        .send_status_update(last_received, *acked_lsn.borrow())
                        .await?;
                    continue;
                }
            };

            let mut payload = match message {
                Some(payload) => payload,
                None => {
                    if !txn_buffer.is_empty() {
                        warn!(
                            buffered = txn_buffer.len(),
                            "replication stream ended mid-transaction, dropping uncommitted events"
                        );
                    }
                    info!("replication stream ended");
                    break;
                }
            };
            if !payload.has_remaining() {
                continue;
            }

            match payload.get_u8() {
                b'w' => {
                    let wal_start = payload.get_u64();
                    let _wal_end = payload.get_u64();
                    let _server_ts = payload.get_i64();
                    last_received = last_received.max(wal_start);

                    match protocol::decode(&mut payload)
                        .map_err(|e| SyncError::replication(e.to_string()))?
                    {
                        PgOutputMessage::Begin(begin) => {
                            txn_buffer.clear();
                            txn_commit_ts = pg_micros_to_utc(begin.timestamp);
                        }
                        PgOutputMessage::Relation(desc) => {
                            let cached =
                                CachedRelation::from_desc(&desc, &self.config.custom_types)?;
                            relations.insert(desc.id, cached);
                        }
                        PgOutputMessage::Insert(insert) => {
                            let relation = lookup(&relations, insert.relation_id)?;
                            let (after, unchanged) = relation.decode_tuple(&insert.new_tuple)?;
                            txn_buffer.push(CdcRecord {
                                op: CdcOp::Insert,
                                before: None,
                                after: Some(after),
                                source_ts: txn_commit_ts,
                                lsn: wal_start,
                                relation_id: insert.relation_id,
                                schema_name: relation.namespace.clone(),
                                table_name: relation.name.clone(),
                                unchanged_toast_columns: unchanged,
                            });
                        }
                        PgOutputMessage::Update(update) => {
                            let relation = lookup(&relations, update.relation_id)?;
                            let before = update
                                .old_tuple
                                .as_ref()
                                .map(|t| relation.decode_tuple(t))
                                .transpose()?
                                .map(|(items, _)| items);
                            let (after, unchanged) = relation.decode_tuple(&update.new_tuple)?;
                            txn_buffer.push(CdcRecord {
                                op: CdcOp::Update,
                                before,
                                after: Some(after),
                                source_ts: txn_commit_ts,
                                lsn: wal_start,
                                relation_id: update.relation_id,
                                schema_name: relation.namespace.clone(),
                                table_name: relation.name.clone(),
                                unchanged_toast_columns: unchanged,
                            });
                        }
                        PgOutputMessage::Delete(delete) => {
                            let relation = lookup(&relations, delete.relation_id)?;
                            let before = match &delete.old_tuple {
                                Some(tuple) => Some(relation.decode_tuple(tuple)?.0),
                                None => None,
                            };
                            txn_buffer.push(CdcRecord {
                                op: CdcOp::Delete,
                                before,
                                after: None,
                                source_ts: txn_commit_ts,
                                lsn: wal_start,
                                relation_id: delete.relation_id,
                                schema_name: relation.namespace.clone(),
                                table_name: relation.name.clone(),
                                unchanged_toast_columns: Vec::new(),
                            });
                        }
                        PgOutputMessage::Commit(commit) => {
                            for record in txn_buffer.drain(..) {
                                if sender.push(record).await.is_err() {
                                    info!("cdc consumer dropped, stopping source");
                                    return Ok(());
                                }
                            }
                            last_committed = last_committed.max(commit.commit_lsn);
                        }
                        PgOutputMessage::Origin(_)
                        | PgOutputMessage::Type(_)
                        | PgOutputMessage::Truncate(_) => {
                            debug!("ignoring non-row replication message");
                        }
                    }
                }
                b'k' => {
                    let wal_end = payload.get_u64();
                    let _server_ts = payload.get_i64();
                    let reply_requested = payload.get_u8();
                    last_received = last_received.max(wal_end);
                    if reply_requested == 1 {
                        stream
                            .send_status_update(last_received, *acked_lsn.borrow())
                            .await?;
                    }
                }
                other => {
                    debug!(tag = other, "unknown replication frame");
                }
            }
        }

        sender.close(last_committed).await?;
        Ok(())
    }
}

fn lookup(relations: &HashMap<u32, CachedRelation>, id: u32) -> Result<&CachedRelation> {
    relations.get(&id).ok_or_else(|| {
        SyncError::replication(format!("row event for unknown relation {}", id))
    })
}
