//! # peerflow-model
//!
//! Typed value model, record schemas and record streams shared by the
//! peerflow replication pipeline.
//!
//! ## Architecture
//!
//! ```text
//! source driver ──▶ QRecordStream / CdcRecordStream ──▶ staging writer
//!                    (bounded SPSC, schema-stamped,
//!                     terminal Record | End | Err)
//! ```
//!
//! Everything in this crate is pure data plumbing: no network I/O, no
//! destination knowledge. Destination-aware Avro encoding lives in
//! `peerflow-sync`.

pub mod cdc;
pub mod error;
pub mod hstore;
pub mod partition;
pub mod qvalue;
pub mod schema;
pub mod stream;

pub use cdc::{
    cdc_channel, BatchCounts, CdcItem, CdcOp, CdcReceiver, CdcRecord, CdcSender, RecordBuffer,
    RecordItems,
};
pub use error::{ModelError, Result};
pub use hstore::parse_hstore;
pub use partition::{format_lsn, parse_lsn, Checkpoint, PartitionRange, QRepPartition};
pub use qvalue::{QValue, QValueKind};
pub use schema::{QField, QRecord, QRecordSchema};
pub use stream::{channel, QRecordReceiver, QRecordSender, StreamItem, DEFAULT_STREAM_CAPACITY};
