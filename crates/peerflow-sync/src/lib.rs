//! # peerflow-sync
//!
//! The replication pipeline core: Avro staging, QRep partition sync and
//! CDC batch sync.
//!
//! ## Data flow
//!
//! ```text
//! source driver ──▶ record stream ──▶ avro staging writer ──▶ destination load
//!                                                                  │
//!                                         metadata checkpoint ◀── merge (txn)
//! ```
//!
//! The workflow host drives [`qrep_avro_sync`] and [`cdc_sync`] as
//! activities, passing an [`context::ActivityContext`] for cancellation
//! and heartbeats. Destination SDKs sit behind the
//! [`dest::Destination`] seam; destination quirks are centralized in
//! [`dest::DestinationProfile`].

pub mod avro;
pub mod cdc_sync;
pub mod context;
pub mod dest;
pub mod error;
pub mod metadata;
pub mod normalize;
pub mod peers;
pub mod postgres;
pub mod qrep_avro_sync;

pub use avro::{AvroFile, OcfWriter, StorageTarget};
pub use cdc_sync::{CdcSync, CdcSyncConfig, SyncResult, SyncState};
pub use context::{ActivityContext, Heartbeat, HeartbeatRoutine, HEARTBEAT_INTERVAL};
pub use dest::{
    Destination, DestinationProfile, DwhType, WriteDisposition, WriteMode, IS_DELETED_COLUMN,
    SYNCED_AT_COLUMN,
};
pub use error::{Result, SyncError};
pub use metadata::{MetadataTables, SyncBatch};
pub use normalize::{Normalize, NormalizeRequest, NormalizeResult, TableMapping};
pub use peers::{MemoryPeerRegistry, PeerConfig, PeerRegistry, SensitiveString};
pub use qrep_avro_sync::{staging_table_name, QRepAvroSync, QRepSyncRequest};
