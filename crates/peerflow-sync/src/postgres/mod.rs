//! PostgreSQL source drivers and destination sync.
//!
//! - [`qrep_source`]: watermark partition planning and partition SELECT
//!   streaming over the query protocol
//! - [`cdc_source`]: logical replication via the pgoutput plugin
//! - [`qrep_sync`]: QRep apply path for a PostgreSQL destination
//! - [`protocol`] / [`replication`]: pgoutput decoding and the replication
//!   wire client
//! - [`type_mapper`]: OID to value-kind mapping and row decoding

pub mod cdc_source;
pub mod protocol;
pub mod qrep_source;
pub mod qrep_sync;
pub mod replication;
pub mod type_mapper;

pub use cdc_source::{slot_name_for_flow, PostgresCdcConfig, PostgresCdcSource};
pub use qrep_source::{plan_partitions, PostgresQRepSource};
pub use qrep_sync::{PostgresQRepSync, PostgresSyncRequest, SchemaTable};
pub use replication::{ReplicationClient, ReplicationConnectOptions, ReplicationStream};
pub use type_mapper::{decode_text, kind_for_oid, row_to_qvalues, schema_from_columns};
