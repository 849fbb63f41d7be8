//! Avro staging: schema derivation, destination-aware value conversion and
//! the Object Container File writer.

pub mod converter;
pub mod schema;
pub mod writer;

pub use converter::to_avro;
pub use schema::{avro_schema_for_kind, define_avro_schema, QRecordAvroSchema};
pub use writer::{AvroFile, AvroStorageLocation, OcfWriter, RemoteKind, StorageTarget};
