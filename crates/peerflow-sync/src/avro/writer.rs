//! Avro OCF staging writer.
//!
//! Drains a record stream into an uncompressed Object Container File,
//! either in a process-local temp directory or directly in cloud object
//! storage, and hands back an [`AvroFile`] whose cleanup handle removes the
//! artifact on every exit path. Destination load pipelines apply their own
//! compression, so the OCF itself stays uncompressed.

use crate::avro::converter::to_avro;
use crate::avro::schema::QRecordAvroSchema;
use crate::context::{ActivityContext, HeartbeatRoutine, HEARTBEAT_INTERVAL};
use crate::dest::DestinationProfile;
use crate::error::{Result, SyncError};
use apache_avro::types::Value as AvroValue;
use apache_avro::Codec;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload};
use peerflow_model::{Checkpoint, QRecord, QRecordReceiver, QRecordSchema, StreamItem};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Where a staged Avro file lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AvroStorageLocation {
    Local,
    Gcs,
    S3,
}

/// Remote object store flavor for a staging target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteKind {
    Gcs,
    S3,
}

/// Staging target chosen per destination: a bucket when one is configured,
/// the local temp directory otherwise.
#[derive(Clone)]
pub enum StorageTarget {
    Local {
        dir: PathBuf,
    },
    Remote {
        store: Arc<dyn ObjectStore>,
        kind: RemoteKind,
        bucket: String,
        /// Key prefix inside the bucket, typically the flow job name
        folder: String,
    },
}

impl StorageTarget {
    /// The per-flow local temp directory, `<tmp>/peerdb-avro-<flow>`.
    pub fn local_for_flow(flow_job_name: &str) -> Self {
        Self::Local {
            dir: std::env::temp_dir().join(format!("peerdb-avro-{}", flow_job_name)),
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::Local { dir } => dir.display().to_string(),
            Self::Remote { bucket, folder, .. } => format!("{}/{}", bucket, folder),
        }
    }
}

impl std::fmt::Debug for StorageTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local { dir } => f.debug_struct("Local").field("dir", dir).finish(),
            Self::Remote { kind, bucket, folder, .. } => f
                .debug_struct("Remote")
                .field("kind", kind)
                .field("bucket", bucket)
                .field("folder", folder)
                .finish(),
        }
    }
}

/// A staged Avro artifact and its cleanup handle.
pub struct AvroFile {
    /// Rows written into the container
    pub num_records: usize,
    /// Serialized size
    pub size_bytes: usize,
    pub location: AvroStorageLocation,
    /// Filesystem path or object key
    pub path: String,
    /// Bucket for remote locations
    pub bucket: Option<String>,
    store: Option<Arc<dyn ObjectStore>>,
    created: bool,
}

impl AvroFile {
    /// Handle for an already-written local artifact.
    pub fn local(num_records: usize, size_bytes: usize, path: impl Into<String>) -> Self {
        Self {
            num_records,
            size_bytes,
            location: AvroStorageLocation::Local,
            path: path.into(),
            bucket: None,
            store: None,
            created: true,
        }
    }

    /// URI a destination loader can reference.
    pub fn uri(&self) -> String {
        match (self.location, &self.bucket) {
            (AvroStorageLocation::Gcs, Some(bucket)) => format!("gs://{}/{}", bucket, self.path),
            (AvroStorageLocation::S3, Some(bucket)) => format!("s3://{}/{}", bucket, self.path),
            _ => self.path.clone(),
        }
    }

    /// Remove the artifact. Failures are logged, never fatal: a leaked
    /// staging file costs storage, not correctness.
    pub async fn cleanup(&self) {
        if !self.created {
            return;
        }
        let outcome = match &self.store {
            Some(store) => store
                .delete(&ObjectPath::from(self.path.as_str()))
                .await
                .map_err(|e| e.to_string()),
            None => tokio::fs::remove_file(&self.path)
                .await
                .map_err(|e| e.to_string()),
        };
        match outcome {
            Ok(()) => debug!(path = %self.path, "removed staged avro file"),
            Err(error) => warn!(path = %self.path, error, "failed to remove staged avro file"),
        }
    }
}

impl std::fmt::Debug for AvroFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AvroFile")
            .field("num_records", &self.num_records)
            .field("size_bytes", &self.size_bytes)
            .field("location", &self.location)
            .field("path", &self.path)
            .field("bucket", &self.bucket)
            .finish()
    }
}

/// Drains a record stream into an Avro OCF.
pub struct OcfWriter {
    avro_schema: QRecordAvroSchema,
    profile: DestinationProfile,
}

impl OcfWriter {
    pub fn new(avro_schema: QRecordAvroSchema, profile: DestinationProfile) -> Self {
        Self {
            avro_schema,
            profile,
        }
    }

    /// Consume the stream and stage it at `<folder>/<file_id>.avro`.
    ///
    /// Emits a heartbeat every minute of wall time while draining. Returns
    /// the staged file and the stream's terminal checkpoint. An empty
    /// stream yields `num_records == 0` and no artifact; callers skip the
    /// destination load and merge.
    pub async fn write(
        &self,
        ctx: &ActivityContext,
        receiver: &mut QRecordReceiver,
        target: &StorageTarget,
        file_id: &str,
        staging_table: &str,
    ) -> Result<(AvroFile, Checkpoint)> {
        let stream_schema = receiver.schema().await?;
        self.check_stream_schema(&stream_schema)?;

        let _heartbeat = {
            let folder = target.describe();
            let staging_table = staging_table.to_string();
            HeartbeatRoutine::spawn(ctx, HEARTBEAT_INTERVAL, move || {
                format!(
                    "writing to avro stage for folder {} and staging table {}",
                    folder, staging_table
                )
            })
        };

        let mut writer =
            apache_avro::Writer::with_codec(&self.avro_schema.schema, Vec::new(), Codec::Null);
        let mut num_records = 0usize;

        let checkpoint = loop {
            let item = tokio::select! {
                _ = ctx.cancel.cancelled() => {
                    return Err(SyncError::cancelled(format!(
                        "avro staging cancelled for flow {}",
                        ctx.flow_job_name
                    )));
                }
                item = receiver.next() => item,
            };
            match item {
                StreamItem::Record(record) => {
                    writer.append_value_ref(&self.convert_record(&stream_schema, record)?)?;
                    num_records += 1;
                }
                StreamItem::End(checkpoint) => break checkpoint,
                StreamItem::Err(error) => return Err(error.into()),
            }
        };

        if num_records == 0 {
            debug!(flow = %ctx.flow_job_name, file_id, "empty stream, no avro artifact staged");
            return Ok((
                AvroFile {
                    num_records: 0,
                    size_bytes: 0,
                    location: match target {
                        StorageTarget::Local { .. } => AvroStorageLocation::Local,
                        StorageTarget::Remote { kind: RemoteKind::Gcs, .. } => {
                            AvroStorageLocation::Gcs
                        }
                        StorageTarget::Remote { kind: RemoteKind::S3, .. } => {
                            AvroStorageLocation::S3
                        }
                    },
                    path: String::new(),
                    bucket: None,
                    store: None,
                    created: false,
                },
                checkpoint,
            ));
        }

        let bytes = writer.into_inner()?;
        let size_bytes = bytes.len();

        let file = match target {
            StorageTarget::Local { dir } => {
                tokio::fs::create_dir_all(dir).await?;
                let path = dir.join(format!("{}.avro", file_id));
                tokio::fs::write(&path, &bytes).await?;
                AvroFile {
                    num_records,
                    size_bytes,
                    location: AvroStorageLocation::Local,
                    path: path.display().to_string(),
                    bucket: None,
                    store: None,
                    created: true,
                }
            }
            StorageTarget::Remote {
                store,
                kind,
                bucket,
                folder,
            } => {
                let key = format!("{}/{}.avro", folder, file_id);
                store
                    .put(&ObjectPath::from(key.as_str()), PutPayload::from(bytes))
                    .await?;
                AvroFile {
                    num_records,
                    size_bytes,
                    location: match kind {
                        RemoteKind::Gcs => AvroStorageLocation::Gcs,
                        RemoteKind::S3 => AvroStorageLocation::S3,
                    },
                    path: key,
                    bucket: Some(bucket.clone()),
                    store: Some(Arc::clone(store)),
                    created: true,
                }
            }
        };

        info!(
            flow = %ctx.flow_job_name,
            num_records,
            size_bytes,
            path = %file.path,
            "staged avro file"
        );
        Ok((file, checkpoint))
    }

    /// The stream's schema must line up with the schema the OCF was defined
    /// from; the Avro schema came from the destination's declared columns.
    fn check_stream_schema(&self, stream_schema: &QRecordSchema) -> Result<()> {
        let expected = self.avro_schema.record.column_names();
        let actual = stream_schema.column_names();
        if expected != actual {
            return Err(SyncError::schema(format!(
                "stream columns {:?} do not match staged schema columns {:?}",
                actual, expected
            )));
        }
        Ok(())
    }

    fn convert_record(&self, schema: &QRecordSchema, record: QRecord) -> Result<AvroValue> {
        let mut fields = Vec::with_capacity(record.len());
        for (field, value) in schema.fields().iter().zip(record) {
            if !value.is_null() && value.kind() != field.kind {
                return Err(SyncError::schema(format!(
                    "column {} declares {} but row carries {}",
                    field.name,
                    field.kind,
                    value.kind()
                )));
            }
            let nullable = self.avro_schema.nullable_fields.contains(&field.name);
            fields.push((
                field.name.clone(),
                to_avro(&field.name, &value, &self.profile, nullable)?,
            ));
        }
        Ok(AvroValue::Record(fields))
    }
}
