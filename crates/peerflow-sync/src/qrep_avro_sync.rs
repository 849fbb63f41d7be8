//! QRep partition sync via Avro staging.
//!
//! For one partition: stage the partition's rows as an Avro OCF, load them
//! into a deterministic staging table, then apply them to the destination
//! table and record the partition's metadata in a single transaction.
//! Every step is idempotent under retry: an applied partition is skipped,
//! the staging load truncates, and a metadata key violation is treated as
//! "already applied".

use crate::avro::schema::define_avro_schema;
use crate::avro::writer::{OcfWriter, StorageTarget};
use crate::context::ActivityContext;
use crate::dest::{Destination, DestinationProfile, WriteDisposition};
use crate::error::Result;
use crate::metadata::MetadataTables;
use chrono::Utc;
use peerflow_model::{QRecordReceiver, QRecordSchema, QRepPartition, QValueKind};
use std::time::Duration;
use tracing::{info, warn};

/// How long to wait for a freshly loaded staging table to become
/// queryable on destinations with eventually consistent metadata.
const TABLE_READY_TIMEOUT: Duration = Duration::from_secs(30);

/// One partition's sync request.
#[derive(Debug)]
pub struct QRepSyncRequest {
    pub flow_job_name: String,
    pub destination_table: String,
    /// Destination's declared schema, including reserved columns
    pub destination_schema: QRecordSchema,
    pub partition: QRepPartition,
    pub synced_at_column: Option<String>,
    pub soft_delete_column: Option<String>,
    pub staging: StorageTarget,
}

/// Deterministic staging table name for a partition. Retries reuse it and
/// the truncate load disposition overwrites any residue.
pub fn staging_table_name(destination_table: &str, partition_id: &str) -> String {
    format!(
        "{}_{}_staging",
        destination_table,
        partition_id.replace('-', "_")
    )
}

/// QRep partition sync against an Avro-staging destination.
pub struct QRepAvroSync<'a, D: Destination + ?Sized> {
    destination: &'a D,
    metadata: MetadataTables,
}

impl<'a, D: Destination + ?Sized> QRepAvroSync<'a, D> {
    pub fn new(destination: &'a D) -> Self {
        Self {
            destination,
            metadata: MetadataTables::new(),
        }
    }

    /// Extract, stage and apply one partition. Returns the number of rows
    /// applied (0 when skipped or empty).
    pub async fn sync_partition(
        &self,
        ctx: &ActivityContext,
        request: &QRepSyncRequest,
        mut receiver: QRecordReceiver,
    ) -> Result<usize> {
        ctx.check_cancelled()?;
        let start_time = Utc::now();

        if self
            .destination
            .has_partition(&request.flow_job_name, &request.partition.partition_id)
            .await?
        {
            info!(
                flow = %request.flow_job_name,
                partition = %request.partition.partition_id,
                "partition already applied, skipping"
            );
            return Ok(0);
        }

        let profile = self.destination.profile().clone();
        let reserved: Vec<&str> = request
            .synced_at_column
            .iter()
            .chain(request.soft_delete_column.iter())
            .map(String::as_str)
            .collect();
        let staged_schema = request.destination_schema.without_columns(&reserved);
        let avro_schema =
            define_avro_schema(&request.destination_table, &staged_schema, &profile)?;

        let staging_table =
            staging_table_name(&request.destination_table, &request.partition.partition_id);

        let writer = OcfWriter::new(avro_schema, profile.clone());
        let (file, _checkpoint) = writer
            .write(
                ctx,
                &mut receiver,
                &request.staging,
                &request.partition.partition_id,
                &staging_table,
            )
            .await?;

        if file.num_records == 0 {
            info!(
                flow = %request.flow_job_name,
                partition = %request.partition.partition_id,
                "partition produced no rows, skipping load and merge"
            );
            return Ok(0);
        }
        let num_records = file.num_records;

        let merge_result = async {
            self.destination
                .load_avro(&staging_table, &file, WriteDisposition::Truncate)
                .await?;
            self.destination
                .wait_for_table_ready(&staging_table, TABLE_READY_TIMEOUT)
                .await?;
            ctx.check_cancelled()?;
            ctx.heartbeat(format!(
                "running insert-into-select transaction for destination table {} and partition {}",
                request.destination_table, request.partition.partition_id
            ));

            let insert = build_insert_statement(request, &staged_schema, &profile);
            let metadata_insert = self.metadata.qrep_partition_insert(
                &request.flow_job_name,
                &request.partition,
                start_time,
                Utc::now(),
            )?;

            match self
                .destination
                .execute_transaction(&[insert, metadata_insert])
                .await
            {
                Ok(()) => Ok(()),
                Err(error) if error.is_unique_violation() => {
                    warn!(
                        flow = %request.flow_job_name,
                        partition = %request.partition.partition_id,
                        "metadata row already present, treating partition as applied"
                    );
                    Ok(())
                }
                Err(error) => Err(error),
            }
        }
        .await;

        // Cleanup runs on every exit path; failures are logged, not
        // promoted.
        if let Err(error) = self.destination.drop_table(&staging_table).await {
            warn!(
                staging_table,
                %error,
                "failed to drop staging table"
            );
        }
        if !profile.stage_is_destination {
            file.cleanup().await;
        }

        merge_result?;
        info!(
            flow = %request.flow_job_name,
            partition = %request.partition.partition_id,
            destination = %request.destination_table,
            rows = num_records,
            "partition applied"
        );
        Ok(num_records)
    }
}

/// `INSERT INTO <dst> SELECT <projection> FROM <staging>` with the
/// profile's column transforms. Reserved columns append last, soft-delete
/// flag first, then the synced-at timestamp.
fn build_insert_statement(
    request: &QRepSyncRequest,
    staged_schema: &QRecordSchema,
    profile: &DestinationProfile,
) -> String {
    let mut selector: Vec<String> = staged_schema
        .fields()
        .iter()
        .map(|field| {
            let quoted = profile.quote(&field.name);
            match field.kind {
                QValueKind::Geography if profile.geography_from_text => {
                    format!("ST_GEOGFROMTEXT({q}) AS {q}", q = quoted)
                }
                QValueKind::Json if profile.parse_json_on_merge => {
                    format!("PARSE_JSON({q},wide_number_mode=>'round') AS {q}", q = quoted)
                }
                QValueKind::Date if profile.cast_date_on_merge => {
                    format!("CAST({q} AS DATE) AS {q}", q = quoted)
                }
                _ => quoted,
            }
        })
        .collect();

    if request.soft_delete_column.is_some() {
        selector.push("FALSE".to_string());
    }
    if request.synced_at_column.is_some() {
        selector.push("CURRENT_TIMESTAMP".to_string());
    }

    let staging_table =
        staging_table_name(&request.destination_table, &request.partition.partition_id);
    format!(
        "INSERT INTO {} SELECT {} FROM {};",
        profile.quote(&request.destination_table),
        selector.join(", "),
        profile.quote(&staging_table),
    )
}
