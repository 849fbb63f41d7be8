//! Normalize pass.
//!
//! Reads raw-table rows for batch ids not yet normalized and applies typed
//! merges to the user-facing destination tables. Monotonic in batch id: a
//! batch is never re-applied, and the high-water mark advances in the same
//! transaction as the merges.

use crate::context::ActivityContext;
use crate::dest::{Destination, DestinationProfile};
use crate::error::Result;
use crate::metadata::MetadataTables;
use peerflow_model::{QRecordSchema, QValueKind};
use tracing::{debug, info};

/// How one destination table is materialized from the raw table.
#[derive(Debug, Clone)]
pub struct TableMapping {
    pub destination_table: String,
    /// Destination's declared schema (data columns only)
    pub schema: QRecordSchema,
    pub primary_keys: Vec<String>,
    /// Delete events flag the row instead of removing it
    pub soft_delete: bool,
    pub synced_at_column: Option<String>,
    pub soft_delete_column: Option<String>,
}

/// Normalize request for one flow.
#[derive(Debug, Clone)]
pub struct NormalizeRequest {
    pub flow_job_name: String,
    pub raw_table: String,
    pub mappings: Vec<TableMapping>,
}

/// Outcome of one normalize pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizeResult {
    /// First batch id applied (exclusive lower bound is `start - 1`)
    pub start_batch_id: i64,
    /// Last batch id applied
    pub end_batch_id: i64,
    pub tables: Vec<String>,
}

/// Normalize activity against a merge-capable destination.
pub struct Normalize<'a, D: Destination + ?Sized> {
    destination: &'a D,
    metadata: MetadataTables,
}

impl<'a, D: Destination + ?Sized> Normalize<'a, D> {
    pub fn new(destination: &'a D) -> Self {
        Self {
            destination,
            metadata: MetadataTables::new(),
        }
    }

    /// Apply all unnormalized batches. `Ok(None)` when there is nothing to
    /// do.
    pub async fn run(
        &self,
        ctx: &ActivityContext,
        request: &NormalizeRequest,
    ) -> Result<Option<NormalizeResult>> {
        ctx.check_cancelled()?;

        let (last_synced, _) = self
            .destination
            .last_sync_batch(&request.flow_job_name)
            .await?;
        let last_normalized = self
            .destination
            .last_normalized_batch(&request.flow_job_name)
            .await?;
        if last_normalized >= last_synced {
            debug!(
                flow = %request.flow_job_name,
                last_synced,
                last_normalized,
                "nothing to normalize"
            );
            return Ok(None);
        }

        let profile = self.destination.profile().clone();
        let mut statements = Vec::with_capacity(request.mappings.len() + 1);
        let mut tables = Vec::with_capacity(request.mappings.len());
        for mapping in &request.mappings {
            statements.push(build_merge_statement(
                &request.raw_table,
                mapping,
                last_normalized,
                last_synced,
                &profile,
            ));
            tables.push(mapping.destination_table.clone());
        }
        statements.push(
            self.metadata
                .normalize_state_upsert(&request.flow_job_name, last_synced),
        );

        ctx.heartbeat(format!(
            "flow {}: normalizing batches {}..={} into {} tables",
            request.flow_job_name,
            last_normalized + 1,
            last_synced,
            tables.len()
        ));
        self.destination.execute_transaction(&statements).await?;

        info!(
            flow = %request.flow_job_name,
            start = last_normalized + 1,
            end = last_synced,
            tables = tables.len(),
            "normalize pass applied"
        );
        Ok(Some(NormalizeResult {
            start_batch_id: last_normalized + 1,
            end_batch_id: last_synced,
            tables,
        }))
    }
}

/// Typed merge of one table's raw rows in `(last_normalized, last_synced]`.
///
/// Inserts materialize new rows, updates overwrite matched rows, deletes
/// remove them or flag the soft-delete column per the mapping.
fn build_merge_statement(
    raw_table: &str,
    mapping: &TableMapping,
    last_normalized: i64,
    last_synced: i64,
    profile: &DestinationProfile,
) -> String {
    let data_columns: Vec<&str> = mapping
        .schema
        .fields()
        .iter()
        .map(|f| f.name.as_str())
        .collect();

    let source_projection = mapping
        .schema
        .fields()
        .iter()
        .map(|field| {
            format!(
                "{} AS {}",
                json_extract(profile, &field.name, field.kind),
                profile.quote(&field.name)
            )
        })
        .collect::<Vec<_>>()
        .join(", ");

    let join_condition = mapping
        .primary_keys
        .iter()
        .map(|key| format!("t.{q} = s.{q}", q = profile.quote(key)))
        .collect::<Vec<_>>()
        .join(" AND ");

    let mut update_sets: Vec<String> = data_columns
        .iter()
        .filter(|c| !mapping.primary_keys.iter().any(|k| k == *c))
        .map(|c| format!("t.{q} = s.{q}", q = profile.quote(c)))
        .collect();
    if let Some(synced_at) = &mapping.synced_at_column {
        update_sets.push(format!("t.{} = CURRENT_TIMESTAMP", profile.quote(synced_at)));
    }

    let mut insert_columns: Vec<String> =
        data_columns.iter().map(|c| profile.quote(c)).collect();
    let mut insert_values: Vec<String> = data_columns
        .iter()
        .map(|c| format!("s.{}", profile.quote(c)))
        .collect();
    if let (true, Some(deleted)) = (mapping.soft_delete, &mapping.soft_delete_column) {
        insert_columns.push(profile.quote(deleted));
        insert_values.push("FALSE".to_string());
    }
    if let Some(synced_at) = &mapping.synced_at_column {
        insert_columns.push(profile.quote(synced_at));
        insert_values.push("CURRENT_TIMESTAMP".to_string());
    }

    let delete_action = match (mapping.soft_delete, &mapping.soft_delete_column) {
        (true, Some(deleted)) => {
            let mut sets = vec![format!("t.{} = TRUE", profile.quote(deleted))];
            if let Some(synced_at) = &mapping.synced_at_column {
                sets.push(format!("t.{} = CURRENT_TIMESTAMP", profile.quote(synced_at)));
            }
            format!("UPDATE SET {}", sets.join(", "))
        }
        _ => "DELETE".to_string(),
    };

    format!(
        "MERGE INTO {dst} t USING (\
         SELECT {projection}, _peerdb_record_type FROM {raw} \
         WHERE _peerdb_destination_table_name = '{dst_name}' \
         AND _peerdb_batch_id > {lo} AND _peerdb_batch_id <= {hi}\
         ) s ON {join} \
         WHEN MATCHED AND s._peerdb_record_type = 2 THEN {delete_action} \
         WHEN MATCHED THEN UPDATE SET {updates} \
         WHEN NOT MATCHED AND s._peerdb_record_type != 2 THEN \
         INSERT ({insert_columns}) VALUES ({insert_values})",
        dst = profile.quote(&mapping.destination_table),
        projection = source_projection,
        raw = profile.quote(raw_table),
        dst_name = mapping.destination_table.replace('\'', "''"),
        lo = last_normalized,
        hi = last_synced,
        join = join_condition,
        delete_action = delete_action,
        updates = update_sets.join(", "),
        insert_columns = insert_columns.join(", "),
        insert_values = insert_values.join(", "),
    )
}

/// Extraction expression for one column of the raw JSON payload.
fn json_extract(profile: &DestinationProfile, column: &str, kind: QValueKind) -> String {
    if profile.parse_json_on_merge {
        // BigQuery dialect
        match kind {
            QValueKind::Json => format!(
                "PARSE_JSON(JSON_EXTRACT(_peerdb_data, '$.{}'),wide_number_mode=>'round')",
                column
            ),
            _ => format!("JSON_EXTRACT_SCALAR(_peerdb_data, '$.{}')", column),
        }
    } else {
        format!("_peerdb_data->>'{}'", column.replace('\'', "''"))
    }
}
