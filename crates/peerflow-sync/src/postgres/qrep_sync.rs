//! QRep sync into a PostgreSQL destination.
//!
//! PostgreSQL destinations skip the Avro stage: rows COPY straight from the
//! record stream into the destination table (append) or into a transient
//! unlogged staging table followed by an `ON CONFLICT` upsert. The
//! partition metadata insert rides the same transaction, so a partition's
//! metadata row exists exactly when its rows are applied.

use crate::context::ActivityContext;
use crate::dest::WriteMode;
use crate::error::{Result, SyncError};
use crate::metadata::QREP_METADATA_TABLE;
use chrono::Utc;
use peerflow_model::{
    QRecordReceiver, QRecordSchema, QRepPartition, QValue, QValueKind, StreamItem,
};
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio_postgres::binary_copy::BinaryCopyInWriter;
use tokio_postgres::types::{ToSql, Type};
use tracing::{info, warn};

/// A destination table name, schema qualified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaTable {
    pub schema: String,
    pub table: String,
}

impl SchemaTable {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
        }
    }

    /// Quoted `"schema"."table"` form for SQL.
    pub fn quoted(&self) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(&self.table))
    }
}

impl std::fmt::Display for SchemaTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)
    }
}

/// One partition's sync request against a PostgreSQL destination.
#[derive(Debug)]
pub struct PostgresSyncRequest {
    pub flow_job_name: String,
    pub destination: SchemaTable,
    pub partition: QRepPartition,
    pub write_mode: WriteMode,
    /// Destination's declared column names, used to decide whether the
    /// synced-at column participates
    pub declared_columns: Vec<String>,
    pub synced_at_column: Option<String>,
}

/// QRep staging sync against a PostgreSQL destination.
pub struct PostgresQRepSync {
    client: tokio_postgres::Client,
    metadata_schema: String,
}

impl PostgresQRepSync {
    pub fn new(client: tokio_postgres::Client, metadata_schema: impl Into<String>) -> Self {
        Self {
            client,
            metadata_schema: metadata_schema.into(),
        }
    }

    /// Create the metadata schema and partition table.
    pub async fn setup_metadata(&self) -> Result<()> {
        self.client
            .execute(
                format!(
                    "CREATE SCHEMA IF NOT EXISTS {}",
                    quote_ident(&self.metadata_schema)
                )
                .as_str(),
                &[],
            )
            .await?;
        self.client
            .execute(
                format!(
                    "CREATE TABLE IF NOT EXISTS {}.{} (\
                     flow_job_name TEXT NOT NULL, \
                     partition_id TEXT NOT NULL, \
                     partition_json TEXT NOT NULL, \
                     start_time TIMESTAMPTZ NOT NULL, \
                     end_time TIMESTAMPTZ NOT NULL, \
                     PRIMARY KEY (flow_job_name, partition_id))",
                    quote_ident(&self.metadata_schema),
                    QREP_METADATA_TABLE,
                )
                .as_str(),
                &[],
            )
            .await?;
        Ok(())
    }

    /// Whether a partition's metadata row exists.
    pub async fn has_partition(&self, flow_job_name: &str, partition_id: &str) -> Result<bool> {
        let row = self
            .client
            .query_opt(
                format!(
                    "SELECT 1 FROM {}.{} WHERE flow_job_name = $1 AND partition_id = $2",
                    quote_ident(&self.metadata_schema),
                    QREP_METADATA_TABLE,
                )
                .as_str(),
                &[&flow_job_name, &partition_id],
            )
            .await?;
        Ok(row.is_some())
    }

    /// Apply one partition: COPY, optional upsert, metadata insert, all in
    /// one transaction. Returns the number of rows copied from the stream.
    pub async fn sync_partition(
        &mut self,
        ctx: &ActivityContext,
        request: &PostgresSyncRequest,
        mut receiver: QRecordReceiver,
    ) -> Result<u64> {
        ctx.check_cancelled()?;
        if self
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

        let start_time = Utc::now();
        let schema = receiver.schema().await?;
        // The synced-at column participates only when the destination
        // declares it.
        let synced_at = request
            .synced_at_column
            .as_deref()
            .filter(|col| request.declared_columns.iter().any(|c| c == col));

        let transaction = self.client.transaction().await?;

        let copied = match &request.write_mode {
            WriteMode::Append => {
                let copied = copy_stream(
                    &transaction,
                    &request.destination.quoted(),
                    &schema,
                    &mut receiver,
                )
                .await?;
                if let Some(synced_at) = synced_at {
                    let backfill = format!(
                        "UPDATE {} SET {col} = CURRENT_TIMESTAMP WHERE {col} IS NULL",
                        request.destination.quoted(),
                        col = quote_ident(synced_at),
                    );
                    transaction.execute(backfill.as_str(), &[]).await?;
                }
                copied
            }
            WriteMode::Upsert { key_columns } => {
                let staging = SchemaTable::new(
                    &self.metadata_schema,
                    format!("_peerdb_staging_{}", random_suffix()),
                );
                transaction
                    .execute(
                        format!(
                            "CREATE UNLOGGED TABLE {} (LIKE {})",
                            staging.quoted(),
                            request.destination.quoted(),
                        )
                        .as_str(),
                        &[],
                    )
                    .await?;

                let copied =
                    copy_stream(&transaction, &staging.quoted(), &schema, &mut receiver).await?;

                let upsert = build_upsert_statement(
                    &request.destination,
                    &staging,
                    &schema,
                    key_columns,
                    synced_at,
                )?;
                transaction.execute(upsert.as_str(), &[]).await?;
                transaction
                    .execute(format!("DROP TABLE {}", staging.quoted()).as_str(), &[])
                    .await?;
                copied
            }
        };

        let partition_json =
            serde_json::to_string(&request.partition).map_err(SyncError::Serialization)?;
        let metadata_insert = format!(
            "INSERT INTO {}.{} (flow_job_name, partition_id, partition_json, start_time, end_time) \
             VALUES ($1, $2, $3, $4, $5)",
            quote_ident(&self.metadata_schema),
            QREP_METADATA_TABLE,
        );
        let insert_result = transaction
            .execute(
                metadata_insert.as_str(),
                &[
                    &request.flow_job_name,
                    &request.partition.partition_id,
                    &partition_json,
                    &start_time,
                    &Utc::now(),
                ],
            )
            .await;

        match insert_result {
            Ok(_) => {
                transaction.commit().await?;
                info!(
                    flow = %request.flow_job_name,
                    partition = %request.partition.partition_id,
                    destination = %request.destination,
                    rows = copied,
                    "partition applied"
                );
                Ok(copied)
            }
            Err(error) => {
                let error: SyncError = error.into();
                if error.is_unique_violation() {
                    // Another attempt won the race; its transaction carried
                    // the same rows.
                    warn!(
                        flow = %request.flow_job_name,
                        partition = %request.partition.partition_id,
                        "metadata row already present, treating partition as applied"
                    );
                    Ok(0)
                } else {
                    Err(error)
                }
            }
        }
    }
}

/// Drain the record stream into `table` with binary COPY. Preserves source
/// order.
async fn copy_stream(
    transaction: &tokio_postgres::Transaction<'_>,
    table: &str,
    schema: &QRecordSchema,
    receiver: &mut QRecordReceiver,
) -> Result<u64> {
    let columns = schema
        .fields()
        .iter()
        .map(|f| quote_ident(&f.name))
        .collect::<Vec<_>>()
        .join(", ");
    let copy = format!("COPY {} ({}) FROM STDIN BINARY", table, columns);

    let types: Vec<Type> = schema
        .fields()
        .iter()
        .map(|f| pg_type_for_kind(f.kind))
        .collect();
    let sink = transaction.copy_in(copy.as_str()).await?;
    let writer = BinaryCopyInWriter::new(sink, &types);
    futures::pin_mut!(writer);

    loop {
        match receiver.next().await {
            StreamItem::Record(record) => {
                let mut row: Vec<Box<dyn ToSql + Send + Sync>> =
                    Vec::with_capacity(record.len());
                for (field, value) in schema.fields().iter().zip(&record) {
                    row.push(qvalue_to_sql(field.kind, value, &field.name)?);
                }
                let refs: Vec<&(dyn ToSql + Sync)> =
                    row.iter().map(|v| v.as_ref() as &(dyn ToSql + Sync)).collect();
                writer.as_mut().write(&refs).await?;
            }
            StreamItem::End(_) => break,
            StreamItem::Err(error) => return Err(error.into()),
        }
    }
    Ok(writer.finish().await?)
}

/// `INSERT .. SELECT .. ON CONFLICT (<keys>) DO UPDATE SET` for the upsert
/// write mode. Non-key columns take `EXCLUDED` values; the synced-at
/// column, when declared, refreshes to the statement timestamp.
fn build_upsert_statement(
    destination: &SchemaTable,
    staging: &SchemaTable,
    schema: &QRecordSchema,
    key_columns: &[String],
    synced_at: Option<&str>,
) -> Result<String> {
    if key_columns.is_empty() {
        return Err(SyncError::config("upsert write mode requires key columns"));
    }
    for key in key_columns {
        if schema.field(key).is_none() {
            return Err(SyncError::config(format!(
                "upsert key column {} is not in the stream schema",
                key
            )));
        }
    }

    let select_list = schema
        .fields()
        .iter()
        .map(|f| quote_ident(&f.name))
        .collect::<Vec<_>>()
        .join(", ");

    let mut set_clauses: Vec<String> = schema
        .fields()
        .iter()
        .filter(|f| !key_columns.contains(&f.name))
        .map(|f| format!("{col} = EXCLUDED.{col}", col = quote_ident(&f.name)))
        .collect();

    let (insert_list, select_expr) = match synced_at {
        Some(synced_at) => {
            set_clauses.push(format!(
                "{} = CURRENT_TIMESTAMP",
                quote_ident(synced_at)
            ));
            (
                format!("{}, {}", select_list, quote_ident(synced_at)),
                format!("{}, CURRENT_TIMESTAMP", select_list),
            )
        }
        None => (select_list.clone(), select_list.clone()),
    };

    Ok(format!(
        "INSERT INTO {dst} ({insert_list}) SELECT {select_expr} FROM {staging} \
         ON CONFLICT ({keys}) DO UPDATE SET {set}",
        dst = destination.quoted(),
        insert_list = insert_list,
        select_expr = select_expr,
        staging = staging.quoted(),
        keys = key_columns
            .iter()
            .map(|k| quote_ident(k))
            .collect::<Vec<_>>()
            .join(", "),
        set = set_clauses.join(", "),
    ))
}

/// Wire type for COPY BINARY per value kind.
fn pg_type_for_kind(kind: QValueKind) -> Type {
    match kind {
        QValueKind::Boolean => Type::BOOL,
        QValueKind::Int16 => Type::INT2,
        QValueKind::Int32 => Type::INT4,
        QValueKind::Int64 => Type::INT8,
        QValueKind::Float32 => Type::FLOAT4,
        QValueKind::Float64 => Type::FLOAT8,
        QValueKind::Numeric => Type::NUMERIC,
        QValueKind::Json => Type::JSONB,
        QValueKind::Bytes | QValueKind::Bit => Type::BYTEA,
        QValueKind::Date => Type::DATE,
        QValueKind::Time => Type::TIME,
        QValueKind::Timestamp => Type::TIMESTAMP,
        QValueKind::TimestampTz => Type::TIMESTAMPTZ,
        QValueKind::Uuid => Type::UUID,
        QValueKind::ArrayInt32 => Type::INT4_ARRAY,
        QValueKind::ArrayInt64 => Type::INT8_ARRAY,
        QValueKind::ArrayFloat32 => Type::FLOAT4_ARRAY,
        QValueKind::ArrayFloat64 => Type::FLOAT8_ARRAY,
        QValueKind::ArrayString => Type::TEXT_ARRAY,
        // Extension and text-shaped kinds travel as text
        QValueKind::Invalid
        | QValueKind::String
        | QValueKind::Geometry
        | QValueKind::Geography
        | QValueKind::Point
        | QValueKind::TimeTz
        | QValueKind::HStore
        | QValueKind::Struct => Type::TEXT,
    }
}

/// Box a value as a COPY parameter matching its declared kind.
fn qvalue_to_sql(
    kind: QValueKind,
    value: &QValue,
    column: &str,
) -> Result<Box<dyn ToSql + Send + Sync>> {
    if value.is_null() {
        return Ok(null_for_kind(kind));
    }
    let boxed: Box<dyn ToSql + Send + Sync> = match value {
        QValue::Null(_) => null_for_kind(kind),
        QValue::Boolean(b) => Box::new(*b),
        QValue::Int16(n) => Box::new(*n),
        QValue::Int32(n) => Box::new(*n),
        QValue::Int64(n) => Box::new(*n),
        QValue::Float32(n) => Box::new(*n),
        QValue::Float64(n) => Box::new(*n),
        QValue::Numeric(d) => Box::new(*d),
        QValue::String(s)
        | QValue::Invalid(s)
        | QValue::Geometry(s)
        | QValue::Geography(s)
        | QValue::Point(s)
        | QValue::HStore(s)
        | QValue::Struct(s) => Box::new(s.clone()),
        QValue::Json(s) => {
            let parsed: serde_json::Value = serde_json::from_str(s).map_err(|e| {
                SyncError::conversion(format!("column {}: invalid json: {}", column, e))
            })?;
            Box::new(parsed)
        }
        QValue::Bytes(b) | QValue::Bit(b) => Box::new(b.clone()),
        QValue::Date(d) => Box::new(*d),
        QValue::Time(t) => Box::new(*t),
        QValue::TimeTz(t) => Box::new(format!("{}+00", t.format("%H:%M:%S%.6f"))),
        QValue::Timestamp(ts) => Box::new(*ts),
        QValue::TimestampTz(ts) => Box::new(*ts),
        QValue::Uuid(u) => Box::new(*u),
        QValue::ArrayInt32(xs) => Box::new(xs.clone()),
        QValue::ArrayInt64(xs) => Box::new(xs.clone()),
        QValue::ArrayFloat32(xs) => Box::new(xs.clone()),
        QValue::ArrayFloat64(xs) => Box::new(xs.clone()),
        QValue::ArrayString(xs) => Box::new(xs.clone()),
    };
    Ok(boxed)
}

fn null_for_kind(kind: QValueKind) -> Box<dyn ToSql + Send + Sync> {
    match kind {
        QValueKind::Boolean => Box::new(Option::<bool>::None),
        QValueKind::Int16 => Box::new(Option::<i16>::None),
        QValueKind::Int32 => Box::new(Option::<i32>::None),
        QValueKind::Int64 => Box::new(Option::<i64>::None),
        QValueKind::Float32 => Box::new(Option::<f32>::None),
        QValueKind::Float64 => Box::new(Option::<f64>::None),
        QValueKind::Numeric => Box::new(Option::<rust_decimal::Decimal>::None),
        QValueKind::Json => Box::new(Option::<serde_json::Value>::None),
        QValueKind::Bytes | QValueKind::Bit => Box::new(Option::<Vec<u8>>::None),
        QValueKind::Date => Box::new(Option::<chrono::NaiveDate>::None),
        QValueKind::Time => Box::new(Option::<chrono::NaiveTime>::None),
        QValueKind::Timestamp => Box::new(Option::<chrono::NaiveDateTime>::None),
        QValueKind::TimestampTz => Box::new(Option::<chrono::DateTime<Utc>>::None),
        QValueKind::Uuid => Box::new(Option::<uuid::Uuid>::None),
        QValueKind::ArrayInt32 => Box::new(Option::<Vec<i32>>::None),
        QValueKind::ArrayInt64 => Box::new(Option::<Vec<i64>>::None),
        QValueKind::ArrayFloat32 => Box::new(Option::<Vec<f32>>::None),
        QValueKind::ArrayFloat64 => Box::new(Option::<Vec<f64>>::None),
        QValueKind::ArrayString => Box::new(Option::<Vec<String>>::None),
        QValueKind::Invalid
        | QValueKind::String
        | QValueKind::Geometry
        | QValueKind::Geography
        | QValueKind::Point
        | QValueKind::TimeTz
        | QValueKind::HStore
        | QValueKind::Struct => Box::new(Option::<String>::None),
    }
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn random_suffix() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(|c| (c as char).to_ascii_lowercase())
        .collect()
}
