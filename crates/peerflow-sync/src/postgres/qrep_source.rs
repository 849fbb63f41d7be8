//! QRep source: partition planning and watermarked SELECT streaming.

use crate::error::{Result, SyncError};
use crate::peers::PostgresConfig;
use crate::postgres::type_mapper::{row_to_qvalues, schema_from_columns};
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use peerflow_model::{
    Checkpoint, ModelError, PartitionRange, QRecordSender, QRepPartition,
};
use std::collections::HashMap;
use tokio_postgres::types::ToSql;
use tracing::{debug, warn};

/// Split a watermark range into `num_partitions` contiguous partitions.
///
/// Ranges are `[start, end)`; the last partition absorbs any remainder.
/// Partitions are independent units of work with no ordering guarantee
/// between them.
pub fn plan_partitions(
    watermark_column: &str,
    range: &PartitionRange,
    num_partitions: usize,
) -> Vec<QRepPartition> {
    let num_partitions = num_partitions.max(1) as i64;
    match range {
        PartitionRange::Int { start, end } => {
            let span = end.saturating_sub(*start);
            if span <= 0 {
                return Vec::new();
            }
            let step = (span + num_partitions - 1) / num_partitions;
            (0..num_partitions)
                .filter_map(|i| {
                    let lo = start + i * step;
                    if lo >= *end {
                        return None;
                    }
                    let hi = (lo + step).min(*end);
                    Some(QRepPartition::new(
                        watermark_column,
                        PartitionRange::Int { start: lo, end: hi },
                    ))
                })
                .collect()
        }
        PartitionRange::Timestamp { start, end } => {
            let start_micros = start.timestamp_micros();
            let end_micros = end.timestamp_micros();
            let span = end_micros.saturating_sub(start_micros);
            if span <= 0 {
                return Vec::new();
            }
            let step = (span + num_partitions - 1) / num_partitions;
            (0..num_partitions)
                .filter_map(|i| {
                    let lo = start_micros + i * step;
                    if lo >= end_micros {
                        return None;
                    }
                    let hi = (lo + step).min(end_micros);
                    Some(QRepPartition::new(
                        watermark_column,
                        PartitionRange::Timestamp {
                            start: DateTime::from_timestamp_micros(lo)?,
                            end: DateTime::from_timestamp_micros(hi)?,
                        },
                    ))
                })
                .collect()
        }
    }
}

/// QRep source backed by a PostgreSQL connection.
pub struct PostgresQRepSource {
    client: tokio_postgres::Client,
    custom_types: HashMap<u32, String>,
}

impl PostgresQRepSource {
    /// Connect and load the extension type map.
    pub async fn connect(config: &PostgresConfig) -> Result<Self> {
        let (client, connection) =
            tokio_postgres::connect(&config.connection_string()?, tokio_postgres::NoTls).await?;
        tokio::spawn(async move {
            if let Err(error) = connection.await {
                warn!(%error, "qrep source connection closed");
            }
        });

        let mut source = Self {
            client,
            custom_types: HashMap::new(),
        };
        source.load_custom_types().await?;
        Ok(source)
    }

    /// Map extension type OIDs (hstore, PostGIS) to their names.
    async fn load_custom_types(&mut self) -> Result<()> {
        let rows = self
            .client
            .query(
                "SELECT t.oid, t.typname FROM pg_type t \
                 LEFT JOIN pg_catalog.pg_namespace n ON n.oid = t.typnamespace \
                 WHERE (t.typrelid = 0 OR (SELECT c.relkind = 'c' FROM pg_catalog.pg_class c \
                        WHERE c.oid = t.typrelid)) \
                 AND NOT EXISTS(SELECT 1 FROM pg_catalog.pg_type el \
                        WHERE el.oid = t.typelem AND el.typarray = t.oid) \
                 AND n.nspname NOT IN ('pg_catalog', 'information_schema')",
                &[],
            )
            .await?;
        for row in rows {
            let oid: tokio_postgres::types::Oid = row.try_get(0)?;
            let name: String = row.try_get(1)?;
            self.custom_types.insert(oid, name);
        }
        debug!(count = self.custom_types.len(), "loaded custom type map");
        Ok(())
    }

    /// The min/max of the watermark column, for partition planning.
    pub async fn watermark_range(
        &self,
        table: &str,
        watermark_column: &str,
    ) -> Result<Option<PartitionRange>> {
        let query = format!(
            "SELECT MIN({col}), MAX({col}) FROM {table}",
            col = quote_ident(watermark_column),
            table = table,
        );
        let row = self.client.query_one(query.as_str(), &[]).await?;

        if let Ok(Some(min)) = row.try_get::<_, Option<i64>>(0) {
            let max: i64 = row
                .try_get::<_, Option<i64>>(1)?
                .ok_or_else(|| SyncError::schema("MAX is null while MIN is not"))?;
            return Ok(Some(PartitionRange::Int {
                start: min,
                end: max + 1,
            }));
        }
        if let Ok(Some(min)) = row.try_get::<_, Option<DateTime<Utc>>>(0) {
            let max: DateTime<Utc> = row
                .try_get::<_, Option<DateTime<Utc>>>(1)?
                .ok_or_else(|| SyncError::schema("MAX is null while MIN is not"))?;
            return Ok(Some(PartitionRange::Timestamp {
                start: min,
                end: max + chrono::Duration::microseconds(1),
            }));
        }
        Ok(None)
    }

    /// Execute the watermarked SELECT for one partition, pushing typed rows
    /// into the stream and closing it at the partition checkpoint.
    ///
    /// `query` binds the partition bounds as `$1` (inclusive) and `$2`
    /// (exclusive).
    pub async fn stream_partition(
        &self,
        query: &str,
        partition: &QRepPartition,
        mut sender: QRecordSender,
    ) -> Result<usize> {
        match self.stream_rows(query, partition, &mut sender).await {
            Ok(count) => {
                sender
                    .close(Checkpoint::Partition(partition.range.clone()))
                    .await?;
                Ok(count)
            }
            Err(error) => {
                let message = error.to_string();
                sender
                    .fail(ModelError::StreamClosed(format!("source error: {}", message)))
                    .await;
                Err(error)
            }
        }
    }

    async fn stream_rows(
        &self,
        query: &str,
        partition: &QRepPartition,
        sender: &mut QRecordSender,
    ) -> Result<usize> {
        let statement = self.client.prepare(query).await?;
        let schema = schema_from_columns(statement.columns(), &self.custom_types)?;
        sender.set_schema(schema.clone())?;

        let params: Vec<Box<dyn ToSql + Send + Sync>> = match &partition.range {
            PartitionRange::Int { start, end } => {
                vec![Box::new(*start), Box::new(*end)]
            }
            PartitionRange::Timestamp { start, end } => {
                vec![Box::new(*start), Box::new(*end)]
            }
        };
        let rows = self
            .client
            .query_raw(
                &statement,
                params.iter().map(|p| p.as_ref() as &(dyn ToSql + Sync)),
            )
            .await?;
        futures::pin_mut!(rows);

        let mut count = 0usize;
        while let Some(row) = rows.try_next().await? {
            sender.push(row_to_qvalues(&row, &schema)?).await?;
            count += 1;
        }
        Ok(count)
    }
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_int_partitions() {
        let partitions = plan_partitions("id", &PartitionRange::Int { start: 0, end: 100 }, 4);
        assert_eq!(partitions.len(), 4);
        assert_eq!(partitions[0].range, PartitionRange::Int { start: 0, end: 25 });
        assert_eq!(partitions[3].range, PartitionRange::Int { start: 75, end: 100 });
        assert_eq!(partitions[0].watermark_column, "id");

        // Contiguous, no gaps
        for pair in partitions.windows(2) {
            match (&pair[0].range, &pair[1].range) {
                (PartitionRange::Int { end, .. }, PartitionRange::Int { start, .. }) => {
                    assert_eq!(end, start);
                }
                _ => unreachable!(),
            }
        }
    }

    #[test]
    fn test_plan_uneven_range() {
        let partitions = plan_partitions("id", &PartitionRange::Int { start: 0, end: 10 }, 3);
        assert_eq!(partitions.len(), 3);
        assert_eq!(partitions[2].range, PartitionRange::Int { start: 8, end: 10 });
    }

    #[test]
    fn test_plan_more_partitions_than_rows() {
        let partitions = plan_partitions("id", &PartitionRange::Int { start: 0, end: 2 }, 10);
        assert_eq!(partitions.len(), 2);
    }

    #[test]
    fn test_plan_empty_range() {
        assert!(plan_partitions("id", &PartitionRange::Int { start: 5, end: 5 }, 4).is_empty());
    }

    #[test]
    fn test_plan_timestamp_partitions() {
        let start = DateTime::from_timestamp_micros(0).unwrap();
        let end = DateTime::from_timestamp_micros(4_000_000).unwrap();
        let partitions =
            plan_partitions("ts", &PartitionRange::Timestamp { start, end }, 2);
        assert_eq!(partitions.len(), 2);
        match &partitions[1].range {
            PartitionRange::Timestamp { start, end } => {
                assert_eq!(start.timestamp_micros(), 2_000_000);
                assert_eq!(end.timestamp_micros(), 4_000_000);
            }
            other => panic!("expected timestamp range, got {:?}", other),
        }
    }

    #[test]
    fn test_partition_ids_are_unique() {
        let partitions = plan_partitions("id", &PartitionRange::Int { start: 0, end: 10 }, 5);
        let mut ids: Vec<_> = partitions.iter().map(|p| &p.partition_id).collect();
        ids.dedup();
        assert_eq!(ids.len(), 5);
    }
}
