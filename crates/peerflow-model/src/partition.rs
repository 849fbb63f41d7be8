//! QRep partitions and source progress checkpoints.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Inclusive-exclusive `[start, end)` range over a watermark column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PartitionRange {
    /// Integer watermark (e.g. a bigint id column)
    Int { start: i64, end: i64 },
    /// Timestamp watermark
    Timestamp {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
}

/// A QRep unit of work: one range over the watermark column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QRepPartition {
    /// UUID identifying this partition across retries
    pub partition_id: String,
    /// Watermark range covered by this partition
    pub range: PartitionRange,
    /// Column the range applies to
    pub watermark_column: String,
}

impl QRepPartition {
    /// Create a partition with a fresh UUID.
    pub fn new(watermark_column: impl Into<String>, range: PartitionRange) -> Self {
        Self {
            partition_id: Uuid::new_v4().to_string(),
            range,
            watermark_column: watermark_column.into(),
        }
    }
}

/// Opaque source-side progress marker carried by a stream's terminal item.
///
/// Once durably recorded at the destination it may be acknowledged
/// upstream: an LSN advances the replication slot's confirmed flush
/// position, a partition range marks the watermark window as applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Checkpoint {
    /// PostgreSQL log sequence number
    Lsn(u64),
    /// QRep partition boundary
    Partition(PartitionRange),
}

impl Checkpoint {
    /// The LSN if this is a CDC checkpoint.
    pub fn lsn(&self) -> Option<u64> {
        match self {
            Self::Lsn(lsn) => Some(*lsn),
            Self::Partition(_) => None,
        }
    }

    /// Text form persisted in the CDC metadata table.
    pub fn to_text(&self) -> String {
        match self {
            Self::Lsn(lsn) => format_lsn(*lsn),
            Self::Partition(range) => {
                serde_json::to_string(range).unwrap_or_else(|_| String::from("{}"))
            }
        }
    }
}

/// Format an LSN in PostgreSQL's `X/Y` hex notation.
pub fn format_lsn(lsn: u64) -> String {
    format!("{:X}/{:X}", lsn >> 32, lsn & 0xFFFF_FFFF)
}

/// Parse an LSN from `X/Y` hex notation.
pub fn parse_lsn(text: &str) -> Option<u64> {
    let (high, low) = text.split_once('/')?;
    let high = u64::from_str_radix(high, 16).ok()?;
    let low = u64::from_str_radix(low, 16).ok()?;
    Some((high << 32) | low)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lsn_format_parse() {
        assert_eq!(format_lsn(0x0000_0001_1234_5678), "1/12345678");
        assert_eq!(parse_lsn("1/12345678"), Some(0x0000_0001_1234_5678));
        assert_eq!(parse_lsn("0/0"), Some(0));
        assert_eq!(parse_lsn("bogus"), None);
    }

    #[test]
    fn test_checkpoint_text() {
        assert_eq!(Checkpoint::Lsn(0x1000).to_text(), "0/1000");
        let cp = Checkpoint::Partition(PartitionRange::Int { start: 0, end: 10 });
        assert!(cp.to_text().contains("\"start\":0"));
        assert_eq!(cp.lsn(), None);
    }

    #[test]
    fn test_partition_ids_unique() {
        let a = QRepPartition::new("id", PartitionRange::Int { start: 0, end: 5 });
        let b = QRepPartition::new("id", PartitionRange::Int { start: 5, end: 10 });
        assert_ne!(a.partition_id, b.partition_id);
    }

    #[test]
    fn test_partition_json_roundtrip() {
        let p = QRepPartition::new(
            "updated_at",
            PartitionRange::Timestamp {
                start: DateTime::<Utc>::from_timestamp(0, 0).unwrap(),
                end: DateTime::<Utc>::from_timestamp(3600, 0).unwrap(),
            },
        );
        let json = serde_json::to_string(&p).unwrap();
        let back: QRepPartition = serde_json::from_str(&json).unwrap();
        assert_eq!(back, p);
    }
}
