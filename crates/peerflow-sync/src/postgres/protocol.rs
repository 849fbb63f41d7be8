//! pgoutput message model and decoder.
//!
//! Decodes the binary logical-replication messages PostgreSQL emits for a
//! publication with `proto_version '1'`. Only the message set the CDC sync
//! consumes is modeled; anything else is a decode error, surfaced rather
//! than skipped.

use bytes::{Buf, Bytes};
use thiserror::Error;

/// Decoder errors.
#[derive(Error, Debug)]
pub enum PgOutputError {
    #[error("not enough data")]
    NotEnoughData,
    #[error("unknown message type: {0:#04x}")]
    UnknownType(u8),
    #[error("invalid utf8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// A decoded pgoutput message.
#[derive(Debug, Clone)]
pub enum PgOutputMessage {
    Begin(BeginBody),
    Commit(CommitBody),
    Origin(OriginBody),
    Relation(RelationDesc),
    Type(TypeBody),
    Insert(InsertBody),
    Update(UpdateBody),
    Delete(DeleteBody),
    Truncate(TruncateBody),
}

#[derive(Debug, Clone)]
pub struct BeginBody {
    pub final_lsn: u64,
    /// Commit timestamp, microseconds since the PostgreSQL epoch
    pub timestamp: i64,
    pub xid: u32,
}

#[derive(Debug, Clone)]
pub struct CommitBody {
    pub flags: u8,
    pub commit_lsn: u64,
    pub end_lsn: u64,
    pub timestamp: i64,
}

#[derive(Debug, Clone)]
pub struct OriginBody {
    pub commit_lsn: u64,
    pub name: String,
}

/// Table definition announced before its first row message.
#[derive(Debug, Clone)]
pub struct RelationDesc {
    pub id: u32,
    pub namespace: String,
    pub name: String,
    pub replica_identity: u8,
    pub columns: Vec<RelationColumn>,
}

#[derive(Debug, Clone)]
pub struct RelationColumn {
    /// Bit 0 set when the column is part of the replica identity key
    pub flags: u8,
    pub name: String,
    pub type_oid: u32,
    pub type_modifier: i32,
}

#[derive(Debug, Clone)]
pub struct TypeBody {
    pub id: u32,
    pub namespace: String,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct InsertBody {
    pub relation_id: u32,
    pub new_tuple: TupleData,
}

#[derive(Debug, Clone)]
pub struct UpdateBody {
    pub relation_id: u32,
    /// Old image when replica identity provides one ('K' or 'O' tuple)
    pub old_tuple: Option<TupleData>,
    pub new_tuple: TupleData,
}

#[derive(Debug, Clone)]
pub struct DeleteBody {
    pub relation_id: u32,
    pub old_tuple: Option<TupleData>,
}

#[derive(Debug, Clone)]
pub struct TruncateBody {
    pub options: u8,
    pub relation_ids: Vec<u32>,
}

/// A row image as a list of column values.
#[derive(Debug, Clone)]
pub struct TupleData(pub Vec<ColumnData>);

/// One column value within a tuple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnData {
    Null,
    /// TOASTed and unchanged; the value was not sent
    UnchangedToast,
    /// Text representation
    Text(Bytes),
}

/// Decode one pgoutput message from a WAL data payload.
pub fn decode(data: &mut Bytes) -> Result<PgOutputMessage, PgOutputError> {
    if !data.has_remaining() {
        return Err(PgOutputError::NotEnoughData);
    }
    let tag = data.get_u8();
    match tag {
        b'B' => {
            ensure(data, 20)?;
            Ok(PgOutputMessage::Begin(BeginBody {
                final_lsn: data.get_u64(),
                timestamp: data.get_i64(),
                xid: data.get_u32(),
            }))
        }
        b'C' => {
            ensure(data, 25)?;
            Ok(PgOutputMessage::Commit(CommitBody {
                flags: data.get_u8(),
                commit_lsn: data.get_u64(),
                end_lsn: data.get_u64(),
                timestamp: data.get_i64(),
            }))
        }
        b'O' => {
            ensure(data, 8)?;
            Ok(PgOutputMessage::Origin(OriginBody {
                commit_lsn: data.get_u64(),
                name: read_cstring(data)?,
            }))
        }
        b'R' => decode_relation(data).map(PgOutputMessage::Relation),
        b'Y' => {
            ensure(data, 4)?;
            Ok(PgOutputMessage::Type(TypeBody {
                id: data.get_u32(),
                namespace: read_cstring(data)?,
                name: read_cstring(data)?,
            }))
        }
        b'I' => {
            ensure(data, 5)?;
            let relation_id = data.get_u32();
            let marker = data.get_u8();
            if marker != b'N' {
                return Err(PgOutputError::Protocol(format!(
                    "insert expected new tuple marker, got {:#04x}",
                    marker
                )));
            }
            Ok(PgOutputMessage::Insert(InsertBody {
                relation_id,
                new_tuple: decode_tuple(data)?,
            }))
        }
        b'U' => decode_update(data).map(PgOutputMessage::Update),
        b'D' => {
            ensure(data, 5)?;
            let relation_id = data.get_u32();
            let marker = data.get_u8();
            let old_tuple = match marker {
                b'K' | b'O' => Some(decode_tuple(data)?),
                other => {
                    return Err(PgOutputError::Protocol(format!(
                        "delete expected key or old tuple marker, got {:#04x}",
                        other
                    )));
                }
            };
            Ok(PgOutputMessage::Delete(DeleteBody {
                relation_id,
                old_tuple,
            }))
        }
        b'T' => {
            ensure(data, 5)?;
            let count = data.get_u32() as usize;
            let options = data.get_u8();
            ensure(data, count * 4)?;
            let relation_ids = (0..count).map(|_| data.get_u32()).collect();
            Ok(PgOutputMessage::Truncate(TruncateBody {
                options,
                relation_ids,
            }))
        }
        other => Err(PgOutputError::UnknownType(other)),
    }
}

fn decode_relation(data: &mut Bytes) -> Result<RelationDesc, PgOutputError> {
    ensure(data, 4)?;
    let id = data.get_u32();
    let namespace = read_cstring(data)?;
    let name = read_cstring(data)?;
    ensure(data, 3)?;
    let replica_identity = data.get_u8();
    let column_count = data.get_u16() as usize;

    let mut columns = Vec::with_capacity(column_count);
    for _ in 0..column_count {
        ensure(data, 1)?;
        let flags = data.get_u8();
        let column_name = read_cstring(data)?;
        ensure(data, 8)?;
        columns.push(RelationColumn {
            flags,
            name: column_name,
            type_oid: data.get_u32(),
            type_modifier: data.get_i32(),
        });
    }

    Ok(RelationDesc {
        id,
        namespace,
        name,
        replica_identity,
        columns,
    })
}

fn decode_update(data: &mut Bytes) -> Result<UpdateBody, PgOutputError> {
    ensure(data, 5)?;
    let relation_id = data.get_u32();
    let marker = data.get_u8();

    let (old_tuple, new_tuple) = match marker {
        b'K' | b'O' => {
            let old = decode_tuple(data)?;
            ensure(data, 1)?;
            let next = data.get_u8();
            if next != b'N' {
                return Err(PgOutputError::Protocol(format!(
                    "update expected new tuple after old image, got {:#04x}",
                    next
                )));
            }
            (Some(old), decode_tuple(data)?)
        }
        b'N' => (None, decode_tuple(data)?),
        other => {
            return Err(PgOutputError::Protocol(format!(
                "update expected tuple marker, got {:#04x}",
                other
            )));
        }
    };

    Ok(UpdateBody {
        relation_id,
        old_tuple,
        new_tuple,
    })
}

fn decode_tuple(data: &mut Bytes) -> Result<TupleData, PgOutputError> {
    ensure(data, 2)?;
    let column_count = data.get_u16() as usize;
    let mut columns = Vec::with_capacity(column_count);
    for _ in 0..column_count {
        ensure(data, 1)?;
        match data.get_u8() {
            b'n' => columns.push(ColumnData::Null),
            b'u' => columns.push(ColumnData::UnchangedToast),
            b't' => {
                ensure(data, 4)?;
                let len = data.get_u32() as usize;
                ensure(data, len)?;
                columns.push(ColumnData::Text(data.copy_to_bytes(len)));
            }
            other => {
                return Err(PgOutputError::Protocol(format!(
                    "unknown tuple column tag {:#04x}",
                    other
                )));
            }
        }
    }
    Ok(TupleData(columns))
}

fn read_cstring(data: &mut Bytes) -> Result<String, PgOutputError> {
    let end = data
        .iter()
        .position(|&b| b == 0)
        .ok_or(PgOutputError::NotEnoughData)?;
    let raw = data.copy_to_bytes(end);
    data.advance(1);
    Ok(std::str::from_utf8(&raw)?.to_string())
}

fn ensure(data: &Bytes, len: usize) -> Result<(), PgOutputError> {
    if data.remaining() < len {
        Err(PgOutputError::NotEnoughData)
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{BufMut, BytesMut};

    fn put_cstring(buf: &mut BytesMut, s: &str) {
        buf.put_slice(s.as_bytes());
        buf.put_u8(0);
    }

    fn relation_message() -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'R');
        buf.put_u32(16384);
        put_cstring(&mut buf, "public");
        put_cstring(&mut buf, "events");
        buf.put_u8(b'd'); // replica identity default
        buf.put_u16(2);
        // id column, part of key
        buf.put_u8(1);
        put_cstring(&mut buf, "id");
        buf.put_u32(20); // int8
        buf.put_i32(-1);
        // key column
        buf.put_u8(0);
        put_cstring(&mut buf, "key");
        buf.put_u32(25); // text
        buf.put_i32(-1);
        buf.freeze()
    }

    #[test]
    fn test_decode_begin() {
        let mut buf = BytesMut::new();
        buf.put_u8(b'B');
        buf.put_u64(0x0000_0001_0000_0000);
        buf.put_i64(757_000_000_000_000);
        buf.put_u32(731);

        let mut data = buf.freeze();
        match decode(&mut data).unwrap() {
            PgOutputMessage::Begin(body) => {
                assert_eq!(body.final_lsn, 0x0000_0001_0000_0000);
                assert_eq!(body.xid, 731);
            }
            other => panic!("expected Begin, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_relation() {
        let mut data = relation_message();
        match decode(&mut data).unwrap() {
            PgOutputMessage::Relation(rel) => {
                assert_eq!(rel.id, 16384);
                assert_eq!(rel.namespace, "public");
                assert_eq!(rel.name, "events");
                assert_eq!(rel.columns.len(), 2);
                assert_eq!(rel.columns[0].name, "id");
                assert_eq!(rel.columns[0].type_oid, 20);
                assert_eq!(rel.columns[0].flags, 1);
                assert_eq!(rel.columns[1].name, "key");
            }
            other => panic!("expected Relation, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_insert() {
        let mut buf = BytesMut::new();
        buf.put_u8(b'I');
        buf.put_u32(16384);
        buf.put_u8(b'N');
        buf.put_u16(2);
        buf.put_u8(b't');
        buf.put_u32(1);
        buf.put_slice(b"7");
        buf.put_u8(b'n');

        let mut data = buf.freeze();
        match decode(&mut data).unwrap() {
            PgOutputMessage::Insert(body) => {
                assert_eq!(body.relation_id, 16384);
                assert_eq!(body.new_tuple.0.len(), 2);
                assert_eq!(body.new_tuple.0[0], ColumnData::Text(Bytes::from_static(b"7")));
                assert_eq!(body.new_tuple.0[1], ColumnData::Null);
            }
            other => panic!("expected Insert, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_update_with_old_image() {
        let mut buf = BytesMut::new();
        buf.put_u8(b'U');
        buf.put_u32(16384);
        buf.put_u8(b'O');
        buf.put_u16(1);
        buf.put_u8(b't');
        buf.put_u32(3);
        buf.put_slice(b"old");
        buf.put_u8(b'N');
        buf.put_u16(1);
        buf.put_u8(b't');
        buf.put_u32(3);
        buf.put_slice(b"new");

        let mut data = buf.freeze();
        match decode(&mut data).unwrap() {
            PgOutputMessage::Update(body) => {
                assert!(body.old_tuple.is_some());
                assert_eq!(
                    body.new_tuple.0[0],
                    ColumnData::Text(Bytes::from_static(b"new"))
                );
            }
            other => panic!("expected Update, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_delete() {
        let mut buf = BytesMut::new();
        buf.put_u8(b'D');
        buf.put_u32(16384);
        buf.put_u8(b'K');
        buf.put_u16(1);
        buf.put_u8(b't');
        buf.put_u32(1);
        buf.put_slice(b"7");

        let mut data = buf.freeze();
        match decode(&mut data).unwrap() {
            PgOutputMessage::Delete(body) => {
                assert_eq!(body.relation_id, 16384);
                assert!(body.old_tuple.is_some());
            }
            other => panic!("expected Delete, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_toast_marker() {
        let mut buf = BytesMut::new();
        buf.put_u8(b'I');
        buf.put_u32(1);
        buf.put_u8(b'N');
        buf.put_u16(1);
        buf.put_u8(b'u');

        let mut data = buf.freeze();
        match decode(&mut data).unwrap() {
            PgOutputMessage::Insert(body) => {
                assert_eq!(body.new_tuple.0[0], ColumnData::UnchangedToast);
            }
            other => panic!("expected Insert, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_type_is_error() {
        let mut data = Bytes::from_static(&[b'Z', 0, 0]);
        assert!(matches!(
            decode(&mut data),
            Err(PgOutputError::UnknownType(b'Z'))
        ));
    }

    #[test]
    fn test_truncated_message_is_error() {
        let mut data = Bytes::from_static(&[b'B', 0, 0]);
        assert!(matches!(decode(&mut data), Err(PgOutputError::NotEnoughData)));
    }
}
