//! Wire decoding for the replication stream.
//!
//! Two layers: the streaming-replication framing (XLogData and keepalive
//! messages inside CopyData payloads, standby status updates going back),
//! and the pgoutput logical messages carried inside XLogData (relation
//! descriptors interleaved with per-row INSERT/UPDATE/DELETE tuples, plus
//! transaction BEGIN/COMMIT markers). All integers are big-endian; column
//! values arrive in their text form.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::CdcError;
use crate::event::Lsn;

/// Microseconds between the Unix and Postgres (2000-01-01) epochs.
const PG_EPOCH_OFFSET_MICROS: i64 = 946_684_800_000_000;

/// Column metadata from a relation descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationColumn {
    /// Bit 0 set when the column is part of the replica-identity key.
    pub flags: u8,
    pub name: String,
    pub type_oid: u32,
    pub type_modifier: i32,
}

impl RelationColumn {
    pub fn is_key(&self) -> bool {
        self.flags & 1 == 1
    }
}

/// Relation descriptor: column layout and key flags for one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relation {
    pub id: u32,
    pub namespace: String,
    pub name: String,
    pub replica_identity: u8,
    pub columns: Vec<RelationColumn>,
}

/// A single column value in a tuple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TupleValue {
    Null,
    /// Unchanged TOASTed value; not present in the event.
    Unchanged,
    Text(String),
}

/// One decoded row tuple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tuple(pub Vec<TupleValue>);

/// Logical replication messages relevant to the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogicalMessage {
    Begin {
        final_lsn: Lsn,
        xid: u32,
    },
    Commit {
        commit_lsn: Lsn,
        end_lsn: Lsn,
    },
    Relation(Relation),
    Insert {
        relation_id: u32,
        new: Tuple,
    },
    Update {
        relation_id: u32,
        old: Option<Tuple>,
        new: Tuple,
    },
    Delete {
        relation_id: u32,
        old: Tuple,
    },
    /// Origin, Type, Truncate and anything newer: ignored.
    Other(u8),
}

/// Outer replication frames inside CopyData payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationFrame {
    XLogData {
        wal_start: Lsn,
        wal_end: Lsn,
        data: Bytes,
    },
    Keepalive {
        wal_end: Lsn,
        reply_requested: bool,
    },
}

/// Bounds-checked big-endian reader over a byte slice.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CdcError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| CdcError::Protocol("message truncated".to_string()))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, CdcError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, CdcError> {
        Ok(u16::from_be_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32, CdcError> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn i32(&mut self) -> Result<i32, CdcError> {
        Ok(i32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64, CdcError> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    /// NUL-terminated UTF-8 string.
    fn cstr(&mut self) -> Result<String, CdcError> {
        let rest = &self.buf[self.pos..];
        let nul = rest
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| CdcError::Protocol("unterminated string".to_string()))?;
        let s = std::str::from_utf8(&rest[..nul])
            .map_err(|e| CdcError::Protocol(format!("invalid utf-8 in string: {e}")))?
            .to_string();
        self.pos += nul + 1;
        Ok(s)
    }

    fn remaining(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }
}

/// Parse one CopyData payload into a replication frame.
pub fn parse_frame(buf: &[u8]) -> Result<ReplicationFrame, CdcError> {
    let mut r = Reader::new(buf);

    match r.u8()? {
        b'w' => {
            let wal_start = Lsn(r.u64()?);
            let wal_end = Lsn(r.u64()?);
            let _server_time = r.u64()?;
            Ok(ReplicationFrame::XLogData {
                wal_start,
                wal_end,
                data: Bytes::copy_from_slice(r.remaining()),
            })
        }
        b'k' => {
            let wal_end = Lsn(r.u64()?);
            let _server_time = r.u64()?;
            let reply_requested = r.u8()? != 0;
            Ok(ReplicationFrame::Keepalive {
                wal_end,
                reply_requested,
            })
        }
        other => Err(CdcError::Protocol(format!(
            "unexpected replication message byte: {other:#04x}"
        ))),
    }
}

/// Parse a pgoutput logical message (the XLogData payload).
pub fn parse_logical(buf: &[u8]) -> Result<LogicalMessage, CdcError> {
    let mut r = Reader::new(buf);

    let tag = r.u8()?;
    match tag {
        b'B' => {
            let final_lsn = Lsn(r.u64()?);
            let _commit_time = r.u64()?;
            let xid = r.u32()?;
            Ok(LogicalMessage::Begin { final_lsn, xid })
        }
        b'C' => {
            let _flags = r.u8()?;
            let commit_lsn = Lsn(r.u64()?);
            let end_lsn = Lsn(r.u64()?);
            let _commit_time = r.u64()?;
            Ok(LogicalMessage::Commit {
                commit_lsn,
                end_lsn,
            })
        }
        b'R' => {
            let id = r.u32()?;
            let namespace = r.cstr()?;
            let name = r.cstr()?;
            let replica_identity = r.u8()?;
            let column_count = r.u16()?;

            let mut columns = Vec::with_capacity(column_count as usize);
            for _ in 0..column_count {
                columns.push(RelationColumn {
                    flags: r.u8()?,
                    name: r.cstr()?,
                    type_oid: r.u32()?,
                    type_modifier: r.i32()?,
                });
            }

            Ok(LogicalMessage::Relation(Relation {
                id,
                namespace,
                name,
                replica_identity,
                columns,
            }))
        }
        b'I' => {
            let relation_id = r.u32()?;
            match r.u8()? {
                b'N' => {}
                other => {
                    return Err(CdcError::Protocol(format!(
                        "unexpected insert tuple marker: {other:#04x}"
                    )))
                }
            }
            let new = parse_tuple(&mut r)?;
            Ok(LogicalMessage::Insert { relation_id, new })
        }
        b'U' => {
            let relation_id = r.u32()?;
            let mut old = None;

            let marker = r.u8()?;
            let new = match marker {
                b'K' | b'O' => {
                    old = Some(parse_tuple(&mut r)?);
                    match r.u8()? {
                        b'N' => parse_tuple(&mut r)?,
                        other => {
                            return Err(CdcError::Protocol(format!(
                                "unexpected update tuple marker: {other:#04x}"
                            )))
                        }
                    }
                }
                b'N' => parse_tuple(&mut r)?,
                other => {
                    return Err(CdcError::Protocol(format!(
                        "unexpected update tuple marker: {other:#04x}"
                    )))
                }
            };

            Ok(LogicalMessage::Update {
                relation_id,
                old,
                new,
            })
        }
        b'D' => {
            let relation_id = r.u32()?;
            match r.u8()? {
                b'K' | b'O' => {}
                other => {
                    return Err(CdcError::Protocol(format!(
                        "unexpected delete tuple marker: {other:#04x}"
                    )))
                }
            }
            let old = parse_tuple(&mut r)?;
            Ok(LogicalMessage::Delete { relation_id, old })
        }
        other => Ok(LogicalMessage::Other(other)),
    }
}

fn parse_tuple(r: &mut Reader<'_>) -> Result<Tuple, CdcError> {
    let column_count = r.u16()?;
    let mut values = Vec::with_capacity(column_count as usize);

    for _ in 0..column_count {
        match r.u8()? {
            b'n' => values.push(TupleValue::Null),
            b'u' => values.push(TupleValue::Unchanged),
            b't' => {
                let len = r.i32()?;
                if len < 0 {
                    return Err(CdcError::Protocol("negative column length".to_string()));
                }
                let data = r.take(len as usize)?;
                let text = std::str::from_utf8(data)
                    .map_err(|e| CdcError::Protocol(format!("invalid utf-8 in column: {e}")))?
                    .to_string();
                values.push(TupleValue::Text(text));
            }
            other => {
                return Err(CdcError::Protocol(format!(
                    "unexpected column marker: {other:#04x}"
                )))
            }
        }
    }

    Ok(Tuple(values))
}

/// Encode a standby status update acknowledging `lsn` as written, flushed,
/// and applied.
pub fn standby_status_update(lsn: Lsn, reply_requested: bool) -> Bytes {
    let now_micros = chrono::Utc::now().timestamp_micros() - PG_EPOCH_OFFSET_MICROS;

    let mut buf = BytesMut::with_capacity(34);
    buf.put_u8(b'r');
    buf.put_u64(lsn.0);
    buf.put_u64(lsn.0);
    buf.put_u64(lsn.0);
    buf.put_i64(now_micros);
    buf.put_u8(u8::from(reply_requested));
    buf.freeze()
}
