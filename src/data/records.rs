//! WAL record payloads emitted by the data manager.
//!
//! - Insert: `[kind=0][xid:8][page_no:4][offset:2][item raw ...]`
//! - Update: `[kind=1][xid:8][uid:8][old_len:4][old raw][new raw]`
//!
//! The new raw's length is whatever remains of the record.

use crate::data::item;
use crate::errors::BrambleError;
use crate::txn::Xid;

const KIND_INSERT: u8 = 0;
const KIND_UPDATE: u8 = 1;

pub(crate) fn encode_insert(xid: Xid, pgno: u32, offset: u16, raw: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(15 + raw.len());
    buf.push(KIND_INSERT);
    buf.extend_from_slice(&xid.to_le_bytes());
    buf.extend_from_slice(&pgno.to_le_bytes());
    buf.extend_from_slice(&offset.to_le_bytes());
    buf.extend_from_slice(raw);
    buf
}

pub(crate) fn encode_update(xid: Xid, uid: u64, old_raw: &[u8], new_raw: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(21 + old_raw.len() + new_raw.len());
    buf.push(KIND_UPDATE);
    buf.extend_from_slice(&xid.to_le_bytes());
    buf.extend_from_slice(&uid.to_le_bytes());
    buf.extend_from_slice(&(old_raw.len() as u32).to_le_bytes());
    buf.extend_from_slice(old_raw);
    buf.extend_from_slice(new_raw);
    buf
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LogRecord {
    Insert {
        xid: Xid,
        pgno: u32,
        offset: u16,
        raw: Vec<u8>,
    },
    Update {
        xid: Xid,
        uid: u64,
        old_raw: Vec<u8>,
        new_raw: Vec<u8>,
    },
}

fn truncated() -> BrambleError {
    BrambleError::Corrupt("truncated log record".into())
}

fn read_u16(data: &[u8], cursor: &mut usize) -> Result<u16, BrambleError> {
    let bytes = data
        .get(*cursor..*cursor + 2)
        .ok_or_else(truncated)?
        .try_into()
        .expect("slice length checked");
    *cursor += 2;
    Ok(u16::from_le_bytes(bytes))
}

fn read_u32(data: &[u8], cursor: &mut usize) -> Result<u32, BrambleError> {
    let bytes = data
        .get(*cursor..*cursor + 4)
        .ok_or_else(truncated)?
        .try_into()
        .expect("slice length checked");
    *cursor += 4;
    Ok(u32::from_le_bytes(bytes))
}

fn read_u64(data: &[u8], cursor: &mut usize) -> Result<u64, BrambleError> {
    let bytes = data
        .get(*cursor..*cursor + 8)
        .ok_or_else(truncated)?
        .try_into()
        .expect("slice length checked");
    *cursor += 8;
    Ok(u64::from_le_bytes(bytes))
}

impl LogRecord {
    pub fn decode(data: &[u8]) -> Result<Self, BrambleError> {
        let kind = *data.first().ok_or_else(truncated)?;
        let mut cursor = 1usize;
        match kind {
            KIND_INSERT => {
                let xid = read_u64(data, &mut cursor)?;
                let pgno = read_u32(data, &mut cursor)?;
                let offset = read_u16(data, &mut cursor)?;
                if cursor >= data.len() {
                    return Err(truncated());
                }
                Ok(LogRecord::Insert {
                    xid,
                    pgno,
                    offset,
                    raw: data[cursor..].to_vec(),
                })
            }
            KIND_UPDATE => {
                let xid = read_u64(data, &mut cursor)?;
                let uid = read_u64(data, &mut cursor)?;
                let old_len = read_u32(data, &mut cursor)? as usize;
                let old_raw = data
                    .get(cursor..cursor + old_len)
                    .ok_or_else(truncated)?
                    .to_vec();
                cursor += old_len;
                Ok(LogRecord::Update {
                    xid,
                    uid,
                    old_raw,
                    new_raw: data[cursor..].to_vec(),
                })
            }
            other => Err(BrambleError::Corrupt(format!(
                "unknown log record kind {other}"
            ))),
        }
    }

    pub fn xid(&self) -> Xid {
        match self {
            LogRecord::Insert { xid, .. } => *xid,
            LogRecord::Update { xid, .. } => *xid,
        }
    }

    /// Page number the record touches, for recovery's truncation bound.
    pub fn pgno(&self) -> u32 {
        match self {
            LogRecord::Insert { pgno, .. } => *pgno,
            LogRecord::Update { uid, .. } => item::uid_pgno(*uid),
        }
    }
}
