//! Transaction status table.
//!
//! One byte per xid in `<base>.xid`, behind a fixed header
//! `[counter:8 LE][crc32:4 LE]` where the crc covers the counter bytes.
//! `SUPER_XID` (0) has no entry and is always committed; it tags index and
//! boot mutations that bypass transactional undo.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};
use crc32fast::Hasher;
use parking_lot::Mutex;

use crate::errors::BrambleError;

pub type Xid = u64;

/// The privileged always-committed xid.
pub const SUPER_XID: Xid = 0;

const HEADER_LEN: u64 = 12;
const OF_COUNTER: usize = 0;
const OF_CRC: usize = 8;

const STATUS_ACTIVE: u8 = 0;
const STATUS_COMMITTED: u8 = 1;
const STATUS_ABORTED: u8 = 2;

fn header_crc(counter: u64) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(&counter.to_le_bytes());
    hasher.finalize()
}

fn pack_header(counter: u64) -> [u8; HEADER_LEN as usize] {
    let mut buf = [0u8; HEADER_LEN as usize];
    LittleEndian::write_u64(&mut buf[OF_COUNTER..OF_CRC], counter);
    LittleEndian::write_u32(&mut buf[OF_CRC..], header_crc(counter));
    buf
}

#[derive(Debug)]
pub struct TxnManager {
    state: Mutex<TxnState>,
}

#[derive(Debug)]
struct TxnState {
    file: File,
    counter: u64,
}

impl TxnManager {
    pub fn create(base: impl AsRef<Path>) -> Result<Self, BrambleError> {
        let path = base.as_ref().with_extension("xid");
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.write_all(&pack_header(0))?;
        file.sync_data()?;
        Ok(Self {
            state: Mutex::new(TxnState { file, counter: 0 }),
        })
    }

    pub fn open(base: impl AsRef<Path>) -> Result<Self, BrambleError> {
        let path = base.as_ref().with_extension("xid");
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        if len < HEADER_LEN {
            return Err(BrambleError::BadXidFile);
        }
        let mut header = [0u8; HEADER_LEN as usize];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut header)?;
        let counter = LittleEndian::read_u64(&header[OF_COUNTER..OF_CRC]);
        let crc = LittleEndian::read_u32(&header[OF_CRC..]);
        if crc != header_crc(counter) || len != HEADER_LEN + counter {
            return Err(BrambleError::BadXidFile);
        }
        Ok(Self {
            state: Mutex::new(TxnState { file, counter }),
        })
    }

    /// Allocate the next xid in the ACTIVE state.
    pub fn begin(&self) -> Result<Xid, BrambleError> {
        let mut state = self.state.lock();
        let xid = state.counter + 1;
        state.write_status(xid, STATUS_ACTIVE)?;
        state.counter = xid;
        let header = pack_header(xid);
        state.file.seek(SeekFrom::Start(0))?;
        state.file.write_all(&header)?;
        state.file.sync_data()?;
        Ok(xid)
    }

    pub fn commit(&self, xid: Xid) -> Result<(), BrambleError> {
        self.set_status(xid, STATUS_COMMITTED)
    }

    pub fn abort(&self, xid: Xid) -> Result<(), BrambleError> {
        self.set_status(xid, STATUS_ABORTED)
    }

    pub fn is_active(&self, xid: Xid) -> Result<bool, BrambleError> {
        if xid == SUPER_XID {
            return Ok(false);
        }
        Ok(self.status(xid)? == STATUS_ACTIVE)
    }

    pub fn is_committed(&self, xid: Xid) -> Result<bool, BrambleError> {
        if xid == SUPER_XID {
            return Ok(true);
        }
        Ok(self.status(xid)? == STATUS_COMMITTED)
    }

    pub fn is_aborted(&self, xid: Xid) -> Result<bool, BrambleError> {
        if xid == SUPER_XID {
            return Ok(false);
        }
        Ok(self.status(xid)? == STATUS_ABORTED)
    }

    pub fn close(&self) -> Result<(), BrambleError> {
        self.state.lock().file.sync_data()?;
        Ok(())
    }

    fn set_status(&self, xid: Xid, status: u8) -> Result<(), BrambleError> {
        let mut state = self.state.lock();
        if xid == SUPER_XID || xid > state.counter {
            return Err(BrambleError::Corrupt(format!("unknown xid {xid}")));
        }
        state.write_status(xid, status)?;
        state.file.sync_data()?;
        Ok(())
    }

    fn status(&self, xid: Xid) -> Result<u8, BrambleError> {
        let mut state = self.state.lock();
        if xid > state.counter {
            return Err(BrambleError::Corrupt(format!("unknown xid {xid}")));
        }
        state.file.seek(SeekFrom::Start(HEADER_LEN + xid - 1))?;
        let mut status = [0u8; 1];
        state.file.read_exact(&mut status)?;
        Ok(status[0])
    }
}

impl TxnState {
    fn write_status(&mut self, xid: Xid, status: u8) -> Result<(), BrambleError> {
        self.file.seek(SeekFrom::Start(HEADER_LEN + xid - 1))?;
        self.file.write_all(&[status])?;
        Ok(())
    }
}
