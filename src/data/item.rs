//! Data items: variable-length cells stored inside heap pages.
//!
//! On-page layout `[valid:1][size:2 LE][data:size]`, addressed by a uid of
//! `(page_no << 32) | offset`. Mutation follows a before/after protocol: the
//! write guard snapshots the old raw, the caller overwrites the data region,
//! and the commit path logs old and new bytes. A guard dropped uncommitted
//! puts the old bytes back.

use byteorder::{ByteOrder, LittleEndian};
use parking_lot::{RwLock, RwLockWriteGuard};

use crate::errors::BrambleError;
use crate::storage::pager::PageHandle;

pub(crate) const OF_VALID: usize = 0;
pub(crate) const OF_SIZE: usize = 1;
pub(crate) const OF_DATA: usize = 3;

pub(crate) const RAW_VALID: u8 = 1;
pub(crate) const RAW_INVALID: u8 = 0;

pub(crate) fn uid(pgno: u32, offset: u16) -> u64 {
    (pgno as u64) << 32 | offset as u64
}

pub(crate) fn uid_pgno(uid: u64) -> u32 {
    (uid >> 32) as u32
}

pub(crate) fn uid_offset(uid: u64) -> u16 {
    (uid & 0xFFFF) as u16
}

/// Frame `data` as an item raw ready for splicing into a page.
pub(crate) fn wrap(data: &[u8]) -> Vec<u8> {
    let mut raw = vec![0u8; OF_DATA + data.len()];
    raw[OF_VALID] = RAW_VALID;
    LittleEndian::write_u16(&mut raw[OF_SIZE..OF_DATA], data.len() as u16);
    raw[OF_DATA..].copy_from_slice(data);
    raw
}

pub struct DataItem {
    uid: u64,
    offset: usize,
    len: usize,
    page: PageHandle,
    lock: RwLock<()>,
}

impl DataItem {
    pub(crate) fn new(uid: u64, offset: usize, len: usize, page: PageHandle) -> Self {
        Self {
            uid,
            offset,
            len,
            page,
            lock: RwLock::new(()),
        }
    }

    pub fn uid(&self) -> u64 {
        self.uid
    }

    /// Copy of the item's data region, taken under the shared lock.
    pub fn data(&self) -> Vec<u8> {
        let _shared = self.lock.read();
        let buf = self.page.lock();
        buf[self.offset + OF_DATA..][..self.len].to_vec()
    }

    pub(crate) fn is_valid(&self) -> bool {
        let buf = self.page.lock();
        buf[self.offset + OF_VALID] == RAW_VALID
    }

    pub(crate) fn page(&self) -> &PageHandle {
        &self.page
    }

    fn raw(&self) -> Vec<u8> {
        let buf = self.page.lock();
        buf[self.offset..][..OF_DATA + self.len].to_vec()
    }

    /// Open the update protocol: take the exclusive lock and snapshot the old
    /// raw. Pass the guard to [`DataManager::after`] to commit, or drop it to
    /// roll the bytes back.
    ///
    /// [`DataManager::after`]: crate::DataManager::after
    pub fn before(&self) -> WriteGuard<'_> {
        let lock = self.lock.write();
        let old_raw = self.raw();
        WriteGuard {
            item: self,
            old_raw,
            committed: false,
            _lock: lock,
        }
    }
}

pub struct WriteGuard<'a> {
    item: &'a DataItem,
    old_raw: Vec<u8>,
    committed: bool,
    _lock: RwLockWriteGuard<'a, ()>,
}

impl WriteGuard<'_> {
    /// Copy of the item's current data region.
    pub fn data(&self) -> Vec<u8> {
        let buf = self.item.page.lock();
        buf[self.item.offset + OF_DATA..][..self.item.len].to_vec()
    }

    /// Overwrite the data region in place. Items never change size.
    pub fn set(&mut self, data: &[u8]) -> Result<(), BrambleError> {
        if data.len() != self.item.len {
            return Err(BrambleError::Corrupt(format!(
                "item update must preserve length ({} != {})",
                data.len(),
                self.item.len
            )));
        }
        let mut buf = self.item.page.lock();
        buf[self.item.offset + OF_DATA..][..data.len()].copy_from_slice(data);
        Ok(())
    }

    pub(crate) fn item(&self) -> &DataItem {
        self.item
    }

    pub(crate) fn old_raw(&self) -> &[u8] {
        &self.old_raw
    }

    pub(crate) fn new_raw(&self) -> Vec<u8> {
        self.item.raw()
    }

    pub(crate) fn mark_committed(&mut self) {
        self.committed = true;
    }
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        let mut buf = self.item.page.lock();
        buf[self.item.offset..][..self.old_raw.len()].copy_from_slice(&self.old_raw);
    }
}
