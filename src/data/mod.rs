//! The data manager: the public storage API.
//!
//! Callers see stable 64-bit item uids. Every mutation is logged before the
//! owning page can reach disk, and the metadata page's witness decides on
//! open whether the write-ahead log must be replayed.

mod item;
mod page_index;
mod records;
mod recover;

use std::path::Path;
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use log::warn;

pub use item::{DataItem, WriteGuard};

use crate::config::Options;
use crate::errors::BrambleError;
use crate::storage::cache::RefCache;
use crate::storage::page::{heap, meta, PAGE_SIZE};
use crate::storage::pager::Pager;
use crate::storage::wal::Logger;
use crate::txn::{TxnManager, Xid};

use page_index::PageIndex;

pub struct DataManager {
    shared: Arc<DmShared>,
}

pub(crate) struct DmShared {
    pager: Pager,
    logger: Logger,
    txns: Arc<TxnManager>,
    items: RefCache<DataItem>,
    page_index: PageIndex,
}

/// A pinned data item. Dropping the handle releases its cache slot (and,
/// transitively, its page pin).
pub struct ItemHandle {
    item: Arc<DataItem>,
    shared: Arc<DmShared>,
}

impl std::ops::Deref for ItemHandle {
    type Target = DataItem;

    fn deref(&self) -> &DataItem {
        &self.item
    }
}

impl Drop for ItemHandle {
    fn drop(&mut self) {
        if let Err(err) = self.shared.release_item(self.item.uid()) {
            log::error!("item {:#x} release failed: {err}", self.item.uid());
        }
    }
}

impl DataManager {
    /// Create a fresh database at `<base>.db` / `<base>.log`.
    pub fn create(
        base: impl AsRef<Path>,
        opts: Options,
        txns: Arc<TxnManager>,
    ) -> Result<Self, BrambleError> {
        let base = base.as_ref();
        let pager = Pager::create(&base.with_extension("db"), &opts)?;
        let logger = Logger::create(&base.with_extension("log"))?;
        let pgno = pager.new_page(meta::init())?;
        if pgno != 1 {
            return Err(BrambleError::Corrupt(format!(
                "metadata page allocated as page {pgno}"
            )));
        }

        let dm = Self {
            shared: Arc::new(DmShared {
                pager,
                logger,
                txns,
                items: RefCache::new(0),
                page_index: PageIndex::new(),
            }),
        };
        dm.stamp_meta_open()?;
        Ok(dm)
    }

    /// Open an existing database, replaying the log first if the last
    /// shutdown was not clean.
    pub fn open(
        base: impl AsRef<Path>,
        opts: Options,
        txns: Arc<TxnManager>,
    ) -> Result<Self, BrambleError> {
        let base = base.as_ref();
        let pager = Pager::open(&base.with_extension("db"), &opts)?;
        let logger = Logger::open(&base.with_extension("log"))?;

        let dm = Self {
            shared: Arc::new(DmShared {
                pager,
                logger,
                txns,
                items: RefCache::new(0),
                page_index: PageIndex::new(),
            }),
        };
        if !dm.witness_ok()? {
            warn!("unclean shutdown detected; running crash recovery");
            recover::recover(&dm.shared)?;
        }
        dm.fill_page_index()?;
        dm.stamp_meta_open()?;
        Ok(dm)
    }

    /// Pin the item at `uid`, or `None` if it has been tombstoned.
    pub fn read(&self, uid: u64) -> Result<Option<ItemHandle>, BrambleError> {
        let shared = self.shared.clone();
        let item = self.shared.items.get(uid, || shared.load_item(uid))?;
        let handle = ItemHandle {
            item,
            shared: self.shared.clone(),
        };
        if !handle.is_valid() {
            return Ok(None);
        }
        Ok(Some(handle))
    }

    /// Store `data` on some page with room for it and return the new uid.
    /// The insert record hits the log before the page mutates.
    pub fn insert(&self, xid: Xid, data: &[u8]) -> Result<u64, BrambleError> {
        let raw = item::wrap(data);
        if raw.len() > heap::MAX_FREE {
            return Err(BrambleError::DataTooLarge(data.len()));
        }

        for _ in 0..5 {
            let found = match self.shared.page_index.select(raw.len()) {
                Some(found) => found,
                None => {
                    let pgno = self.shared.pager.new_page(heap::init())?;
                    self.shared.page_index.add(pgno, heap::MAX_FREE);
                    continue;
                }
            };

            let page = self.shared.pager.get_page(found.pgno)?;
            let mut buf = page.lock();
            if heap::free_space(&buf) < raw.len() {
                // Stale index entry; refile the page and look again.
                let free = heap::free_space(&buf);
                drop(buf);
                self.shared.page_index.add(found.pgno, free);
                continue;
            }

            let offset = heap::fso(&buf);
            let record = records::encode_insert(xid, found.pgno, offset, &raw);
            if let Err(err) = self.shared.logger.log(&record) {
                let free = heap::free_space(&buf);
                drop(buf);
                self.shared.page_index.add(found.pgno, free);
                return Err(err);
            }
            heap::splice(&mut buf, &raw);
            let free = heap::free_space(&buf);
            drop(buf);
            page.set_dirty(true);
            self.shared.page_index.add(found.pgno, free);
            return Ok(item::uid(found.pgno, offset));
        }
        Err(BrambleError::NoSpaceOnAnyPage)
    }

    /// Close the update protocol opened by [`DataItem::before`]: log the
    /// pre- and post-image under `xid`, mark the page dirty, release the
    /// item's exclusive lock.
    pub fn after(&self, xid: Xid, mut guard: WriteGuard<'_>) -> Result<(), BrambleError> {
        let record = {
            let item = guard.item();
            let new_raw = guard.new_raw();
            records::encode_update(xid, item.uid(), guard.old_raw(), &new_raw)
        };
        self.shared.logger.log(&record)?;
        guard.item().page().set_dirty(true);
        guard.mark_committed();
        Ok(())
    }

    /// Flush everything and stamp the clean-shutdown witness.
    pub fn close(&self) -> Result<(), BrambleError> {
        self.shared.items.close(|_| Ok(()))?;
        self.shared.logger.close()?;

        let page = self.shared.pager.get_page(1)?;
        {
            let mut buf = page.lock();
            meta::stamp_close(&mut buf);
        }
        page.set_dirty(true);
        self.shared.pager.flush_page(&page)?;
        drop(page);

        self.shared.pager.close()
    }

    fn witness_ok(&self) -> Result<bool, BrambleError> {
        let page = self.shared.pager.get_page(1)?;
        let buf = page.lock();
        Ok(meta::witness_ok(&buf))
    }

    fn stamp_meta_open(&self) -> Result<(), BrambleError> {
        let page = self.shared.pager.get_page(1)?;
        {
            let mut buf = page.lock();
            meta::stamp_open(&mut buf);
        }
        page.set_dirty(true);
        self.shared.pager.flush_page(&page)
    }

    fn fill_page_index(&self) -> Result<(), BrambleError> {
        for pgno in 2..=self.shared.pager.page_count() {
            let page = self.shared.pager.get_page(pgno)?;
            let free = heap::free_space(&page.lock());
            self.shared.page_index.add(pgno, free);
        }
        Ok(())
    }
}

impl DmShared {
    fn load_item(&self, uid: u64) -> Result<DataItem, BrambleError> {
        let pgno = item::uid_pgno(uid);
        let offset = item::uid_offset(uid) as usize;
        let page = self.pager.get_page(pgno)?;
        let len = {
            let buf = page.lock();
            if offset + item::OF_DATA > PAGE_SIZE {
                return Err(BrambleError::Corrupt(format!(
                    "item {uid:#x} header out of bounds"
                )));
            }
            LittleEndian::read_u16(&buf[offset + item::OF_SIZE..offset + item::OF_DATA]) as usize
        };
        if offset + item::OF_DATA + len > PAGE_SIZE {
            return Err(BrambleError::Corrupt(format!(
                "item {uid:#x} data out of bounds"
            )));
        }
        Ok(DataItem::new(uid, offset, len, page))
    }

    fn release_item(&self, uid: u64) -> Result<(), BrambleError> {
        self.items.release(uid, |_| Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::txn::SUPER_XID;

    fn fresh_dm(dir: &std::path::Path) -> DataManager {
        let base = dir.join("test");
        let txns = Arc::new(TxnManager::create(&base).unwrap());
        DataManager::create(&base, Options::default(), txns).unwrap()
    }

    #[test]
    fn insert_then_read_round_trip() {
        let tmp = tempdir().unwrap();
        let dm = fresh_dm(tmp.path());

        let uid = dm.insert(SUPER_XID, b"hello").unwrap();
        let handle = dm.read(uid).unwrap().unwrap();
        assert_eq!(handle.data(), b"hello");
        assert_eq!(handle.uid(), uid);
    }

    #[test]
    fn update_via_before_after() {
        let tmp = tempdir().unwrap();
        let dm = fresh_dm(tmp.path());

        let uid = dm.insert(SUPER_XID, &[1u8, 2, 3]).unwrap();
        let handle = dm.read(uid).unwrap().unwrap();
        let mut guard = handle.before();
        guard.set(&[7, 8, 9]).unwrap();
        dm.after(SUPER_XID, guard).unwrap();
        drop(handle);

        let handle = dm.read(uid).unwrap().unwrap();
        assert_eq!(handle.data(), vec![7, 8, 9]);
    }

    #[test]
    fn dropped_guard_rolls_back() {
        let tmp = tempdir().unwrap();
        let dm = fresh_dm(tmp.path());

        let uid = dm.insert(SUPER_XID, &[1u8, 2, 3]).unwrap();
        let handle = dm.read(uid).unwrap().unwrap();
        {
            let mut guard = handle.before();
            guard.set(&[9, 9, 9]).unwrap();
            // No `after`: the guard restores the pre-image.
        }
        assert_eq!(handle.data(), vec![1, 2, 3]);
    }

    #[test]
    fn oversized_insert_is_rejected() {
        let tmp = tempdir().unwrap();
        let dm = fresh_dm(tmp.path());
        let big = vec![0u8; PAGE_SIZE];
        assert!(matches!(
            dm.insert(SUPER_XID, &big).unwrap_err(),
            BrambleError::DataTooLarge(_)
        ));
    }

    #[test]
    fn inserts_reuse_pages_with_room() {
        let tmp = tempdir().unwrap();
        let dm = fresh_dm(tmp.path());

        let a = dm.insert(SUPER_XID, &[0u8; 100]).unwrap();
        let b = dm.insert(SUPER_XID, &[1u8; 100]).unwrap();
        assert_eq!(item::uid_pgno(a), item::uid_pgno(b));
        assert_ne!(item::uid_offset(a), item::uid_offset(b));
    }

    #[test]
    fn items_survive_clean_close_and_reopen() {
        let tmp = tempdir().unwrap();
        let base = tmp.path().join("test");
        let uid;
        {
            let txns = Arc::new(TxnManager::create(&base).unwrap());
            let dm = DataManager::create(&base, Options::default(), txns).unwrap();
            uid = dm.insert(SUPER_XID, b"persist me").unwrap();
            dm.close().unwrap();
        }
        let txns = Arc::new(TxnManager::open(&base).unwrap());
        let dm = DataManager::open(&base, Options::default(), txns).unwrap();
        let handle = dm.read(uid).unwrap().unwrap();
        assert_eq!(handle.data(), b"persist me");
    }
}
