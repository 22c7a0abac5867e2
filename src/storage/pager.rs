//! The pager fronts the database file with a reference-counted page cache.
//!
//! Pages are 1-based; page 1 is the metadata page. `new_page` extends the
//! file directly and never caches the fresh page, so allocation cannot evict
//! a pinned page. Cached pages are written back when their last pin drops.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::Options;
use crate::errors::BrambleError;
use crate::storage::cache::RefCache;
use crate::storage::page::{Page, PAGE_SIZE};

pub struct Pager {
    shared: Arc<PagerShared>,
}

#[derive(Debug)]
pub(crate) struct PagerShared {
    file: Mutex<File>,
    page_count: AtomicU32,
    cache: RefCache<Page>,
}

/// A pinned page. Dropping the handle releases the pin; the last pin to drop
/// writes the page back if it is dirty.
#[derive(Debug)]
pub struct PageHandle {
    page: Arc<Page>,
    pager: Arc<PagerShared>,
}

impl std::ops::Deref for PageHandle {
    type Target = Page;

    fn deref(&self) -> &Page {
        &self.page
    }
}

impl Drop for PageHandle {
    fn drop(&mut self) {
        if let Err(err) = self.pager.release(self.page.no()) {
            log::error!("page {} write-back failed: {err}", self.page.no());
        }
    }
}

fn page_offset(pgno: u32) -> u64 {
    (pgno as u64 - 1) * PAGE_SIZE as u64
}

impl Pager {
    pub fn create(path: &Path, opts: &Options) -> Result<Self, BrambleError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Self {
            shared: Arc::new(PagerShared {
                file: Mutex::new(file),
                page_count: AtomicU32::new(0),
                cache: RefCache::new(opts.cache_pages),
            }),
        })
    }

    pub fn open(path: &Path, opts: &Options) -> Result<Self, BrambleError> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        let pages = (len / PAGE_SIZE as u64) as u32;
        if pages == 0 {
            return Err(BrambleError::Corrupt(
                "database file has no metadata page".into(),
            ));
        }
        Ok(Self {
            shared: Arc::new(PagerShared {
                file: Mutex::new(file),
                page_count: AtomicU32::new(pages),
                cache: RefCache::new(opts.cache_pages),
            }),
        })
    }

    /// Extend the file by one page holding `init` and fsync. The new page is
    /// not cached; the first `get_page` reads it back.
    pub fn new_page(&self, init: Box<[u8]>) -> Result<u32, BrambleError> {
        debug_assert_eq!(init.len(), PAGE_SIZE);
        let mut file = self.shared.file.lock();
        let pgno = self.shared.page_count.fetch_add(1, Ordering::SeqCst) + 1;
        file.seek(SeekFrom::Start(page_offset(pgno)))?;
        file.write_all(&init)?;
        file.sync_data()?;
        Ok(pgno)
    }

    pub fn get_page(&self, pgno: u32) -> Result<PageHandle, BrambleError> {
        if pgno == 0 || pgno > self.page_count() {
            return Err(BrambleError::Corrupt(format!(
                "page {pgno} out of range (file has {} pages)",
                self.page_count()
            )));
        }
        let shared = self.shared.clone();
        let page = self
            .shared
            .cache
            .get(pgno as u64, || shared.read_page(pgno))?;
        Ok(PageHandle {
            page,
            pager: self.shared.clone(),
        })
    }

    /// Write a page out immediately, without waiting for eviction.
    pub fn flush_page(&self, page: &Page) -> Result<(), BrambleError> {
        self.shared.write_page(page)
    }

    /// Drop every page past `pgno` and shrink the file to match.
    pub fn truncate_by_pgno(&self, pgno: u32) -> Result<(), BrambleError> {
        let mut file = self.shared.file.lock();
        file.set_len(pgno as u64 * PAGE_SIZE as u64)?;
        file.sync_data()?;
        self.shared.page_count.store(pgno, Ordering::SeqCst);
        Ok(())
    }

    pub fn page_count(&self) -> u32 {
        self.shared.page_count.load(Ordering::SeqCst)
    }

    /// Write back every cached page and fsync.
    pub fn close(&self) -> Result<(), BrambleError> {
        self.shared.cache.close(|page| {
            if page.is_dirty() {
                self.shared.write_page(page)?;
            }
            Ok(())
        })?;
        self.shared.file.lock().sync_data()?;
        Ok(())
    }
}

impl PagerShared {
    fn read_page(&self, pgno: u32) -> Result<Page, BrambleError> {
        let mut buf = vec![0u8; PAGE_SIZE].into_boxed_slice();
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(page_offset(pgno)))?;
        file.read_exact(&mut buf)?;
        Ok(Page::new(pgno, buf))
    }

    fn write_page(&self, page: &Page) -> Result<(), BrambleError> {
        let buf = page.lock();
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(page_offset(page.no())))?;
        file.write_all(&buf)?;
        file.sync_data()?;
        drop(file);
        drop(buf);
        page.set_dirty(false);
        Ok(())
    }

    fn release(&self, pgno: u32) -> Result<(), BrambleError> {
        self.cache.release(pgno as u64, |page| {
            if page.is_dirty() {
                self.write_page(page)?;
            }
            Ok(())
        })
    }
}
