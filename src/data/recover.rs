//! Crash recovery: replay the WAL after an unclean shutdown.
//!
//! One pass collects every record and the highest page number any of them
//! touches; the data file is truncated there, dropping unlogged garbage
//! pages. Redo re-applies records of committed xids in log order; undo walks
//! each still-active xid backwards, tombstoning its inserts and restoring
//! pre-images, then marks the xid aborted.

use std::collections::HashMap;

use log::info;

use crate::data::records::LogRecord;
use crate::data::{item, DmShared};
use crate::errors::BrambleError;
use crate::storage::page::heap;
use crate::txn::Xid;

pub(crate) fn recover(shared: &DmShared) -> Result<(), BrambleError> {
    shared.logger.rewind();
    let mut records = Vec::new();
    let mut max_pgno = 1u32;
    while let Some(data) = shared.logger.next()? {
        let record = LogRecord::decode(&data)?;
        max_pgno = max_pgno.max(record.pgno());
        records.push(record);
    }
    shared.pager.truncate_by_pgno(max_pgno)?;
    info!(
        "recovery: {} log records, data file truncated to {max_pgno} pages",
        records.len()
    );

    redo(shared, &records)?;
    undo(shared, &records)?;
    Ok(())
}

fn redo(shared: &DmShared, records: &[LogRecord]) -> Result<(), BrambleError> {
    let mut applied = 0usize;
    for record in records {
        // Only committed work is re-applied. Aborted xids were already
        // reverted (by a VM-driven abort or an earlier recovery); redoing
        // them would resurrect their tombstoned inserts.
        if !shared.txns.is_committed(record.xid())? {
            continue;
        }
        match record {
            LogRecord::Insert {
                pgno, offset, raw, ..
            } => {
                let page = shared.pager.get_page(*pgno)?;
                let mut buf = page.lock();
                heap::recover_insert(&mut buf, raw, *offset)?;
                drop(buf);
                page.set_dirty(true);
            }
            LogRecord::Update { uid, new_raw, .. } => {
                let page = shared.pager.get_page(item::uid_pgno(*uid))?;
                let mut buf = page.lock();
                heap::recover_update(&mut buf, new_raw, item::uid_offset(*uid))?;
                drop(buf);
                page.set_dirty(true);
            }
        }
        applied += 1;
    }
    info!("recovery: redo applied {applied} records");
    Ok(())
}

fn undo(shared: &DmShared, records: &[LogRecord]) -> Result<(), BrambleError> {
    let mut by_xid: HashMap<Xid, Vec<&LogRecord>> = HashMap::new();
    for record in records {
        if shared.txns.is_active(record.xid())? {
            by_xid.entry(record.xid()).or_default().push(record);
        }
    }

    for (&xid, logs) in &by_xid {
        for record in logs.iter().rev() {
            match record {
                LogRecord::Insert {
                    pgno, offset, raw, ..
                } => {
                    // Re-apply the insert as a tombstone: the slot must stay
                    // occupied so the free offset keeps covering it.
                    let mut tomb = raw.clone();
                    tomb[item::OF_VALID] = item::RAW_INVALID;
                    let page = shared.pager.get_page(*pgno)?;
                    let mut buf = page.lock();
                    heap::recover_insert(&mut buf, &tomb, *offset)?;
                    drop(buf);
                    page.set_dirty(true);
                }
                LogRecord::Update { uid, old_raw, .. } => {
                    let page = shared.pager.get_page(item::uid_pgno(*uid))?;
                    let mut buf = page.lock();
                    heap::recover_update(&mut buf, old_raw, item::uid_offset(*uid))?;
                    drop(buf);
                    page.set_dirty(true);
                }
            }
        }
        shared.txns.abort(xid)?;
        info!("recovery: rolled back xid {xid}");
    }
    Ok(())
}
