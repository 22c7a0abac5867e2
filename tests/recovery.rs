//! Crash recovery end to end: redo of finished transactions, undo of
//! transactions still active at the crash, and the clean-shutdown witness.

use std::path::Path;
use std::sync::Arc;

use bramble::{DataManager, Options, TxnManager, SUPER_XID};
use tempfile::tempdir;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn create_engine(base: &Path) -> (Arc<TxnManager>, DataManager) {
    let txns = Arc::new(TxnManager::create(base).unwrap());
    let dm = DataManager::create(base, Options::default(), txns.clone()).unwrap();
    (txns, dm)
}

fn reopen_engine(base: &Path) -> (Arc<TxnManager>, DataManager) {
    let txns = Arc::new(TxnManager::open(base).unwrap());
    let dm = DataManager::open(base, Options::default(), txns.clone()).unwrap();
    (txns, dm)
}

#[test]
fn committed_insert_survives_crash() {
    init_logging();
    let tmp = tempdir().unwrap();
    let base = tmp.path().join("engine");

    let (txns, dm) = create_engine(&base);
    let xid = txns.begin().unwrap();
    let uid = dm.insert(xid, b"durable bytes").unwrap();
    txns.commit(xid).unwrap();
    drop(dm); // crash: no clean close, the witness stays open-stamped

    let (_txns, dm) = reopen_engine(&base);
    let item = dm.read(uid).unwrap().expect("committed insert must survive");
    assert_eq!(item.data(), b"durable bytes");
}

#[test]
fn uncommitted_insert_is_rolled_back() {
    init_logging();
    let tmp = tempdir().unwrap();
    let base = tmp.path().join("engine");

    let (txns, dm) = create_engine(&base);
    let xid = txns.begin().unwrap();
    let uid = dm.insert(xid, b"never committed").unwrap();
    drop(dm); // crash with xid still active

    let (txns, dm) = reopen_engine(&base);
    assert!(dm.read(uid).unwrap().is_none(), "insert must be tombstoned");
    assert!(txns.is_aborted(xid).unwrap());
}

#[test]
fn uncommitted_update_restores_the_preimage() {
    init_logging();
    let tmp = tempdir().unwrap();
    let base = tmp.path().join("engine");

    let (txns, dm) = create_engine(&base);
    let setup = txns.begin().unwrap();
    let uid = dm.insert(setup, b"original").unwrap();
    txns.commit(setup).unwrap();

    let xid = txns.begin().unwrap();
    {
        let item = dm.read(uid).unwrap().unwrap();
        let mut guard = item.before();
        guard.set(b"clobbere").unwrap();
        dm.after(xid, guard).unwrap();
    }
    drop(dm); // crash before commit

    let (_txns, dm) = reopen_engine(&base);
    let item = dm.read(uid).unwrap().unwrap();
    assert_eq!(item.data(), b"original");
}

#[test]
fn committed_update_is_redone() {
    init_logging();
    let tmp = tempdir().unwrap();
    let base = tmp.path().join("engine");

    let (txns, dm) = create_engine(&base);
    let setup = txns.begin().unwrap();
    let uid = dm.insert(setup, b"original").unwrap();
    txns.commit(setup).unwrap();

    let xid = txns.begin().unwrap();
    {
        let item = dm.read(uid).unwrap().unwrap();
        let mut guard = item.before();
        guard.set(b"replaced").unwrap();
        dm.after(xid, guard).unwrap();
    }
    txns.commit(xid).unwrap();
    drop(dm);

    let (_txns, dm) = reopen_engine(&base);
    let item = dm.read(uid).unwrap().unwrap();
    assert_eq!(item.data(), b"replaced");
}

#[test]
fn super_xid_mutations_never_undo() {
    init_logging();
    let tmp = tempdir().unwrap();
    let base = tmp.path().join("engine");

    let (_txns, dm) = create_engine(&base);
    let uid = dm.insert(SUPER_XID, b"index bytes").unwrap();
    drop(dm); // crash; SUPER_XID is always committed

    let (_txns, dm) = reopen_engine(&base);
    let item = dm.read(uid).unwrap().unwrap();
    assert_eq!(item.data(), b"index bytes");
}

#[test]
fn clean_close_skips_undo() {
    init_logging();
    let tmp = tempdir().unwrap();
    let base = tmp.path().join("engine");

    let (txns, dm) = create_engine(&base);
    let xid = txns.begin().unwrap();
    let uid = dm.insert(xid, b"still active").unwrap();
    txns.close().unwrap();
    dm.close().unwrap();

    // The witness is intact, so recovery does not run and the active xid's
    // work is left alone; its fate belongs to the version layer above.
    let (txns, dm) = reopen_engine(&base);
    assert!(txns.is_active(xid).unwrap());
    let item = dm.read(uid).unwrap().unwrap();
    assert_eq!(item.data(), b"still active");
}

#[test]
fn repeated_crashes_are_idempotent() {
    init_logging();
    let tmp = tempdir().unwrap();
    let base = tmp.path().join("engine");

    let (txns, dm) = create_engine(&base);
    let committed = txns.begin().unwrap();
    let keep = dm.insert(committed, b"keep").unwrap();
    txns.commit(committed).unwrap();
    let active = txns.begin().unwrap();
    let toss = dm.insert(active, b"toss").unwrap();
    drop(dm);

    for _ in 0..3 {
        let (_txns, dm) = reopen_engine(&base);
        assert_eq!(dm.read(keep).unwrap().unwrap().data(), b"keep");
        assert!(dm.read(toss).unwrap().is_none());
        drop(dm); // crash again without closing
    }
}
