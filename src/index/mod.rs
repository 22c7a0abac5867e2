//! B+tree index over 64-bit keys, stored entirely in data items.
//!
//! The tree is reached through a boot item whose 8 bytes hold the current
//! root node's uid; re-rooting after a split rewrites those bytes, so the
//! boot uid handed out by [`BPlusTree::create`] stays valid forever. Node
//! mutations go through the data manager's before/after protocol under
//! `SUPER_XID`, which keeps the index crash-consistent without tying it to
//! any caller transaction.

mod node;

use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use parking_lot::Mutex;

pub use node::KEY_INF;

use crate::data::{DataManager, ItemHandle};
use crate::errors::BrambleError;
use crate::txn::SUPER_XID;

use node::{InsertOutcome, Node};

pub struct BPlusTree {
    dm: Arc<DataManager>,
    boot: ItemHandle,
    /// Guards the boot item's 8 bytes: root reads vs. re-rooting writes.
    boot_lock: Mutex<()>,
}

impl BPlusTree {
    /// Build an empty tree and return its boot uid, the only handle callers
    /// ever need to persist.
    pub fn create(dm: &DataManager) -> Result<u64, BrambleError> {
        let root_uid = dm.insert(SUPER_XID, &node::new_nil_root_raw())?;
        dm.insert(SUPER_XID, &root_uid.to_le_bytes())
    }

    /// Pin the boot item and hand out a live tree. The pin lasts as long as
    /// the tree, so drop the tree before closing the data manager.
    pub fn load(dm: Arc<DataManager>, boot_uid: u64) -> Result<Self, BrambleError> {
        let boot = dm
            .read(boot_uid)?
            .ok_or_else(|| BrambleError::Corrupt(format!("boot item {boot_uid:#x} missing")))?;
        Ok(Self {
            dm,
            boot,
            boot_lock: Mutex::new(()),
        })
    }

    fn root_uid(&self) -> u64 {
        let _boot = self.boot_lock.lock();
        LittleEndian::read_u64(&self.boot.data())
    }

    /// Swap in a new root above `left` and `right` and point the boot item
    /// at it. The only operation that moves the tree's entry point.
    fn update_root_uid(&self, left: u64, right: u64, key: i64) -> Result<(), BrambleError> {
        let _boot = self.boot_lock.lock();
        let new_root = self
            .dm
            .insert(SUPER_XID, &node::new_root_raw(left, right, key))?;
        let mut guard = self.boot.before();
        guard.set(&new_root.to_le_bytes())?;
        self.dm.after(SUPER_XID, guard)
    }

    pub fn search(&self, key: i64) -> Result<Vec<u64>, BrambleError> {
        self.search_range(key, key)
    }

    /// All payload uids for keys in `[lo, hi]`, in key order.
    pub fn search_range(&self, lo: i64, hi: i64) -> Result<Vec<u64>, BrambleError> {
        let mut leaf_uid = self.search_leaf(self.root_uid(), lo)?;
        let mut uids = Vec::new();
        loop {
            let leaf = Node::load(&self.dm, leaf_uid)?;
            let (mut found, sibling) = leaf.leaf_search_range(lo, hi);
            uids.append(&mut found);
            if sibling == 0 {
                return Ok(uids);
            }
            leaf_uid = sibling;
        }
    }

    pub fn insert(&self, key: i64, uid: u64) -> Result<(), BrambleError> {
        let root = self.root_uid();
        if let Some((new_son, new_key)) = self.insert_into(root, uid, key)? {
            self.update_root_uid(root, new_son, new_key)?;
        }
        Ok(())
    }

    fn search_leaf(&self, node_uid: u64, key: i64) -> Result<u64, BrambleError> {
        let is_leaf = Node::load(&self.dm, node_uid)?.is_leaf();
        if is_leaf {
            return Ok(node_uid);
        }
        let next = self.search_next(node_uid, key)?;
        self.search_leaf(next, key)
    }

    /// Route one level down from `node_uid`, chasing sibling pointers past
    /// concurrent splits until some node claims the key.
    fn search_next(&self, mut node_uid: u64, key: i64) -> Result<u64, BrambleError> {
        loop {
            let node = Node::load(&self.dm, node_uid)?;
            let (son, sibling) = node.search_next(key);
            if son != 0 {
                return Ok(son);
            }
            if sibling == 0 {
                return Err(BrambleError::Corrupt(format!(
                    "key {key} ran past the rightmost node {node_uid:#x}"
                )));
            }
            node_uid = sibling;
        }
    }

    /// Recursive insert. A `Some` return is a split the caller must file at
    /// its own level.
    fn insert_into(
        &self,
        node_uid: u64,
        uid: u64,
        key: i64,
    ) -> Result<Option<(u64, i64)>, BrambleError> {
        let is_leaf = Node::load(&self.dm, node_uid)?.is_leaf();
        if is_leaf {
            return self.insert_and_split(node_uid, uid, key);
        }
        let next = self.search_next(node_uid, key)?;
        match self.insert_into(next, uid, key)? {
            Some((new_son, new_key)) => self.insert_and_split(node_uid, new_son, new_key),
            None => Ok(None),
        }
    }

    fn insert_and_split(
        &self,
        mut node_uid: u64,
        uid: u64,
        key: i64,
    ) -> Result<Option<(u64, i64)>, BrambleError> {
        loop {
            let node = Node::load(&self.dm, node_uid)?;
            match node.insert_and_split(&self.dm, uid, key)? {
                InsertOutcome::TrySibling(sibling) => node_uid = sibling,
                InsertOutcome::Split { new_son, new_key } => {
                    return Ok(Some((new_son, new_key)))
                }
                InsertOutcome::Done => return Ok(None),
            }
        }
    }
}
