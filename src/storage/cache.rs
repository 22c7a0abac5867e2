//! Reference-counted resource cache keyed by u64.
//!
//! A slot stays resident while at least one holder has it pinned; the last
//! release runs the write-back hook and drops the slot. Concurrent `get`s for
//! the same key share a single load: the first caller marks the key in-flight
//! and loads outside the cache lock, the rest wait on a condvar.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::errors::BrambleError;

#[derive(Debug)]
struct Slot<T> {
    value: Arc<T>,
    refs: u32,
}

#[derive(Debug)]
struct State<T> {
    slots: HashMap<u64, Slot<T>>,
    loading: HashSet<u64>,
}

#[derive(Debug)]
pub(crate) struct RefCache<T> {
    /// Max resident slots; 0 means unbounded.
    capacity: usize,
    state: Mutex<State<T>>,
    loaded: Condvar,
}

impl<T> RefCache<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(State {
                slots: HashMap::new(),
                loading: HashSet::new(),
            }),
            loaded: Condvar::new(),
        }
    }

    /// Pin the resource under `key`, loading it with `load` on a miss.
    pub fn get<F>(&self, key: u64, load: F) -> Result<Arc<T>, BrambleError>
    where
        F: FnOnce() -> Result<T, BrambleError>,
    {
        let mut state = self.state.lock();
        loop {
            if let Some(slot) = state.slots.get_mut(&key) {
                slot.refs += 1;
                return Ok(slot.value.clone());
            }
            if state.loading.contains(&key) {
                self.loaded.wait(&mut state);
                continue;
            }
            break;
        }

        if self.capacity != 0 && state.slots.len() + state.loading.len() >= self.capacity {
            return Err(BrambleError::CacheFull);
        }
        state.loading.insert(key);
        drop(state);

        let loaded = load();

        let mut state = self.state.lock();
        state.loading.remove(&key);
        let value = match loaded {
            Ok(value) => Arc::new(value),
            Err(err) => {
                self.loaded.notify_all();
                return Err(err);
            }
        };
        state.slots.insert(
            key,
            Slot {
                value: value.clone(),
                refs: 1,
            },
        );
        self.loaded.notify_all();
        Ok(value)
    }

    /// Drop one pin. The last release runs `evict` (write-back) under the
    /// cache lock, so a concurrent `get` cannot reload the key mid-flush.
    pub fn release<F>(&self, key: u64, evict: F) -> Result<(), BrambleError>
    where
        F: FnOnce(&T) -> Result<(), BrambleError>,
    {
        let mut state = self.state.lock();
        let refs = match state.slots.get_mut(&key) {
            Some(slot) => {
                slot.refs -= 1;
                slot.refs
            }
            None => return Ok(()),
        };
        if refs > 0 {
            return Ok(());
        }
        let slot = state.slots.remove(&key).expect("slot present");
        evict(&slot.value)
    }

    /// Write back and drop every slot, pinned or not.
    pub fn close<F>(&self, mut evict: F) -> Result<(), BrambleError>
    where
        F: FnMut(&T) -> Result<(), BrambleError>,
    {
        let mut state = self.state.lock();
        let keys: Vec<u64> = state.slots.keys().copied().collect();
        for key in keys {
            let slot = state.slots.remove(&key).expect("slot present");
            evict(&slot.value)?;
        }
        Ok(())
    }

    #[cfg(test)]
    pub fn resident(&self) -> usize {
        self.state.lock().slots.len()
    }
}
