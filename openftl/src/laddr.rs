//! Per-logical-address locking.
//!
//! Every request path that reads or mutates a logical address's mapping
//! holds that address's lock from pre-translation until the completion
//! handler releases it. Unrelated addresses are not serialized against each
//! other. The lock is a protocol lock, not a scoped guard: it is taken on
//! the submitting thread and released on whatever thread runs completion.

use std::collections::HashSet;
use std::sync::{Condvar, Mutex};

use crate::addr::Laddr;

pub struct AddrLockTable {
    locked: Mutex<HashSet<Laddr>>,
    released: Condvar,
}

impl AddrLockTable {
    pub fn new() -> AddrLockTable {
        AddrLockTable {
            locked: Mutex::new(HashSet::new()),
            released: Condvar::new(),
        }
    }

    /// Block until `laddr` is free, then take it.
    pub fn lock(&self, laddr: Laddr) {
        let mut set = self.locked.lock().expect("laddr lock table poisoned");
        while set.contains(&laddr) {
            set = self.released.wait(set).expect("laddr lock table poisoned");
        }
        set.insert(laddr);
    }

    /// Release `laddr` and wake any waiters.
    pub fn unlock(&self, laddr: Laddr) {
        let mut set = self.locked.lock().expect("laddr lock table poisoned");
        let was_held = set.remove(&laddr);
        if !was_held {
            log::error!("laddr {}: unlocked while not held", laddr);
            debug_assert!(was_held);
        }
        drop(set);
        self.released.notify_all();
    }

    pub fn is_locked(&self, laddr: Laddr) -> bool {
        self.locked
            .lock()
            .expect("laddr lock table poisoned")
            .contains(&laddr)
    }
}

impl Default for AddrLockTable {
    fn default() -> Self {
        Self::new()
    }
}
