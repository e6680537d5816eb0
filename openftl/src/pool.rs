//! Block pools: inventory lists and serialization state.
//!
//! Each block sits on exactly one of three lists. A freshly taken block goes
//! to the tail of the used list, so the head of that list is the oldest
//! block and the likeliest GC victim. A freed block goes to the tail of the
//! free list, so freed blocks are not immediately reused (naive round-robin
//! wear-leveling). Fully committed blocks move to the priority list, where
//! the GC picks victims.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::request::DeviceRequest;

/// Why `take_free` refused to hand out a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GetBlockError {
    /// The free list is empty.
    Empty,
    /// The reserve of one free block per append point would be violated;
    /// only GC allocations may dig into it.
    Reserved,
}

struct PoolLists {
    free: VecDeque<usize>,
    used: VecDeque<usize>,
    prio: VecDeque<usize>,
}

/// State of the per-pool strict submission ordering.
pub(crate) struct WaitingQueue {
    pub(crate) queue: VecDeque<DeviceRequest>,
    /// Serial of the request currently at the device, if any.
    pub(crate) cur_bio: Option<u64>,
}

/// A group of erase blocks sharing scheduling and serialization state.
pub struct Pool {
    id: usize,
    lists: spin::Mutex<PoolLists>,
    /// Mirror of `|free|`, readable without the list lock (estimates only).
    nr_free_blocks: AtomicUsize,
    pub(crate) waiting: spin::Mutex<WaitingQueue>,
    /// Submission baton: 0 when no one is driving the waiting queue.
    pub(crate) is_active: AtomicUsize,
}

impl Pool {
    pub(crate) fn new(id: usize, block_ids: impl Iterator<Item = usize>) -> Pool {
        let free: VecDeque<usize> = block_ids.collect();
        let nr_free = free.len();
        Pool {
            id,
            lists: spin::Mutex::new(PoolLists {
                free,
                used: VecDeque::new(),
                prio: VecDeque::new(),
            }),
            nr_free_blocks: AtomicUsize::new(nr_free),
            waiting: spin::Mutex::new(WaitingQueue {
                queue: VecDeque::new(),
                cur_bio: None,
            }),
            is_active: AtomicUsize::new(0),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn nr_free_blocks(&self) -> usize {
        self.nr_free_blocks.load(Ordering::Relaxed)
    }

    /// Move the head of the free list to the tail of the used list.
    ///
    /// Non-GC callers are refused once the free count drops below the
    /// append-point reserve, so the GC always has room to make progress.
    pub(crate) fn take_free(&self, is_gc: bool, nr_aps: usize) -> Result<usize, GetBlockError> {
        let mut lists = self.lists.lock();
        if lists.free.is_empty() {
            return Err(GetBlockError::Empty);
        }
        if !is_gc && self.nr_free_blocks.load(Ordering::Relaxed) < nr_aps {
            return Err(GetBlockError::Reserved);
        }
        let Some(block_id) = lists.free.pop_front() else {
            return Err(GetBlockError::Empty);
        };
        lists.used.push_back(block_id);
        self.nr_free_blocks.fetch_sub(1, Ordering::Relaxed);
        Ok(block_id)
    }

    /// Return a block to the free-list tail. All valid pages must already
    /// have been migrated elsewhere.
    pub(crate) fn put_free(&self, block_id: usize) {
        let mut lists = self.lists.lock();
        let removed = remove_from(&mut lists.used, block_id) || remove_from(&mut lists.prio, block_id);
        if !removed {
            log::warn!("pool {}: block {} freed while not in use", self.id, block_id);
        }
        lists.free.push_back(block_id);
        self.nr_free_blocks.fetch_add(1, Ordering::Relaxed);
    }

    /// Move a fully committed block from the used list to the priority list;
    /// it is now a GC candidate.
    pub(crate) fn move_to_prio(&self, block_id: usize) {
        let mut lists = self.lists.lock();
        if !remove_from(&mut lists.used, block_id) {
            log::warn!("pool {}: block {} promoted while not on used list", self.id, block_id);
        }
        lists.prio.push_back(block_id);
    }

    /// Head of the priority list (the oldest full block).
    pub fn prio_head(&self) -> Option<usize> {
        self.lists.lock().prio.front().copied()
    }

    /// `(free, used, prio)` counts.
    pub fn list_counts(&self) -> (usize, usize, usize) {
        let lists = self.lists.lock();
        (lists.free.len(), lists.used.len(), lists.prio.len())
    }

    /// Snapshot of the three lists, for diagnostics and invariant checks.
    pub fn list_snapshot(&self) -> (Vec<usize>, Vec<usize>, Vec<usize>) {
        let lists = self.lists.lock();
        (
            lists.free.iter().copied().collect(),
            lists.used.iter().copied().collect(),
            lists.prio.iter().copied().collect(),
        )
    }

    pub(crate) fn waiting_len(&self) -> usize {
        self.waiting.lock().queue.len()
    }

    /// Serial of the request currently at the device under serialization.
    pub fn current_serial(&self) -> Option<u64> {
        self.waiting.lock().cur_bio
    }

    /// Whether a submitter currently holds the serialization baton.
    pub fn serialize_active(&self) -> bool {
        self.is_active.load(Ordering::Acquire) != 0
    }
}

fn remove_from(list: &mut VecDeque<usize>, block_id: usize) -> bool {
    if let Some(pos) = list.iter().position(|&id| id == block_id) {
        list.remove(pos);
        true
    } else {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_moves_head_to_used_tail() {
        let pool = Pool::new(0, 0..4);
        assert_eq!(pool.take_free(false, 1), Ok(0));
        assert_eq!(pool.take_free(false, 1), Ok(1));
        let (free, used, _) = pool.list_snapshot();
        assert_eq!(free, vec![2, 3]);
        assert_eq!(used, vec![0, 1]);
        assert_eq!(pool.nr_free_blocks(), 2);
    }

    #[test]
    fn reserve_blocks_user_but_not_gc() {
        let pool = Pool::new(0, 0..2);
        // Reserve of 2: one free block per append point.
        assert_eq!(pool.take_free(false, 2), Err(GetBlockError::Reserved));
        // GC bypasses the reserve whenever anything is free.
        assert_eq!(pool.take_free(true, 2), Ok(0));
        assert_eq!(pool.take_free(true, 2), Ok(1));
        assert_eq!(pool.take_free(true, 2), Err(GetBlockError::Empty));
    }

    #[test]
    fn freed_blocks_go_to_the_tail() {
        let pool = Pool::new(0, 0..3);
        let a = pool.take_free(true, 1).unwrap();
        pool.put_free(a);
        let (free, _, _) = pool.list_snapshot();
        assert_eq!(free, vec![1, 2, 0]);
    }

    #[test]
    fn full_blocks_move_to_prio() {
        let pool = Pool::new(0, 0..2);
        let a = pool.take_free(true, 1).unwrap();
        pool.move_to_prio(a);
        let (free, used, prio) = pool.list_snapshot();
        assert_eq!(free, vec![1]);
        assert!(used.is_empty());
        assert_eq!(prio, vec![a]);
        assert_eq!(pool.prio_head(), Some(a));

        // And back to free after the GC reclaims it.
        pool.put_free(a);
        let (free, _, prio) = pool.list_snapshot();
        assert_eq!(free, vec![1, 0]);
        assert!(prio.is_empty());
    }
}
