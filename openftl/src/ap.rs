//! Append points and the physical-page allocator.
//!
//! Each pool carries one append point struct holding the user write cursor
//! and the GC write cursor. The pool reserve counts both, so `nr_aps` is
//! `2 * nr_pools`. The allocator policy tree lives here: try the current
//! block, then a fresh block, then (for GC callers only) the GC cursor.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::addr::{PageAddr, Paddr, LTOP_EMPTY};
use crate::ftl::Ftl;
use crate::request::Dir;

pub(crate) struct ApCursors {
    /// Current user write target.
    pub(crate) cur: Option<usize>,
    /// Current GC write target.
    pub(crate) gc_cur: Option<usize>,
}

/// The active write target(s) of one pool.
pub struct AppendPoint {
    id: usize,
    pool_id: usize,
    pub(crate) cursors: spin::Mutex<ApCursors>,
    /// Reads and writes submitted through this append point. Counting is
    /// semi-accurate; there is no lock around the increment.
    io_accesses: [AtomicU64; 2],
    pub(crate) t_read_us: u64,
    pub(crate) t_write_us: u64,
}

impl AppendPoint {
    pub(crate) fn new(id: usize, pool_id: usize, t_read_us: u64, t_write_us: u64) -> AppendPoint {
        AppendPoint {
            id,
            pool_id,
            cursors: spin::Mutex::new(ApCursors {
                cur: None,
                gc_cur: None,
            }),
            io_accesses: [AtomicU64::new(0), AtomicU64::new(0)],
            t_read_us,
            t_write_us,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn pool_id(&self) -> usize {
        self.pool_id
    }

    pub(crate) fn account(&self, dir: Dir) {
        self.io_accesses[dir.index()].fetch_add(1, Ordering::Relaxed);
    }

    /// `[reads, writes]` submitted through this append point.
    pub fn io_accesses(&self) -> [u64; 2] {
        [
            self.io_accesses[0].load(Ordering::Relaxed),
            self.io_accesses[1].load(Ordering::Relaxed),
        ]
    }

    pub fn current_block(&self) -> Option<usize> {
        self.cursors.lock().cur
    }

    pub fn gc_block(&self) -> Option<usize> {
        self.cursors.lock().gc_cur
    }
}

impl Ftl {
    /// Install `block_id` as the append point's current block. The outgoing
    /// block is expected to be full.
    pub(crate) fn set_ap_cur(&self, ap_id: usize, cursors: &mut ApCursors, block_id: usize) {
        if let Some(old) = cursors.cur {
            let old_block = &self.blocks[old];
            if !old_block.is_full(&self.geometry) {
                log::warn!(
                    "append point {}: replacing block {} before it is full",
                    ap_id,
                    old
                );
            }
            old_block.clear_owner_ap();
        }
        cursors.cur = Some(block_id);
        self.blocks[block_id].set_owner_ap(ap_id);
    }

    /// Allocate a physical page from an append point.
    ///
    /// User callers fail once the pool reserve is reached; GC callers fall
    /// back to the GC cursor and may take the last free block.
    pub(crate) fn alloc_from_ap(&self, ap_id: usize, is_gc: bool) -> Option<Box<PageAddr>> {
        let mut p = self.addr_pool.alloc()?;

        let ap = &self.aps[ap_id];
        let mut cursors = ap.cursors.lock();

        let mut p_block = cursors.cur;
        let mut p_addr = match p_block {
            Some(block_id) => self.alloc_phys_hooked(block_id),
            None => LTOP_EMPTY,
        };

        if p_addr == LTOP_EMPTY {
            match self.pool_get_block(ap.pool_id(), false) {
                Some(fresh) => {
                    self.set_ap_cur(ap_id, &mut cursors, fresh);
                    p_block = Some(fresh);
                    // A reset block always has a first page.
                    p_addr = self.alloc_phys_hooked(fresh);
                }
                None if is_gc => {
                    p_addr = match cursors.gc_cur {
                        Some(block_id) => self.alloc_phys_hooked(block_id),
                        None => LTOP_EMPTY,
                    };
                    if p_addr == LTOP_EMPTY {
                        let fresh = self.pool_get_block(ap.pool_id(), true);
                        // gc_cur records the acquisition outcome even when it
                        // failed; the success check comes after.
                        cursors.gc_cur = fresh;
                        match fresh {
                            Some(block_id) => {
                                self.blocks[block_id].set_owner_ap(ap_id);
                                p_addr = self.alloc_phys_hooked(block_id);
                            }
                            None => {
                                log::error!("ftl: no more blocks");
                                self.log_all_pools();
                            }
                        }
                    }
                    p_block = cursors.gc_cur;
                }
                None => {
                    // User writes fail here and are deferred upstream.
                }
            }
        }

        drop(cursors);

        if p_addr == LTOP_EMPTY {
            self.free_addr(p);
            return None;
        }
        if p_block.is_none() {
            log::warn!("ftl: allocated page {} without a backing block", p_addr);
            debug_assert!(!is_gc);
        }

        p.paddr = p_addr;
        p.block = p_block;
        p.private = None;
        Some(p)
    }

    /// Allocate from a block, notifying the placement policy on success.
    fn alloc_phys_hooked(&self, block_id: usize) -> Paddr {
        let addr = self.blocks[block_id].alloc_phys(&self.geometry, None);
        if addr != LTOP_EMPTY {
            if let Some(hook) = self.strategy.alloc_phys_addr {
                hook(self, block_id);
            }
        }
        addr
    }

    /// Next append point in global round-robin order.
    pub(crate) fn get_next_ap(&self) -> usize {
        self.next_ap.fetch_add(1, Ordering::Relaxed) % self.aps.len()
    }
}
