//! Erase-block state and append semantics.
//!
//! A block hands out physical pages strictly in order through its append
//! cursor and tracks which of its pages have been superseded. While a block
//! is being filled it carries an in-memory write buffer; the buffer returns
//! to its pool once every page's device write has completed.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use crate::addr::{Paddr, LTOP_EMPTY};
use crate::config::FlashGeometry;

/// Sentinel for "no owning append point".
pub(crate) const NO_AP: usize = usize::MAX;

/// Predicate consulted before the append cursor crosses into a new flash
/// page; rejecting the candidate page fails the allocation (reserved pages).
pub type PageFilter<'a> = &'a dyn Fn(usize) -> bool;

struct BlockState {
    /// Flash-page cursor.
    next_page: usize,
    /// Sub-page cursor in `[0, host_pages_in_flash_page)`.
    next_offset: usize,
    /// One bit per host page in the block.
    invalid: Box<[u64]>,
    nr_invalid: usize,
}

impl BlockState {
    fn pages_in_use(&self, geo: &FlashGeometry) -> usize {
        self.next_page * geo.host_pages_in_flash_page + self.next_offset
    }

    fn is_full(&self, geo: &FlashGeometry) -> bool {
        self.pages_in_use(geo) == geo.nr_host_pages_in_blk()
    }
}

/// One erase unit.
pub struct Block {
    id: usize,
    pool_id: usize,
    state: spin::Mutex<BlockState>,
    /// Set by the GC while this block's pages are being copied forward.
    gc_running: AtomicBool,
    /// Host pages copied into the write buffer.
    data_size: AtomicU32,
    /// Host pages whose device write has completed.
    data_cmnt_size: AtomicU32,
    owner_ap: AtomicUsize,
    buf: spin::Mutex<Option<Box<[u8]>>>,
}

impl Block {
    pub(crate) fn new(id: usize, pool_id: usize, geo: &FlashGeometry) -> Block {
        let words = (geo.nr_host_pages_in_blk() + 63) / 64;
        Block {
            id,
            pool_id,
            state: spin::Mutex::new(BlockState {
                next_page: 0,
                next_offset: 0,
                invalid: vec![0u64; words].into_boxed_slice(),
                nr_invalid: 0,
            }),
            gc_running: AtomicBool::new(false),
            data_size: AtomicU32::new(0),
            data_cmnt_size: AtomicU32::new(0),
            owner_ap: AtomicUsize::new(NO_AP),
            buf: spin::Mutex::new(None),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn pool_id(&self) -> usize {
        self.pool_id
    }

    /// Hand out the next physical host page, or `LTOP_EMPTY` if the block is
    /// full or `filter` rejects the flash page the cursor would move into.
    pub fn alloc_phys(&self, geo: &FlashGeometry, filter: Option<PageFilter<'_>>) -> Paddr {
        let mut state = self.state.lock();

        if state.is_full(geo) {
            return LTOP_EMPTY;
        }

        // Multiple host pages share a flash page; only advance to the next
        // flash page once the current one is fully handed out.
        if state.next_offset == geo.host_pages_in_flash_page {
            if let Some(filter) = filter {
                if !filter(state.next_page + 1) {
                    return LTOP_EMPTY;
                }
            }
            state.next_offset = 0;
            state.next_page += 1;
        }

        let addr = geo.block_base(self.id)
            + (state.next_page * geo.host_pages_in_flash_page + state.next_offset) as Paddr;
        state.next_offset += 1;
        addr
    }

    pub fn is_full(&self, geo: &FlashGeometry) -> bool {
        self.state.lock().is_full(geo)
    }

    /// Physical pages handed out so far.
    pub fn pages_in_use(&self, geo: &FlashGeometry) -> usize {
        self.state.lock().pages_in_use(geo)
    }

    /// Mark one page offset invalid. Double invalidation indicates a map
    /// update bug; it is reported and not counted twice.
    pub(crate) fn invalidate(&self, geo: &FlashGeometry, page_offset: usize) {
        debug_assert!(page_offset < geo.nr_host_pages_in_blk());
        let mut state = self.state.lock();
        let word = page_offset / 64;
        let bit = 1u64 << (page_offset % 64);
        if state.invalid[word] & bit != 0 {
            log::warn!("block {}: page offset {} invalidated twice", self.id, page_offset);
            return;
        }
        state.invalid[word] |= bit;
        state.nr_invalid += 1;
    }

    pub fn nr_invalid_pages(&self) -> usize {
        self.state.lock().nr_invalid
    }

    pub fn is_page_invalid(&self, page_offset: usize) -> bool {
        let state = self.state.lock();
        state.invalid[page_offset / 64] & (1u64 << (page_offset % 64)) != 0
    }

    /// Popcount of the invalid bitmap; equal to `nr_invalid_pages` unless a
    /// double invalidation was tolerated.
    pub fn invalid_popcount(&self) -> usize {
        let state = self.state.lock();
        state.invalid.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Return the block to its pristine state. The caller has already taken
    /// the block off the free list, so it is not reachable from an append
    /// point while this runs.
    pub(crate) fn reset(&self) {
        let mut state = self.state.lock();
        for word in state.invalid.iter_mut() {
            *word = 0;
        }
        state.next_page = 0;
        state.next_offset = 0;
        state.nr_invalid = 0;
        self.owner_ap.store(NO_AP, Ordering::Relaxed);
        self.gc_running.store(false, Ordering::Relaxed);
        self.data_size.store(0, Ordering::Relaxed);
        self.data_cmnt_size.store(0, Ordering::Relaxed);
    }

    pub fn gc_running(&self) -> bool {
        self.gc_running.load(Ordering::Acquire)
    }

    pub(crate) fn set_gc_running(&self, running: bool) {
        self.gc_running.store(running, Ordering::Release);
    }

    /// The append point currently writing into this block, if any.
    pub fn owner_ap(&self) -> Option<usize> {
        match self.owner_ap.load(Ordering::Relaxed) {
            NO_AP => None,
            ap => Some(ap),
        }
    }

    pub(crate) fn set_owner_ap(&self, ap: usize) {
        self.owner_ap.store(ap, Ordering::Relaxed);
    }

    pub(crate) fn clear_owner_ap(&self) {
        self.owner_ap.store(NO_AP, Ordering::Relaxed);
    }

    pub(crate) fn attach_buf(&self, buf: Box<[u8]>) {
        *self.buf.lock() = Some(buf);
    }

    pub(crate) fn take_buf(&self) -> Option<Box<[u8]>> {
        self.buf.lock().take()
    }

    /// Copy one host page into the write buffer slot for `paddr` and return
    /// the post-increment count of buffered pages.
    pub(crate) fn buffer_page(&self, geo: &FlashGeometry, slot: usize, src: &[u8]) -> u32 {
        let page_size = geo.host_page_size();
        let mut buf = self.buf.lock();
        match buf.as_mut() {
            Some(buf) => {
                let off = slot * page_size;
                let len = src.len().min(page_size);
                buf[off..off + len].copy_from_slice(&src[..len]);
            }
            None => {
                log::error!("block {}: write with no buffer attached", self.id);
                debug_assert!(false);
            }
        }
        drop(buf);
        self.data_size.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Copy `count` consecutive buffer slots starting at `first_slot`,
    /// forming the payload of one flash-page device write.
    pub(crate) fn copy_buf_slots(
        &self,
        geo: &FlashGeometry,
        first_slot: usize,
        count: usize,
    ) -> Vec<u8> {
        let page_size = geo.host_page_size();
        let buf = self.buf.lock();
        match buf.as_ref() {
            Some(buf) => {
                let off = first_slot * page_size;
                buf[off..off + count * page_size].to_vec()
            }
            None => {
                log::error!("block {}: packing with no buffer attached", self.id);
                debug_assert!(false);
                vec![0u8; count * page_size]
            }
        }
    }

    pub fn data_size(&self) -> u32 {
        self.data_size.load(Ordering::Acquire)
    }

    pub fn data_cmnt_size(&self) -> u32 {
        self.data_cmnt_size.load(Ordering::Acquire)
    }

    /// Account one completed device write; returns the new commit count.
    pub(crate) fn commit_page(&self) -> u32 {
        self.data_cmnt_size.fetch_add(1, Ordering::AcqRel) + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geo() -> FlashGeometry {
        FlashGeometry {
            nr_pools: 1,
            blocks_per_pool: 2,
            flash_pages_per_blk: 2,
            host_pages_in_flash_page: 2,
            sectors_per_host_page: 1,
        }
    }

    #[test]
    fn append_addresses_are_strictly_increasing() {
        let g = geo();
        let block = Block::new(1, 0, &g);
        let base = g.block_base(1);
        let mut last = None;
        for i in 0..g.nr_host_pages_in_blk() {
            let addr = block.alloc_phys(&g, None);
            assert_eq!(addr, base + i as u64);
            if let Some(prev) = last {
                assert!(addr > prev);
            }
            last = Some(addr);
        }
        assert!(block.is_full(&g));
        assert_eq!(block.alloc_phys(&g, None), LTOP_EMPTY);
    }

    #[test]
    fn cursor_invariant_matches_pages_handed_out() {
        let g = geo();
        let block = Block::new(0, 0, &g);
        for handed in 1..=3 {
            block.alloc_phys(&g, None);
            assert_eq!(block.pages_in_use(&g), handed);
        }
    }

    #[test]
    fn filter_rejects_crossing_into_reserved_page() {
        let g = geo();
        let block = Block::new(0, 0, &g);
        let reject_page_1 = |page: usize| page != 1;

        // First flash page fills normally.
        assert_ne!(block.alloc_phys(&g, Some(&reject_page_1)), LTOP_EMPTY);
        assert_ne!(block.alloc_phys(&g, Some(&reject_page_1)), LTOP_EMPTY);
        // Crossing into flash page 1 is rejected.
        assert_eq!(block.alloc_phys(&g, Some(&reject_page_1)), LTOP_EMPTY);
        // Without the filter the cursor advances.
        assert_ne!(block.alloc_phys(&g, None), LTOP_EMPTY);
    }

    #[test]
    fn double_invalidation_is_counted_once() {
        let g = geo();
        let block = Block::new(0, 0, &g);
        block.invalidate(&g, 2);
        block.invalidate(&g, 2);
        assert_eq!(block.nr_invalid_pages(), 1);
        assert_eq!(block.invalid_popcount(), 1);
        assert!(block.is_page_invalid(2));
    }

    #[test]
    fn reset_clears_everything() {
        let g = geo();
        let block = Block::new(0, 0, &g);
        block.alloc_phys(&g, None);
        block.invalidate(&g, 0);
        block.set_owner_ap(3);
        block.set_gc_running(true);
        block.commit_page();

        block.reset();
        assert_eq!(block.pages_in_use(&g), 0);
        assert_eq!(block.nr_invalid_pages(), 0);
        assert_eq!(block.owner_ap(), None);
        assert!(!block.gc_running());
        assert_eq!(block.data_cmnt_size(), 0);
    }
}
