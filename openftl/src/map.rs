//! Logical-to-physical translation tables.
//!
//! The forward tables (primary plus the GC shadow) map logical pages to
//! physical pages; the reverse table maps physical pages back, remembering
//! which forward table owns the mapping. All updates happen under the
//! reverse-map lock: the previous mapping is invalidated and poisoned in the
//! same critical section that installs the new one, so any reader that
//! observes a forward entry finds a reverse entry that agrees, and the
//! superseded page is counted invalid exactly once.
//!
//! Entries are atomic words; forward entries for one logical address are
//! only read or written while that address's lock is held, which makes the
//! paired loads consistent.

use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};

use crate::addr::{Laddr, MapKind, PageAddr, Paddr, LTOP_POISON};
use crate::block::Block;
use crate::config::FlashGeometry;
use crate::ftl::Ftl;

/// Forward entry: physical page plus owning block (`0` encodes "none").
struct MapEntry {
    paddr: AtomicU64,
    block: AtomicUsize,
}

impl MapEntry {
    fn empty() -> MapEntry {
        MapEntry {
            paddr: AtomicU64::new(0),
            block: AtomicUsize::new(0),
        }
    }
}

/// Reverse entry: logical address (or `LTOP_POISON`) plus the owning table.
struct RevEntry {
    laddr: AtomicU64,
    map: AtomicU8,
}

pub struct TransTables {
    primary: Box<[MapEntry]>,
    shadow: Box<[MapEntry]>,
    rev: Box<[RevEntry]>,
    rev_lock: spin::Mutex<()>,
}

impl TransTables {
    pub(crate) fn new(nr_pages: usize) -> TransTables {
        let mk_forward = || {
            (0..nr_pages)
                .map(|_| MapEntry::empty())
                .collect::<Vec<_>>()
                .into_boxed_slice()
        };
        let rev = (0..nr_pages)
            .map(|_| RevEntry {
                laddr: AtomicU64::new(LTOP_POISON),
                map: AtomicU8::new(MapKind::Primary.as_u8()),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        TransTables {
            primary: mk_forward(),
            shadow: mk_forward(),
            rev,
            rev_lock: spin::Mutex::new(()),
        }
    }

    fn table(&self, kind: MapKind) -> &[MapEntry] {
        match kind {
            MapKind::Primary => &self.primary,
            MapKind::Shadow => &self.shadow,
        }
    }

    /// Read a forward entry. Callers hold the logical address lock.
    pub(crate) fn get(&self, kind: MapKind, laddr: Laddr) -> (Paddr, Option<usize>) {
        let entry = &self.table(kind)[laddr as usize];
        let block = entry.block.load(Ordering::Acquire);
        let paddr = entry.paddr.load(Ordering::Acquire);
        let block = if block == 0 { None } else { Some(block - 1) };
        (paddr, block)
    }

    /// Read a reverse entry.
    pub(crate) fn rev_get(&self, paddr: Paddr) -> (u64, MapKind) {
        let entry = &self.rev[paddr as usize];
        (
            entry.laddr.load(Ordering::Acquire),
            MapKind::from_u8(entry.map.load(Ordering::Acquire)),
        )
    }

    /// Install `laddr -> p` in `kind`, invalidating and poisoning the
    /// previous mapping in the same critical section.
    pub(crate) fn update(
        &self,
        geo: &FlashGeometry,
        blocks: &[Block],
        laddr: Laddr,
        p: &PageAddr,
        kind: MapKind,
    ) {
        if laddr >= geo.nr_pages() || p.paddr >= geo.nr_pages() {
            log::error!("map update out of range: laddr {} -> paddr {}", laddr, p.paddr);
            debug_assert!(false);
            return;
        }

        let _rev = self.rev_lock.lock();

        let (old_paddr, old_block) = self.get(kind, laddr);
        if let Some(old_block) = old_block {
            invalidate_page(geo, &blocks[old_block], old_paddr);
            self.rev[old_paddr as usize]
                .laddr
                .store(LTOP_POISON, Ordering::Release);
        }

        let entry = &self.table(kind)[laddr as usize];
        entry.paddr.store(p.paddr, Ordering::Release);
        entry
            .block
            .store(p.block.map_or(0, |b| b + 1), Ordering::Release);

        let rev = &self.rev[p.paddr as usize];
        rev.laddr.store(laddr, Ordering::Release);
        rev.map.store(kind.as_u8(), Ordering::Release);
    }
}

/// Mark the page behind a physical address invalid in its block's bitmap.
pub(crate) fn invalidate_page(geo: &FlashGeometry, block: &Block, paddr: Paddr) {
    let offset = (paddr % geo.nr_host_pages_in_blk() as u64) as usize;
    block.invalidate(geo, offset);
}

impl Ftl {
    /// Copy a forward entry into a fresh address record.
    ///
    /// Fails (caller defers) when the address-record pool is exhausted or
    /// the backing block is being copied by the GC; an unmapped address
    /// yields a record with no block, which the read path zero-fills.
    pub(crate) fn lookup_map(&self, laddr: Laddr, kind: MapKind) -> Option<Box<PageAddr>> {
        debug_assert!(laddr < self.geometry.nr_pages());
        let mut p = self.addr_pool.alloc()?;
        let (paddr, block) = self.maps.get(kind, laddr);

        if let Some(block_id) = block {
            // The mapping is about to move; reads must wait for the copy.
            if self.blocks[block_id].gc_running() {
                self.free_addr(p);
                return None;
            }
        }

        p.paddr = paddr;
        p.block = block;
        p.private = None;
        Some(p)
    }

    /// Install a new mapping, invalidating the previous one.
    pub(crate) fn update_map(&self, laddr: Laddr, p: &PageAddr, kind: MapKind) {
        self.maps.update(&self.geometry, &self.blocks, laddr, p, kind);
    }

    /// Return an address record to its pool.
    pub(crate) fn free_addr(&self, mut p: Box<PageAddr>) {
        p.reset();
        self.addr_pool.free(p);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geo() -> FlashGeometry {
        FlashGeometry {
            nr_pools: 1,
            blocks_per_pool: 2,
            flash_pages_per_blk: 4,
            host_pages_in_flash_page: 1,
            sectors_per_host_page: 1,
        }
    }

    fn blocks(geo: &FlashGeometry) -> Vec<Block> {
        (0..geo.nr_blocks()).map(|id| Block::new(id, 0, geo)).collect()
    }

    fn page(paddr: Paddr, block: usize) -> PageAddr {
        PageAddr {
            paddr,
            block: Some(block),
            private: None,
        }
    }

    #[test]
    fn first_mapping_installs_forward_and_reverse() {
        let geo = geo();
        let blocks = blocks(&geo);
        let maps = TransTables::new(geo.nr_pages() as usize);

        maps.update(&geo, &blocks, 7, &page(0, 0), MapKind::Primary);
        assert_eq!(maps.get(MapKind::Primary, 7), (0, Some(0)));
        assert_eq!(maps.rev_get(0), (7, MapKind::Primary));
        assert_eq!(blocks[0].nr_invalid_pages(), 0);
    }

    #[test]
    fn remap_invalidates_and_poisons_previous_page() {
        let geo = geo();
        let blocks = blocks(&geo);
        let maps = TransTables::new(geo.nr_pages() as usize);

        maps.update(&geo, &blocks, 7, &page(0, 0), MapKind::Primary);
        maps.update(&geo, &blocks, 7, &page(1, 0), MapKind::Primary);

        assert_eq!(maps.get(MapKind::Primary, 7), (1, Some(0)));
        assert_eq!(maps.rev_get(0).0, LTOP_POISON);
        assert_eq!(maps.rev_get(1), (7, MapKind::Primary));
        assert_eq!(blocks[0].nr_invalid_pages(), 1);
        assert!(blocks[0].is_page_invalid(0));
    }

    #[test]
    fn shadow_mappings_are_tracked_separately() {
        let geo = geo();
        let blocks = blocks(&geo);
        let maps = TransTables::new(geo.nr_pages() as usize);

        maps.update(&geo, &blocks, 3, &page(2, 0), MapKind::Primary);
        maps.update(&geo, &blocks, 3, &page(5, 1), MapKind::Shadow);

        // The primary mapping is untouched; paddr 2 stays valid.
        assert_eq!(maps.get(MapKind::Primary, 3), (2, Some(0)));
        assert_eq!(maps.get(MapKind::Shadow, 3), (5, Some(1)));
        assert_eq!(maps.rev_get(5), (3, MapKind::Shadow));
        assert_eq!(blocks[0].nr_invalid_pages(), 0);
    }

    #[test]
    fn unmapped_entries_read_back_empty() {
        let geo = geo();
        let maps = TransTables::new(geo.nr_pages() as usize);
        assert_eq!(maps.get(MapKind::Primary, 0), (0, None));
        assert_eq!(maps.rev_get(0).0, LTOP_POISON);
    }
}
