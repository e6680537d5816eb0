//! The FTL aggregate: arenas, translation state, workers, and the surfaces
//! exposed to the block layer above, the device below, and the GC beside it.
//!
//! Ownership is a strict tree: the FTL owns the pools, blocks and append
//! points as arenas; every cross-reference (block to pool, block to append
//! point, context to append point) is an index into those arenas, so there
//! are no reference cycles to manage.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use crate::addr::{Laddr, MapKind, Paddr, PageAddr, PolicyPrivate};
use crate::ap::AppendPoint;
use crate::block::Block;
use crate::config::{ConfigError, FlashGeometry, FtlConfig, FtlOpts};
use crate::defer::DeferredRequest;
use crate::device::{DeviceError, FlashDevice};
use crate::laddr::AddrLockTable;
use crate::map::{invalidate_page, TransTables};
use crate::mempool::{ObjectPool, PagePool};
use crate::pool::{GetBlockError, Pool};
use crate::request::{Disposition, IoRequest, RequestCtx, SyncCompletion, WriteOutcome};
use crate::strategy::Strategy;
use crate::workqueue::{Work, Workqueue};

/// One user write append point and one GC append point per pool; the pool
/// reserve keeps a free block for each.
const APS_PER_POOL: usize = 2;

/// Errors surfaced while bringing the FTL up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitError {
    BadGeometry(ConfigError),
    /// The device exposes fewer pages than the geometry describes.
    DeviceTooSmall,
    /// A pool could not prime its append point cursors.
    NotEnoughBlocks,
}

impl fmt::Display for InitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InitError::BadGeometry(e) => write!(f, "bad geometry: {}", e),
            InitError::DeviceTooSmall => write!(f, "device smaller than geometry"),
            InitError::NotEnoughBlocks => write!(f, "not enough blocks to prime append points"),
        }
    }
}

impl From<ConfigError> for InitError {
    fn from(e: ConfigError) -> InitError {
        InitError::BadGeometry(e)
    }
}

/// The flash translation layer core.
pub struct Ftl {
    pub(crate) geometry: FlashGeometry,
    pub(crate) opts: FtlOpts,
    /// Append points counted by the pool reserve (`APS_PER_POOL * nr_pools`).
    pub(crate) nr_aps: usize,
    pub(crate) device: Arc<dyn FlashDevice>,
    pub(crate) strategy: Strategy,

    pub(crate) blocks: Box<[Block]>,
    pub(crate) pools: Box<[Pool]>,
    pub(crate) aps: Box<[AppendPoint]>,
    pub(crate) maps: TransTables,
    pub(crate) laddr_locks: AddrLockTable,

    pub(crate) ctx_pool: ObjectPool<RequestCtx>,
    pub(crate) addr_pool: ObjectPool<PageAddr>,
    pub(crate) buf_pool: PagePool,

    pub(crate) deferred: spin::Mutex<VecDeque<DeferredRequest>>,
    pub(crate) deferred_work: Arc<Work>,
    pub(crate) waiting_works: Box<[Arc<Work>]>,
    /// Drives the per-pool waiting queues.
    pub(crate) wq_biod: Workqueue,
    /// Drives deferred resubmission. Separate from `wq_biod`: resubmission
    /// blocks on logical address locks whose release needs the waiting
    /// worker to keep running.
    pub(crate) wq_deferred: Workqueue,

    pub(crate) next_ap: AtomicUsize,
    pub(crate) next_serial: AtomicU64,
    pub(crate) gc_notifier: spin::Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
    pub(crate) gc_kicks: AtomicU64,
    exhausted_events: AtomicU64,
}

impl Ftl {
    /// Bring up an FTL with the default strategy.
    pub fn new(config: FtlConfig, device: Arc<dyn FlashDevice>) -> Result<Arc<Ftl>, InitError> {
        Ftl::with_strategy(config, device, Strategy::default())
    }

    /// Bring up an FTL with a custom policy record.
    pub fn with_strategy(
        config: FtlConfig,
        device: Arc<dyn FlashDevice>,
        strategy: Strategy,
    ) -> Result<Arc<Ftl>, InitError> {
        let geometry = config.geometry;
        geometry.validate()?;
        if device.nr_host_pages() < geometry.nr_pages() {
            return Err(InitError::DeviceTooSmall);
        }

        let nr_pools = geometry.nr_pools;
        let blocks_per_pool = geometry.blocks_per_pool;

        let blocks: Box<[Block]> = (0..geometry.nr_blocks())
            .map(|id| Block::new(id, id / blocks_per_pool, &geometry))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let pools: Box<[Pool]> = (0..nr_pools)
            .map(|id| Pool::new(id, id * blocks_per_pool..(id + 1) * blocks_per_pool))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let aps: Box<[AppendPoint]> = (0..nr_pools)
            .map(|id| AppendPoint::new(id, id, config.t_read_us, config.t_write_us))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        let ftl = Arc::new_cyclic(|weak: &Weak<Ftl>| {
            let deferred_work = {
                let weak = weak.clone();
                Work::new(
                    move || {
                        if let Some(ftl) = weak.upgrade() {
                            ftl.drain_deferred();
                        }
                    },
                    "ftl_deferred",
                )
            };
            let waiting_works: Box<[Arc<Work>]> = (0..nr_pools)
                .map(|pool_id| {
                    let weak = weak.clone();
                    Work::new(
                        move || {
                            if let Some(ftl) = weak.upgrade() {
                                ftl.run_pool_waiting(pool_id);
                            }
                        },
                        "ftl_pool_waiting",
                    )
                })
                .collect::<Vec<_>>()
                .into_boxed_slice();

            Ftl {
                geometry,
                opts: config.opts,
                nr_aps: APS_PER_POOL * nr_pools,
                device,
                strategy,
                blocks,
                pools,
                aps,
                maps: TransTables::new(geometry.nr_pages() as usize),
                laddr_locks: AddrLockTable::new(),
                ctx_pool: ObjectPool::new(config.ctx_pool_size, RequestCtx::idle),
                addr_pool: ObjectPool::new(config.addr_pool_size, PageAddr::idle),
                buf_pool: PagePool::new(
                    config.buf_pool_size,
                    geometry.nr_host_pages_in_blk() * geometry.host_page_size(),
                ),
                deferred: spin::Mutex::new(VecDeque::new()),
                deferred_work,
                waiting_works,
                wq_biod: Workqueue::new("openftl-biod"),
                wq_deferred: Workqueue::new("openftl-deferred"),
                next_ap: AtomicUsize::new(0),
                next_serial: AtomicU64::new(0),
                gc_notifier: spin::Mutex::new(None),
                gc_kicks: AtomicU64::new(0),
                exhausted_events: AtomicU64::new(0),
            }
        });

        // Prime both cursors of every append point. The reserve does not
        // apply before the device serves traffic.
        for pool_id in 0..nr_pools {
            let cur = ftl
                .pool_get_block(pool_id, true)
                .ok_or(InitError::NotEnoughBlocks)?;
            let gc_cur = ftl
                .pool_get_block(pool_id, true)
                .ok_or(InitError::NotEnoughBlocks)?;
            let mut cursors = ftl.aps[pool_id].cursors.lock();
            cursors.cur = Some(cur);
            cursors.gc_cur = Some(gc_cur);
            drop(cursors);
            ftl.blocks[cur].set_owner_ap(pool_id);
            ftl.blocks[gc_cur].set_owner_ap(pool_id);
        }

        log::info!(
            "openftl: {} pools x {} blocks, {} host pages ({} per block), opts {:?}",
            nr_pools,
            blocks_per_pool,
            ftl.geometry.nr_pages(),
            ftl.geometry.nr_host_pages_in_blk(),
            ftl.opts
        );
        Ok(ftl)
    }

    // ------------------------------------------------------------------
    // Block inventory
    // ------------------------------------------------------------------

    /// Take a fresh block from a pool, reset it and attach a write buffer.
    pub(crate) fn pool_get_block(&self, pool_id: usize, is_gc: bool) -> Option<usize> {
        let pool = &self.pools[pool_id];
        match pool.take_free(is_gc, self.nr_aps) {
            Ok(block_id) => {
                let block = &self.blocks[block_id];
                block.reset();
                block.attach_buf(self.buf_pool.alloc());
                Some(block_id)
            }
            Err(GetBlockError::Empty) => {
                self.note_exhausted(pool_id);
                None
            }
            Err(GetBlockError::Reserved) => None,
        }
    }

    /// Return a block whose valid pages have all been migrated. GC surface.
    pub fn put_block(&self, block_id: usize) {
        let pool_id = self.blocks[block_id].pool_id();
        self.pools[pool_id].put_free(block_id);
    }

    // ------------------------------------------------------------------
    // GC surface
    // ------------------------------------------------------------------

    /// Oldest full block of a pool, if any (the GC's preferred victim).
    pub fn gc_candidate(&self, pool_id: usize) -> Option<usize> {
        self.pools[pool_id].prio_head()
    }

    /// Mark a block as being copied forward; lookups on its pages defer
    /// until the copy finishes.
    pub fn begin_gc(&self, block_id: usize) {
        self.blocks[block_id].set_gc_running(true);
    }

    /// Invalidate the page behind a physical address. GC surface; map
    /// updates invalidate superseded pages themselves.
    pub fn invalidate_block_page(&self, paddr: Paddr) {
        let block_id = (paddr / self.geometry.nr_host_pages_in_blk() as u64) as usize;
        invalidate_page(&self.geometry, &self.blocks[block_id], paddr);
    }

    /// Erase a reclaimed block on the device.
    pub fn erase_block(&self, block_id: usize) -> Result<(), DeviceError> {
        let block = &self.blocks[block_id];
        let nr_pages = self.geometry.nr_host_pages_in_blk();
        if block.nr_invalid_pages() != nr_pages {
            log::warn!(
                "ftl: erasing block {} with {} valid pages",
                block_id,
                nr_pages - block.nr_invalid_pages()
            );
        }
        self.device
            .erase(self.geometry.block_base(block_id), nr_pages)
    }

    /// GC write entry: locks the logical address, then maps and submits with
    /// GC privileges (may dig into the free-block reserve).
    pub fn write_request(
        &self,
        req: IoRequest,
        is_gc: bool,
        kind: MapKind,
        private: Option<&PolicyPrivate>,
        sync: Option<Arc<SyncCompletion>>,
    ) -> WriteOutcome {
        let laddr = req.sector / self.geometry.sectors_per_host_page as u64;
        self.laddr_locks.lock(laddr);
        self.core_write(req, is_gc, kind, private, sync)
    }

    /// GC read entry: like the read path, with a completion handle the
    /// caller waits on. The resolved address record travels back through it.
    pub fn gc_read(&self, req: IoRequest, sync: Arc<SyncCompletion>) -> Disposition {
        self.read_core(req, Some(sync))
    }

    /// Return an address record obtained through `gc_read` to its pool.
    pub fn release_addr(&self, p: Box<PageAddr>) {
        self.free_addr(p);
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn geometry(&self) -> &FlashGeometry {
        &self.geometry
    }

    pub fn nr_pools(&self) -> usize {
        self.pools.len()
    }

    pub fn block(&self, block_id: usize) -> &Block {
        &self.blocks[block_id]
    }

    pub fn pool(&self, pool_id: usize) -> &Pool {
        &self.pools[pool_id]
    }

    pub fn ap(&self, ap_id: usize) -> &AppendPoint {
        &self.aps[ap_id]
    }

    /// Forward entry of a translation table: `(paddr, block)`.
    pub fn map_entry(&self, kind: MapKind, laddr: Laddr) -> (Paddr, Option<usize>) {
        self.maps.get(kind, laddr)
    }

    /// Reverse entry: `(laddr or LTOP_POISON, owning table)`.
    pub fn rev_entry(&self, paddr: Paddr) -> (u64, MapKind) {
        self.maps.rev_get(paddr)
    }

    pub fn laddr_locked(&self, laddr: Laddr) -> bool {
        self.laddr_locks.is_locked(laddr)
    }

    /// Wait until the workers are idle and no pool has queued submissions.
    pub fn quiesce(&self) {
        loop {
            self.wq_deferred.flush();
            self.wq_biod.flush();
            let busy = self.pools.iter().any(|pool| {
                pool.is_active.load(Ordering::Acquire) != 0 || pool.waiting_len() != 0
            });
            if !busy {
                return;
            }
            std::thread::yield_now();
        }
    }

    // ------------------------------------------------------------------
    // Diagnostics
    // ------------------------------------------------------------------

    /// Rate-limited complaint about an empty free list.
    fn note_exhausted(&self, pool_id: usize) {
        let events = self.exhausted_events.fetch_add(1, Ordering::Relaxed);
        if events % 128 == 0 {
            log::error!("pool {}: no free blocks available", pool_id);
            self.log_pool_state(pool_id);
        }
    }

    pub(crate) fn log_pool_state(&self, pool_id: usize) {
        let (free, used, prio) = self.pools[pool_id].list_counts();
        log::info!(
            "pool {}: {} free / {} used / {} prio, waiting {}",
            pool_id,
            free,
            used,
            prio,
            self.pools[pool_id].waiting_len()
        );
    }

    pub(crate) fn log_all_pools(&self) {
        for pool_id in 0..self.pools.len() {
            self.log_pool_state(pool_id);
        }
    }
}

impl fmt::Debug for Ftl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ftl")
            .field("geometry", &self.geometry)
            .field("opts", &self.opts)
            .field("nr_aps", &self.nr_aps)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemFlash;

    fn geo(blocks_per_pool: usize) -> FlashGeometry {
        FlashGeometry {
            nr_pools: 2,
            blocks_per_pool,
            flash_pages_per_blk: 4,
            host_pages_in_flash_page: 1,
            sectors_per_host_page: 1,
        }
    }

    #[test]
    fn init_primes_both_cursors_per_pool() {
        let g = geo(4);
        let device = Arc::new(MemFlash::new(&g));
        let ftl = Ftl::new(FtlConfig::new(g), device).unwrap();

        for pool_id in 0..2 {
            let ap = ftl.ap(pool_id);
            let cur = ap.current_block().unwrap();
            let gc_cur = ap.gc_block().unwrap();
            assert_ne!(cur, gc_cur);
            assert_eq!(ftl.block(cur).pool_id(), pool_id);
            assert_eq!(ftl.block(gc_cur).pool_id(), pool_id);
            assert_eq!(ftl.pool(pool_id).nr_free_blocks(), 2);
            let (_, used, _) = ftl.pool(pool_id).list_snapshot();
            assert_eq!(used, vec![cur, gc_cur]);
        }
        assert_eq!(ftl.nr_aps, 4);
    }

    #[test]
    fn init_rejects_undersized_device() {
        let small = geo(2);
        let device = Arc::new(MemFlash::new(&small));
        let big = geo(8);
        assert_eq!(
            Ftl::new(FtlConfig::new(big), device).err(),
            Some(InitError::DeviceTooSmall)
        );
    }

    #[test]
    fn init_rejects_bad_geometry() {
        let mut g = geo(4);
        g.flash_pages_per_blk = 0;
        let device = Arc::new(MemFlash::new(&geo(4)));
        assert!(matches!(
            Ftl::new(FtlConfig::new(g), device).err(),
            Some(InitError::BadGeometry(_))
        ));
    }
}
