//! The per-request pipeline: admission, translation, packing, dispatch,
//! completion.
//!
//! Writes copy the host page into the owning block's write buffer and go to
//! the device as one flash-page-sized request, because the device writes
//! whole flash pages atomically. Reads are rewritten to the mapped physical
//! sector, or zero-filled inline when the address was never written.
//!
//! The logical address stays locked from pre-translation until the
//! completion handler releases it.

use std::sync::Arc;
use std::time::Instant;

use crate::addr::{MapKind, PageAddr, PolicyPrivate};
use crate::config::FtlOpts;
use crate::ftl::Ftl;
use crate::request::{
    DeviceRequest, Dir, Disposition, IoRequest, SyncCompletion, SyncDone, WriteOutcome,
};

impl Ftl {
    /// Upstream entry point. Every request is taken; completion arrives
    /// through the request's own callback.
    pub fn map_request(&self, mut req: IoRequest) -> Disposition {
        let laddr = req.sector / self.geometry.sectors_per_host_page as u64;
        if laddr >= self.geometry.nr_pages() {
            log::error!("ftl: request beyond device, sector {}", req.sector);
            req.complete(-5);
            return Disposition::Submitted;
        }
        match req.dir {
            Dir::Read => (self.strategy.read_bio)(self, req),
            Dir::Write => (self.strategy.write_bio)(self, req),
        }
    }

    /// Read path. `sync` is attached by synchronous submitters (GC copy
    /// reads); the address record travels back through the handle.
    pub(crate) fn read_core(
        &self,
        mut req: IoRequest,
        sync: Option<Arc<SyncCompletion>>,
    ) -> Disposition {
        let nrp = self.geometry.sectors_per_host_page as u64;
        let laddr = req.sector / nrp;

        self.laddr_locks.lock(laddr);

        let Some(p) = (self.strategy.lookup_ltop)(self, laddr) else {
            // GC is moving the page (or no address record was available);
            // retry once it has made progress.
            self.laddr_locks.unlock(laddr);
            (self.strategy.defer_bio)(self, req, MapKind::Primary);
            self.gc_kick();
            return Disposition::Submitted;
        };

        req.sector = p.paddr * nrp + (req.sector % nrp);

        if p.block.is_none() {
            // Never written: zero-fill inline and finish.
            req.sector = 0;
            let page_size = self.geometry.host_page_size();
            req.data.clear();
            req.data.resize(page_size, 0);
            req.complete(0);
            self.free_addr(p);
            self.laddr_locks.unlock(laddr);
            if let Some(sync) = sync {
                sync.complete(SyncDone {
                    err: 0,
                    addr: None,
                    req: Some(req),
                });
            }
            return Disposition::Submitted;
        }

        let dev_sector = req.sector;
        let data = vec![0u8; self.geometry.host_page_size()];
        self.submit_io(p, laddr, Dir::Read, dev_sector, data, Some(req), sync, MapKind::Primary);
        Disposition::Submitted
    }

    /// Default user write entry: lock the address, then run the write path
    /// against the primary table.
    pub(crate) fn write_user(&self, req: IoRequest) -> Disposition {
        let laddr = req.sector / self.geometry.sectors_per_host_page as u64;
        self.laddr_locks.lock(laddr);
        self.core_write(req, false, MapKind::Primary, None, None);
        Disposition::Submitted
    }

    /// Write path proper. The caller has already locked the logical address.
    pub(crate) fn core_write(
        &self,
        req: IoRequest,
        is_gc: bool,
        kind: MapKind,
        private: Option<&PolicyPrivate>,
        sync: Option<Arc<SyncCompletion>>,
    ) -> WriteOutcome {
        let geo = self.geometry;
        let laddr = req.sector / geo.sectors_per_host_page as u64;

        let Some(p) = (self.strategy.map_ltop)(self, laddr, is_gc, kind, private) else {
            // The GC path digs into the reserve and must not fail here.
            debug_assert!(!is_gc, "GC write could not map a physical page");
            if is_gc {
                log::error!("ftl: GC write for laddr {} could not map a page", laddr);
            }
            self.laddr_locks.unlock(laddr);
            (self.strategy.defer_bio)(self, req, kind);
            self.gc_kick();
            return WriteOutcome::Deferred;
        };

        let Some(block_id) = p.block else {
            log::error!("ftl: mapped laddr {} to a page without a block", laddr);
            self.laddr_locks.unlock(laddr);
            (self.strategy.defer_bio)(self, req, kind);
            self.free_addr(p);
            self.gc_kick();
            return WriteOutcome::Deferred;
        };

        // Pack the host page into the block buffer, then send the whole
        // flash page containing it: the device programs flash pages, not
        // host pages.
        let block = &self.blocks[block_id];
        let slot = (p.paddr % geo.nr_host_pages_in_blk() as u64) as usize;
        block.buffer_page(&geo, slot, &req.data);
        let per_flash = geo.host_pages_in_flash_page;
        let flash_start = slot - slot % per_flash;
        let data = block.copy_buf_slots(&geo, flash_start, per_flash);

        let dev_sector =
            (geo.block_base(block_id) + flash_start as u64) * geo.sectors_per_host_page as u64;
        self.submit_io(p, laddr, Dir::Write, dev_sector, data, Some(req), sync, kind);
        WriteOutcome::Submitted
    }

    /// Attach per-request context and hand the prepared request to the
    /// device, or to the pool's waiting queue under `POOL_SERIALIZE`.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn submit_io(
        &self,
        p: Box<PageAddr>,
        laddr: u64,
        dir: Dir,
        dev_sector: u64,
        data: Vec<u8>,
        orig: Option<IoRequest>,
        sync: Option<Arc<SyncCompletion>>,
        kind: MapKind,
    ) {
        let block_id = match p.block {
            Some(block_id) => block_id,
            None => {
                log::error!("ftl: submit without a backing block");
                debug_assert!(false);
                self.laddr_locks.unlock(laddr);
                self.free_addr(p);
                return;
            }
        };
        let pool_id = self.blocks[block_id].pool_id();
        let ap = &self.aps[pool_id];

        let Some(mut ctx) = self.ctx_pool.alloc() else {
            // Transient: the request cannot be constructed right now.
            log::warn!("ftl: request context pool exhausted, deferring");
            self.laddr_locks.unlock(laddr);
            self.free_addr(p);
            if let Some(sync) = sync {
                // Synchronous submitters retry themselves; do not strand them.
                sync.complete(SyncDone {
                    err: -11,
                    addr: None,
                    req: orig,
                });
            } else if let Some(orig) = orig {
                (self.strategy.defer_bio)(self, orig, kind);
            }
            self.gc_kick();
            return;
        };

        let private = p.private.clone();
        let has_sync = sync.is_some();
        ctx.ap = ap.id();
        ctx.addr = Some(p);
        ctx.laddr = laddr;
        ctx.orig = orig;
        ctx.sync = sync;
        ctx.map = kind;
        ctx.start = Some(Instant::now());
        ctx.serial = self.next_serial.fetch_add(1, std::sync::atomic::Ordering::Relaxed) + 1;

        let rq = DeviceRequest {
            sector: dev_sector,
            dir,
            data,
            sync: has_sync,
            ctx: Some(ctx),
        };

        // Semi-accurate, per the append point's accounting contract.
        ap.account(dir);

        if self.opts.contains(FtlOpts::POOL_SERIALIZE) {
            let pool = &self.pools[pool_id];
            let mut waiting = pool.waiting.lock();
            (self.strategy.bio_wait_add)(&mut waiting.queue, rq, private.as_ref());

            if pool.is_active.fetch_add(1, std::sync::atomic::Ordering::AcqRel) != 0 {
                // Someone else is already driving the queue.
                pool.is_active.fetch_sub(1, std::sync::atomic::Ordering::AcqRel);
                return;
            }
            if waiting.queue.is_empty() {
                pool.is_active.fetch_sub(1, std::sync::atomic::Ordering::AcqRel);
                return;
            }
            drop(waiting);
            self.wq_biod.queue(&self.waiting_works[pool_id]);
            return;
        }

        self.dispatch(rq);
    }

    /// Run the medium operation and feed the result into completion.
    pub(crate) fn dispatch(&self, mut rq: DeviceRequest) {
        let err = match self.device.submit(&mut rq) {
            Ok(()) => 0,
            Err(e) => {
                log::error!("ftl: device error on sector {}: {}", rq.sector, e);
                e.errno()
            }
        };
        self.endio(rq, err);
    }

    /// FTL completion handler.
    pub(crate) fn endio(&self, mut rq: DeviceRequest, err: i32) {
        let Some(mut ctx) = rq.ctx.take() else {
            log::error!("ftl: completion without request context");
            debug_assert!(false);
            return;
        };
        let ap = &self.aps[ctx.ap];
        let pool_id = ap.pool_id();

        self.laddr_locks.unlock(ctx.laddr);

        let mut dev_wait = match rq.dir {
            Dir::Write => {
                if let Some(block_id) = ctx.addr.as_ref().and_then(|p| p.block) {
                    let block = &self.blocks[block_id];
                    let committed = block.commit_page() as usize;
                    if committed == self.geometry.nr_host_pages_in_blk() {
                        // Buffer contents are on the medium; the block is now
                        // a GC candidate.
                        if let Some(buf) = block.take_buf() {
                            self.buf_pool.free(buf);
                        }
                        self.pools[pool_id].move_to_prio(block_id);
                    }
                }
                ap.t_write_us
            }
            Dir::Read => ap.t_read_us,
        };

        if let Some(hook) = self.strategy.endio {
            hook(self, &rq, &ctx, &mut dev_wait);
        }

        if !self.opts.contains(FtlOpts::NO_WAITS) && dev_wait > 0 {
            pace(ctx.start, dev_wait);
        }

        if self.opts.contains(FtlOpts::POOL_SERIALIZE) {
            // Clearing the current request here (not only in the waiting
            // worker) closes the window where a new submitter reads a
            // request that already completed.
            {
                let mut waiting = self.pools[pool_id].waiting.lock();
                waiting.cur_bio = None;
            }
            self.wq_biod.queue(&self.waiting_works[pool_id]);
        }

        let p = ctx.addr.take();
        let mut orig = ctx.orig.take();
        if let Some(orig) = orig.as_mut() {
            if rq.dir == Dir::Read {
                orig.data.clear();
                orig.data.extend_from_slice(&rq.data);
            }
            orig.complete(err);
        }

        if let Some(sync) = ctx.sync.take() {
            if rq.dir == Dir::Read {
                // GC reads own the address record after completion.
                sync.complete(SyncDone { err, addr: p, req: orig });
            } else {
                sync.complete(SyncDone { err, addr: None, req: orig });
                if let Some(p) = p {
                    self.free_addr(p);
                }
            }
        } else if let Some(p) = p {
            self.free_addr(p);
        }

        ctx.reset();
        self.ctx_pool.free(ctx);
    }
}

/// Busy-wait until the simulated device time has passed. Bounded and only
/// meaningful for emulated backends; real completions disable it.
fn pace(start: Option<Instant>, dev_wait_us: u64) {
    let Some(start) = start else { return };
    let mut warned = false;
    loop {
        let elapsed = start.elapsed().as_micros() as u64;
        if elapsed >= dev_wait_us {
            break;
        }
        let remaining = dev_wait_us - elapsed;
        if remaining > 1500 && !warned {
            log::warn!("ftl: completion pacing wait of {} us", remaining);
            warned = true;
        }
        if remaining > 10 {
            // Spin in ~5 us slices.
            let slice = Instant::now();
            while slice.elapsed().as_micros() < 5 {
                std::hint::spin_loop();
            }
        } else {
            std::hint::spin_loop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn pace_waits_out_the_budget() {
        let start = Instant::now();
        pace(Some(start), 200);
        assert!(start.elapsed() >= Duration::from_micros(200));
    }

    #[test]
    fn pace_returns_immediately_when_already_late() {
        let start = Instant::now() - Duration::from_millis(5);
        let before = Instant::now();
        pace(Some(start), 100);
        assert!(before.elapsed() < Duration::from_millis(5));
    }
}
