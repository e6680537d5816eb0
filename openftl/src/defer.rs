//! Deferral and per-pool serialization workers.
//!
//! Requests that cannot proceed (no free page, GC conflict, pool exhaustion)
//! sit on a global deferred list until the GC frees space and kicks a
//! resubmit. A single worker drains the list through the normal strategy
//! entry points; ordering is FIFO per direction only.
//!
//! With `POOL_SERIALIZE`, prepared requests queue per pool and a waiting
//! worker feeds them to the device one at a time, preserving strict arrival
//! order for hardware that requires it.

use std::time::Instant;

use crate::addr::MapKind;
use crate::ftl::Ftl;
use crate::request::{Dir, IoRequest};

/// A parked request plus the translation table it was headed for.
pub(crate) struct DeferredRequest {
    pub(crate) req: IoRequest,
    pub(crate) map: MapKind,
}

impl Ftl {
    /// Park a request on the deferred list (default `defer_bio` hook).
    pub(crate) fn defer_request(&self, req: IoRequest, map: MapKind) {
        log::debug!(
            "ftl: deferring {:?} targeting the {:?} table",
            req,
            map
        );
        self.deferred.lock().push_back(DeferredRequest { req, map });
    }

    /// Number of requests currently parked.
    pub fn deferred_len(&self) -> usize {
        self.deferred.lock().len()
    }

    /// Schedule the deferred-queue worker. The GC calls this after freeing
    /// blocks so parked requests get another chance.
    pub fn resubmit_deferred(&self) {
        self.wq_deferred.queue(&self.deferred_work);
    }

    /// Worker body: grab the whole list, resubmit each request through the
    /// strategy entry points. A request that still cannot proceed parks
    /// itself again.
    pub(crate) fn drain_deferred(&self) {
        let drained: Vec<DeferredRequest> = {
            let mut deferred = self.deferred.lock();
            deferred.drain(..).collect()
        };
        for entry in drained {
            match entry.req.dir {
                Dir::Write => {
                    (self.strategy.write_bio)(self, entry.req);
                }
                Dir::Read => {
                    (self.strategy.read_bio)(self, entry.req);
                }
            }
        }
    }

    /// Per-pool waiting worker body: pop the queue head, mark it current,
    /// restart its device clock and dispatch it. Completion re-queues this
    /// worker; when the queue is empty the submission baton is released.
    pub(crate) fn run_pool_waiting(&self, pool_id: usize) {
        let pool = &self.pools[pool_id];
        let rq = {
            let mut waiting = pool.waiting.lock();
            match waiting.queue.pop_front() {
                Some(rq) => {
                    waiting.cur_bio = rq.ctx.as_ref().map(|ctx| ctx.serial);
                    Some(rq)
                }
                None => {
                    waiting.cur_bio = None;
                    pool.is_active
                        .fetch_sub(1, std::sync::atomic::Ordering::AcqRel);
                    None
                }
            }
        };

        let Some(mut rq) = rq else { return };
        // The pacing loop measures device time, not queue time.
        if let Some(ctx) = rq.ctx.as_mut() {
            ctx.start = Some(Instant::now());
        }
        self.dispatch(rq);
    }

    /// Notify the garbage collector that the core wants space reclaimed.
    pub fn gc_kick(&self) {
        self.gc_kicks
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let notifier = self.gc_notifier.lock();
        if let Some(notify) = notifier.as_ref() {
            notify();
        }
    }

    /// Times the core has asked for a GC pass.
    pub fn gc_kicks(&self) -> u64 {
        self.gc_kicks.load(std::sync::atomic::Ordering::Relaxed)
    }

    /// Install the GC notifier invoked by `gc_kick`. Keep it cheap: it runs
    /// on submission and completion paths.
    pub fn set_gc_notifier<F>(&self, notify: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.gc_notifier.lock() = Some(Box::new(notify));
    }
}
