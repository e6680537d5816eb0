//! Pluggable policy hooks.
//!
//! A `Strategy` is a capability record of function pointers supplied by a
//! policy module. The core ships defaults (round-robin mapping, direct
//! lookup, FIFO deferral); the GC, emulated backends, and alternative
//! placement policies override individual hooks without touching the core.

use std::collections::VecDeque;

use crate::addr::{Laddr, MapKind, PageAddr, PolicyPrivate};
use crate::ftl::Ftl;
use crate::request::{DeviceRequest, Disposition, IoRequest, RequestCtx};

/// Full read entry: locks the logical address and runs the read path.
pub type ReadBioFn = fn(&Ftl, IoRequest) -> Disposition;

/// Full user-write entry: locks the logical address and runs the write path.
pub type WriteBioFn = fn(&Ftl, IoRequest) -> Disposition;

/// Resolve a logical address through the primary table.
pub type LookupLtopFn = fn(&Ftl, Laddr) -> Option<Box<PageAddr>>;

/// Choose an append point, allocate a physical page, update the maps.
pub type MapLtopFn =
    fn(&Ftl, Laddr, bool, MapKind, Option<&PolicyPrivate>) -> Option<Box<PageAddr>>;

/// Park a request that cannot currently proceed.
pub type DeferBioFn = fn(&Ftl, IoRequest, MapKind);

/// Append a prepared request to a pool's waiting queue.
pub type BioWaitAddFn = fn(&mut VecDeque<DeviceRequest>, DeviceRequest, Option<&PolicyPrivate>);

/// Adjust the simulated device wait at completion time (microseconds).
pub type EndioHookFn = fn(&Ftl, &DeviceRequest, &RequestCtx, &mut u64);

/// Observe a successful physical-page allocation on a block.
pub type AllocPhysHookFn = fn(&Ftl, usize);

/// The policy surface of the core.
pub struct Strategy {
    pub read_bio: ReadBioFn,
    pub write_bio: WriteBioFn,
    pub lookup_ltop: LookupLtopFn,
    pub map_ltop: MapLtopFn,
    pub defer_bio: DeferBioFn,
    pub bio_wait_add: BioWaitAddFn,
    pub endio: Option<EndioHookFn>,
    pub alloc_phys_addr: Option<AllocPhysHookFn>,
}

impl Default for Strategy {
    fn default() -> Strategy {
        Strategy {
            read_bio: default_read_bio,
            write_bio: default_write_bio,
            lookup_ltop: default_lookup_ltop,
            map_ltop: default_map_ltop,
            defer_bio: default_defer_bio,
            bio_wait_add: default_bio_wait_add,
            endio: None,
            alloc_phys_addr: None,
        }
    }
}

fn default_read_bio(ftl: &Ftl, req: IoRequest) -> Disposition {
    ftl.read_core(req, None)
}

fn default_write_bio(ftl: &Ftl, req: IoRequest) -> Disposition {
    ftl.write_user(req)
}

fn default_lookup_ltop(ftl: &Ftl, laddr: Laddr) -> Option<Box<PageAddr>> {
    ftl.lookup_map(laddr, MapKind::Primary)
}

/// Round-robin logical-to-physical mapping.
///
/// User writes rotate through all append points. GC writes instead pick the
/// pool with the most free blocks, so a GC-ing pool does not devour the
/// pages of a pool already under pressure; the counts are read without the
/// pool lock, an estimate is good enough.
fn default_map_ltop(
    ftl: &Ftl,
    laddr: Laddr,
    is_gc: bool,
    kind: MapKind,
    _private: Option<&PolicyPrivate>,
) -> Option<Box<PageAddr>> {
    let ap_id = if !is_gc {
        ftl.get_next_ap()
    } else {
        let mut best = 0;
        for pool in ftl.pools.iter() {
            if pool.nr_free_blocks() > ftl.pools[best].nr_free_blocks() {
                best = pool.id();
            }
        }
        best
    };

    let p = ftl.alloc_from_ap(ap_id, is_gc);
    if let Some(ref p) = p {
        ftl.update_map(laddr, p, kind);
    }
    p
}

fn default_defer_bio(ftl: &Ftl, req: IoRequest, map: MapKind) {
    ftl.defer_request(req, map);
}

fn default_bio_wait_add(
    queue: &mut VecDeque<DeviceRequest>,
    rq: DeviceRequest,
    _private: Option<&PolicyPrivate>,
) {
    queue.push_back(rq);
}
