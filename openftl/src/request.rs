//! Request types crossing the layer boundaries.
//!
//! `IoRequest` comes from the upper block layer (or the GC) and carries its
//! own completion callback. The pipeline turns it into a `DeviceRequest`
//! sized to the device write unit, with a pooled `RequestCtx` riding along
//! that remembers everything the completion handler needs.

use std::fmt;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;

use crate::addr::{Laddr, MapKind, PageAddr, Sector};

/// Transfer direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dir {
    Read,
    Write,
}

impl Dir {
    /// Index into per-direction counters.
    pub fn index(self) -> usize {
        match self {
            Dir::Read => 0,
            Dir::Write => 1,
        }
    }
}

/// Completion callback invoked with the request and its error code
/// (0 on success, negative errno otherwise).
pub type EndIo = Box<dyn FnOnce(&mut IoRequest, i32) + Send>;

/// An upper-layer request for one host page.
pub struct IoRequest {
    /// Target 512-byte sector; rewritten to the physical location during
    /// translation.
    pub sector: Sector,
    pub dir: Dir,
    /// Host-page payload: written data for writes, filled on read completion.
    pub data: Vec<u8>,
    pub end_io: Option<EndIo>,
}

impl IoRequest {
    pub fn read(sector: Sector) -> IoRequest {
        IoRequest {
            sector,
            dir: Dir::Read,
            data: Vec::new(),
            end_io: None,
        }
    }

    pub fn write(sector: Sector, data: Vec<u8>) -> IoRequest {
        IoRequest {
            sector,
            dir: Dir::Write,
            data,
            end_io: None,
        }
    }

    pub fn with_end_io<F>(mut self, f: F) -> IoRequest
    where
        F: FnOnce(&mut IoRequest, i32) + Send + 'static,
    {
        self.end_io = Some(Box::new(f));
        self
    }

    /// Invoke and consume the completion callback.
    pub(crate) fn complete(&mut self, err: i32) {
        if let Some(end_io) = self.end_io.take() {
            end_io(self, err);
        }
    }
}

impl fmt::Debug for IoRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoRequest")
            .field("sector", &self.sector)
            .field("dir", &self.dir)
            .field("len", &self.data.len())
            .finish()
    }
}

/// Result of handing a request to the FTL: the request was taken and will
/// complete through its own callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Submitted,
}

/// Outcome of the write path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Submitted,
    /// No physical page was available; the request sits on the deferred list.
    Deferred,
}

/// What a synchronous waiter receives on completion.
pub struct SyncDone {
    pub err: i32,
    /// For GC reads the waiter takes ownership of the address record.
    pub addr: Option<Box<PageAddr>>,
    /// The original request, handed back after its callback ran.
    pub req: Option<IoRequest>,
}

/// Completion handle for synchronous submitters (the GC).
pub struct SyncCompletion {
    done: Mutex<Option<SyncDone>>,
    cond: Condvar,
}

impl SyncCompletion {
    pub fn new() -> Arc<SyncCompletion> {
        Arc::new(SyncCompletion {
            done: Mutex::new(None),
            cond: Condvar::new(),
        })
    }

    pub(crate) fn complete(&self, done: SyncDone) {
        let mut slot = self.done.lock().expect("sync completion poisoned");
        debug_assert!(slot.is_none(), "sync completion signaled twice");
        *slot = Some(done);
        drop(slot);
        self.cond.notify_all();
    }

    /// Block until the request completes.
    pub fn wait(&self) -> SyncDone {
        let mut slot = self.done.lock().expect("sync completion poisoned");
        loop {
            if let Some(done) = slot.take() {
                return done;
            }
            slot = self.cond.wait(slot).expect("sync completion poisoned");
        }
    }
}

/// Per-request context attached to every in-flight device request.
///
/// Pooled; `reset` must leave no owned state behind before the context goes
/// back to the free list.
pub struct RequestCtx {
    /// Owning append point.
    pub ap: usize,
    /// The allocated (write) or resolved (read) physical location.
    pub addr: Option<Box<PageAddr>>,
    pub laddr: Laddr,
    /// The originating request, completed from the FTL completion handler.
    pub orig: Option<IoRequest>,
    pub sync: Option<Arc<SyncCompletion>>,
    /// Which translation table this request mapped through.
    pub map: MapKind,
    /// Dispatch timestamp for the completion pacing loop.
    pub start: Option<Instant>,
    /// Monotonic id; identifies the pool's current request under serialization.
    pub serial: u64,
}

impl RequestCtx {
    pub(crate) fn idle() -> RequestCtx {
        RequestCtx {
            ap: 0,
            addr: None,
            laddr: 0,
            orig: None,
            sync: None,
            map: MapKind::Primary,
            start: None,
            serial: 0,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.ap = 0;
        self.addr = None;
        self.laddr = 0;
        self.orig = None;
        self.sync = None;
        self.map = MapKind::Primary;
        self.start = None;
        self.serial = 0;
    }
}

/// A prepared request for the device layer.
pub struct DeviceRequest {
    /// Target 512-byte sector on the device.
    pub sector: Sector,
    pub dir: Dir,
    /// Flash-page-sized payload for writes, host-page-sized buffer for reads.
    pub data: Vec<u8>,
    /// Set when a synchronous waiter is attached.
    pub sync: bool,
    pub(crate) ctx: Option<Box<RequestCtx>>,
}

impl DeviceRequest {
    /// Logical address of the request, when the context is still attached.
    /// Device backends may use this for tracing.
    pub fn laddr(&self) -> Option<Laddr> {
        self.ctx.as_ref().map(|ctx| ctx.laddr)
    }
}

impl fmt::Debug for DeviceRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceRequest")
            .field("sector", &self.sector)
            .field("dir", &self.dir)
            .field("len", &self.data.len())
            .field("sync", &self.sync)
            .finish()
    }
}
