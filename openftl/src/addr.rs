//! Address types shared across the translation layer.
//!
//! Physical addresses (`Paddr`) count host pages from the start of the
//! device; upper-layer requests address 512-byte device sectors (`Sector`),
//! with `sectors_per_host_page` sectors per logical page.

use std::any::Any;
use std::sync::Arc;

/// A 512-byte device sector number.
pub type Sector = u64;

/// A logical (host) page number, dense in `[0, nr_pages)`.
pub type Laddr = u64;

/// A physical host-page number.
pub type Paddr = u64;

/// Sentinel: no physical page could be allocated.
pub const LTOP_EMPTY: Paddr = Paddr::MAX;

/// Sentinel stored in a reverse-map entry whose forward mapping was replaced.
pub const LTOP_POISON: u64 = 0xDEAD_BEEF_DEAD_BEEF;

/// Opaque per-request state understood by a placement policy.
pub type PolicyPrivate = Arc<dyn Any + Send + Sync>;

/// Which translation table a mapping lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapKind {
    /// The primary logical-to-physical table.
    Primary,
    /// The shadow table the GC maps into while copying forward.
    Shadow,
}

impl MapKind {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            MapKind::Primary => 0,
            MapKind::Shadow => 1,
        }
    }

    pub(crate) fn from_u8(v: u8) -> MapKind {
        if v == 0 {
            MapKind::Primary
        } else {
            MapKind::Shadow
        }
    }
}

/// A resolved physical location, handed out by the allocator or a lookup.
///
/// Records are pooled; callers return them through `Ftl` so the submit path
/// never touches the global allocator.
pub struct PageAddr {
    pub paddr: Paddr,
    pub block: Option<usize>,
    pub private: Option<PolicyPrivate>,
}

impl PageAddr {
    pub(crate) fn idle() -> PageAddr {
        PageAddr {
            paddr: LTOP_EMPTY,
            block: None,
            private: None,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.paddr = LTOP_EMPTY;
        self.block = None;
        self.private = None;
    }
}
