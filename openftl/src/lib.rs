//! Host-side flash translation layer core for open-channel, page-addressable
//! flash devices.
//!
//! The crate sits between an upper block layer issuing host-page requests
//! and a lower device exposing raw flash geometry (pools of erase blocks,
//! blocks of in-order flash pages). It maintains the logical-to-physical
//! address map and its inverse, schedules writes across per-pool append
//! points, packs host pages into flash-page device requests, and recovers
//! from transient exhaustion by parking requests until the garbage collector
//! frees space.
//!
//! The garbage collector itself is an external collaborator: the core
//! exposes invalidation counters, per-pool victim candidates, a `gc_kick`
//! notifier and GC-privileged read/write entries, and the GC drives them.
//!
//! The translation maps are volatile; crash recovery is out of scope.

pub mod addr;
pub mod ap;
pub mod block;
pub mod config;
pub mod defer;
pub mod device;
pub mod ftl;
pub mod laddr;
pub mod map;
pub mod mempool;
pub mod pipeline;
pub mod pool;
pub mod request;
pub mod strategy;
pub mod workqueue;

pub use addr::{Laddr, MapKind, PageAddr, Paddr, PolicyPrivate, Sector, LTOP_EMPTY, LTOP_POISON};
pub use config::{ConfigError, FlashGeometry, FtlConfig, FtlOpts, SECTOR_SIZE};
pub use device::{DeviceError, FlashDevice, MemFlash};
pub use ftl::{Ftl, InitError};
pub use request::{
    DeviceRequest, Dir, Disposition, EndIo, IoRequest, SyncCompletion, SyncDone, WriteOutcome,
};
pub use strategy::Strategy;
