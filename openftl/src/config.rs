//! Device geometry and FTL configuration.
//!
//! The geometry describes the physical layout the lower device exposes:
//! pools of erase blocks, blocks of flash pages, flash pages of host pages.
//! Everything else in the crate derives its sizing from these numbers.

use bitflags::bitflags;
use core::fmt;

use crate::addr::Paddr;

/// Size of one device sector in bytes.
pub const SECTOR_SIZE: usize = 512;

/// Physical layout of the flash device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashGeometry {
    /// Number of block pools on the device.
    pub nr_pools: usize,
    /// Erase blocks per pool.
    pub blocks_per_pool: usize,
    /// Flash pages per erase block.
    pub flash_pages_per_blk: usize,
    /// Host pages packed into one flash page (the device write unit).
    pub host_pages_in_flash_page: usize,
    /// Device sectors per host page (`NR_PHY_IN_LOG`).
    pub sectors_per_host_page: usize,
}

impl FlashGeometry {
    /// Host pages in one erase block.
    pub fn nr_host_pages_in_blk(&self) -> usize {
        self.flash_pages_per_blk * self.host_pages_in_flash_page
    }

    /// Bytes in one host page.
    pub fn host_page_size(&self) -> usize {
        self.sectors_per_host_page * SECTOR_SIZE
    }

    /// Bytes in one flash page.
    pub fn flash_page_size(&self) -> usize {
        self.host_pages_in_flash_page * self.host_page_size()
    }

    /// Total erase blocks on the device.
    pub fn nr_blocks(&self) -> usize {
        self.nr_pools * self.blocks_per_pool
    }

    /// Total host pages on the device; logical addresses are dense in
    /// `[0, nr_pages)`.
    pub fn nr_pages(&self) -> u64 {
        (self.nr_blocks() * self.nr_host_pages_in_blk()) as u64
    }

    /// Physical address of the first host page of a block.
    pub fn block_base(&self, block_id: usize) -> Paddr {
        (block_id * self.nr_host_pages_in_blk()) as Paddr
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.nr_pools == 0
            || self.flash_pages_per_blk == 0
            || self.host_pages_in_flash_page == 0
            || self.sectors_per_host_page == 0
        {
            return Err(ConfigError::ZeroDimension);
        }
        // Each pool primes one write cursor and one GC cursor at init.
        if self.blocks_per_pool < 2 {
            return Err(ConfigError::TooFewBlocks);
        }
        Ok(())
    }
}

bitflags! {
    /// Runtime option flags recognized by the core.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FtlOpts: u32 {
        /// At most one device request per pool in flight, in arrival order.
        const POOL_SERIALIZE = 1 << 0;
        /// Disable the completion-time pacing loop.
        const NO_WAITS = 1 << 1;
    }
}

/// Full FTL configuration: geometry plus tunables.
#[derive(Debug, Clone)]
pub struct FtlConfig {
    pub geometry: FlashGeometry,
    pub opts: FtlOpts,
    /// Simulated read latency in microseconds (emulated backends).
    pub t_read_us: u64,
    /// Simulated write latency in microseconds.
    pub t_write_us: u64,
    /// Capacity of the per-request context pool.
    pub ctx_pool_size: usize,
    /// Capacity of the address record pool.
    pub addr_pool_size: usize,
    /// Write buffers kept preallocated; further demand falls back to the heap.
    pub buf_pool_size: usize,
}

impl FtlConfig {
    pub fn new(geometry: FlashGeometry) -> FtlConfig {
        FtlConfig {
            geometry,
            opts: FtlOpts::empty(),
            t_read_us: 0,
            t_write_us: 0,
            ctx_pool_size: 256,
            addr_pool_size: 256,
            buf_pool_size: 4 * geometry.nr_pools,
        }
    }
}

/// Errors detected while validating a configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// A geometry dimension is zero.
    ZeroDimension,
    /// A pool needs at least two blocks to prime its append point.
    TooFewBlocks,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::ZeroDimension => write!(f, "geometry dimension is zero"),
            ConfigError::TooFewBlocks => write!(f, "pool needs at least two blocks"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geo() -> FlashGeometry {
        FlashGeometry {
            nr_pools: 2,
            blocks_per_pool: 4,
            flash_pages_per_blk: 8,
            host_pages_in_flash_page: 2,
            sectors_per_host_page: 1,
        }
    }

    #[test]
    fn derived_counts() {
        let g = geo();
        assert_eq!(g.nr_host_pages_in_blk(), 16);
        assert_eq!(g.nr_blocks(), 8);
        assert_eq!(g.nr_pages(), 128);
        assert_eq!(g.host_page_size(), 512);
        assert_eq!(g.flash_page_size(), 1024);
        assert_eq!(g.block_base(3), 48);
    }

    #[test]
    fn validate_rejects_degenerate_layouts() {
        let mut g = geo();
        g.nr_pools = 0;
        assert_eq!(g.validate(), Err(ConfigError::ZeroDimension));

        let mut g = geo();
        g.blocks_per_pool = 1;
        assert_eq!(g.validate(), Err(ConfigError::TooFewBlocks));

        assert!(geo().validate().is_ok());
    }
}
