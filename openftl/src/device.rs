//! Downstream device interface.
//!
//! The core prepares flash-page-granular requests; the device performs the
//! medium operation and reports an error code, which the pipeline feeds into
//! the completion chain. `MemFlash` is the in-memory reference backend used
//! by the tests and by emulated deployments; it enforces the flash contract
//! that a host page is written at most once between erases.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::addr::{Paddr, Sector};
use crate::config::FlashGeometry;
use crate::request::{DeviceRequest, Dir};

/// Errors reported by a device backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceError {
    /// Medium or transfer failure.
    Io,
    /// Request addresses pages beyond the device.
    OutOfBounds,
    /// A page was rewritten without an intervening erase.
    NotErased,
    /// Device is not ready.
    NotReady,
}

impl DeviceError {
    /// Negative errno carried through the completion chain.
    pub fn errno(self) -> i32 {
        match self {
            DeviceError::Io | DeviceError::OutOfBounds | DeviceError::NotErased => -5,
            DeviceError::NotReady => -19,
        }
    }
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceError::Io => write!(f, "I/O error"),
            DeviceError::OutOfBounds => write!(f, "page number out of bounds"),
            DeviceError::NotErased => write!(f, "page rewritten without erase"),
            DeviceError::NotReady => write!(f, "device not ready"),
        }
    }
}

/// A page-addressable flash device.
pub trait FlashDevice: Send + Sync {
    /// Total host pages exposed by the device.
    fn nr_host_pages(&self) -> u64;

    /// Perform the prepared request. Returns when the medium operation is
    /// done; the caller runs the completion chain with the resulting code.
    fn submit(&self, rq: &mut DeviceRequest) -> Result<(), DeviceError>;

    /// Erase `nr_host_pages` starting at `first_page` (one erase block).
    fn erase(&self, first_page: Paddr, nr_host_pages: usize) -> Result<(), DeviceError>;
}

struct MemFlashState {
    data: Vec<u8>,
    /// Program cycles per flash page since the last erase. A flash page
    /// accepts one program per host page it holds, matching how the write
    /// path reprograms a flash page as its slots fill.
    programs: Vec<u8>,
}

/// In-memory reference backend.
pub struct MemFlash {
    host_page_size: usize,
    sectors_per_host_page: usize,
    host_pages_in_flash_page: usize,
    nr_host_pages: u64,
    state: spin::Mutex<MemFlashState>,
    trace: spin::Mutex<Vec<(Dir, Sector)>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MemFlash {
    pub fn new(geometry: &FlashGeometry) -> MemFlash {
        let nr_pages = geometry.nr_pages();
        let page_size = geometry.host_page_size();
        let nr_flash_pages = nr_pages as usize / geometry.host_pages_in_flash_page;
        MemFlash {
            host_page_size: page_size,
            sectors_per_host_page: geometry.sectors_per_host_page,
            host_pages_in_flash_page: geometry.host_pages_in_flash_page,
            nr_host_pages: nr_pages,
            state: spin::Mutex::new(MemFlashState {
                data: vec![0u8; nr_pages as usize * page_size],
                programs: vec![0u8; nr_flash_pages],
            }),
            trace: spin::Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Copy of one host page, as the medium currently holds it.
    pub fn read_page(&self, paddr: Paddr) -> Vec<u8> {
        let state = self.state.lock();
        let off = paddr as usize * self.host_page_size;
        state.data[off..off + self.host_page_size].to_vec()
    }

    /// Submission order observed by the device.
    pub fn submissions(&self) -> Vec<(Dir, Sector)> {
        self.trace.lock().clone()
    }

    /// Highest number of concurrently in-flight submissions seen.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::Acquire)
    }

    fn do_io(&self, rq: &mut DeviceRequest) -> Result<(), DeviceError> {
        if rq.data.is_empty() || rq.data.len() % self.host_page_size != 0 {
            return Err(DeviceError::Io);
        }
        let first_page = rq.sector / self.sectors_per_host_page as u64;
        let nr_pages = rq.data.len() / self.host_page_size;
        if first_page + nr_pages as u64 > self.nr_host_pages {
            return Err(DeviceError::OutOfBounds);
        }
        if rq.sector % self.sectors_per_host_page as u64 != 0 {
            // Sub-page transfers are not part of the contract.
            return Err(DeviceError::Io);
        }

        let mut state = self.state.lock();
        let base = first_page as usize * self.host_page_size;
        match rq.dir {
            Dir::Write => {
                let per_flash = self.host_pages_in_flash_page;
                let first_flash = first_page as usize / per_flash;
                let nr_flash = (nr_pages + per_flash - 1) / per_flash;
                for fp in first_flash..first_flash + nr_flash {
                    if state.programs[fp] as usize >= per_flash {
                        log::error!("memflash: flash page {} reprogrammed without erase", fp);
                        return Err(DeviceError::NotErased);
                    }
                }
                for fp in first_flash..first_flash + nr_flash {
                    state.programs[fp] += 1;
                }
                let end = base + rq.data.len();
                state.data[base..end].copy_from_slice(&rq.data);
            }
            Dir::Read => {
                let end = base + rq.data.len();
                rq.data.copy_from_slice(&state.data[base..end]);
            }
        }
        Ok(())
    }
}

impl FlashDevice for MemFlash {
    fn nr_host_pages(&self) -> u64 {
        self.nr_host_pages
    }

    fn submit(&self, rq: &mut DeviceRequest) -> Result<(), DeviceError> {
        let now = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        self.max_in_flight.fetch_max(now, Ordering::AcqRel);

        self.trace.lock().push((rq.dir, rq.sector));
        let result = self.do_io(rq);

        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        result
    }

    fn erase(&self, first_page: Paddr, nr_host_pages: usize) -> Result<(), DeviceError> {
        if first_page + nr_host_pages as u64 > self.nr_host_pages {
            return Err(DeviceError::OutOfBounds);
        }
        let mut state = self.state.lock();
        let base = first_page as usize * self.host_page_size;
        let end = base + nr_host_pages * self.host_page_size;
        for byte in &mut state.data[base..end] {
            *byte = 0;
        }
        let per_flash = self.host_pages_in_flash_page;
        let first_flash = first_page as usize / per_flash;
        let nr_flash = nr_host_pages / per_flash;
        for fp in &mut state.programs[first_flash..first_flash + nr_flash] {
            *fp = 0;
        }
        Ok(())
    }
}
