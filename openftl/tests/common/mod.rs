//! Shared helpers for the integration tests: small geometries, an FTL on an
//! in-memory device, and synchronous wrappers around the callback-based
//! request interface.

#![allow(dead_code)]

use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;

use openftl::{FlashGeometry, Ftl, FtlConfig, IoRequest, MemFlash};

/// Geometry with one host page per flash page and one sector per host page,
/// so logical addresses, physical addresses and sectors line up 1:1.
pub fn geometry(nr_pools: usize, blocks_per_pool: usize, pages_per_blk: usize) -> FlashGeometry {
    FlashGeometry {
        nr_pools,
        blocks_per_pool,
        flash_pages_per_blk: pages_per_blk,
        host_pages_in_flash_page: 1,
        sectors_per_host_page: 1,
    }
}

pub fn bring_up(geometry: FlashGeometry) -> (Arc<Ftl>, Arc<MemFlash>) {
    bring_up_with(FtlConfig::new(geometry))
}

pub fn bring_up_with(config: FtlConfig) -> (Arc<Ftl>, Arc<MemFlash>) {
    let device = Arc::new(MemFlash::new(&config.geometry));
    let ftl = Ftl::new(config, device.clone()).expect("FTL bring-up failed");
    (ftl, device)
}

/// One host page filled with `fill`.
pub fn page(ftl: &Ftl, fill: u8) -> Vec<u8> {
    vec![fill; ftl.geometry().host_page_size()]
}

/// Issue a write and return the completion channel.
pub fn write_async(ftl: &Ftl, laddr: u64, fill: u8) -> Receiver<i32> {
    let spp = ftl.geometry().sectors_per_host_page as u64;
    let (tx, rx) = mpsc::channel();
    let req = IoRequest::write(laddr * spp, page(ftl, fill)).with_end_io(move |_req, err| {
        let _ = tx.send(err);
    });
    ftl.map_request(req);
    rx
}

/// Write one host page and wait for its completion code.
pub fn write_sync(ftl: &Ftl, laddr: u64, fill: u8) -> i32 {
    write_async(ftl, laddr, fill)
        .recv()
        .expect("write completion dropped")
}

/// Read one host page, returning the completion code and the payload.
pub fn read_sync(ftl: &Ftl, laddr: u64) -> (i32, Vec<u8>) {
    let spp = ftl.geometry().sectors_per_host_page as u64;
    let (tx, rx) = mpsc::channel();
    let req = IoRequest::read(laddr * spp).with_end_io(move |req, err| {
        let _ = tx.send((err, req.data.clone()));
    });
    ftl.map_request(req);
    rx.recv().expect("read completion dropped")
}
