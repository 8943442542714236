//! Free-sector allocator for the file-system device.
//!
//! A bitmap with one bit per device sector. The inode layer asks for runs
//! of sectors while growing a file; the allocator satisfies as much of the
//! request as it can, and partial success is reported rather than rolled
//! back, so the caller can decide how to proceed.
//!
//! Sector 0 is always reserved: the on-disk pointer encoding treats sector
//! number zero as "unallocated".

use rook::dev::Sector;
use std::sync::Mutex;

struct FreeMapInner {
    // 1: in use, 0: free.
    bits: Vec<u64>,
    sectors: usize,
    free: usize,
}

impl FreeMapInner {
    fn is_used(&self, pos: usize) -> bool {
        let (pos, ofs) = (pos / 64, pos % 64);
        self.bits[pos] & (1 << ofs) != 0
    }

    fn set_used(&mut self, pos: usize) {
        let (pos, ofs) = (pos / 64, pos % 64);
        debug_assert_eq!(self.bits[pos] & (1 << ofs), 0);
        self.bits[pos] |= 1 << ofs;
    }

    fn set_free(&mut self, pos: usize) {
        let (pos, ofs) = (pos / 64, pos % 64);
        debug_assert_ne!(self.bits[pos] & (1 << ofs), 0);
        self.bits[pos] &= !(1 << ofs);
    }
}

/// Bitmap allocator of device sectors.
pub struct FreeMap {
    inner: Mutex<FreeMapInner>,
}

impl FreeMap {
    /// Create a map over `sectors` device sectors with the first
    /// `reserved` sectors (at least sector 0) pre-allocated.
    pub fn new(sectors: usize, reserved: usize) -> Self {
        let reserved = reserved.max(1);
        assert!(reserved <= sectors);
        let mut inner = FreeMapInner {
            bits: vec![0; sectors.div_ceil(64)],
            sectors,
            free: sectors - reserved,
        };
        for pos in 0..reserved {
            inner.set_used(pos);
        }
        Self {
            inner: Mutex::new(inner),
        }
    }

    /// Allocate a single sector.
    pub fn allocate_one(&self) -> Option<Sector> {
        let mut out = self.allocate(1);
        out.pop()
    }

    /// Allocate up to `cnt` sectors, first-fit.
    ///
    /// Returns fewer than `cnt` sectors (possibly none) when the map runs
    /// out; the sectors already handed out stay allocated.
    pub fn allocate(&self, cnt: usize) -> Vec<Sector> {
        let mut inner = self.inner.lock().unwrap();
        let mut out = Vec::with_capacity(cnt.min(inner.free));
        let mut pos = 0;
        while out.len() < cnt && pos < inner.sectors {
            // Skip fully used words.
            if pos % 64 == 0 && inner.bits[pos / 64] == u64::MAX {
                pos += 64;
                continue;
            }
            if !inner.is_used(pos) {
                inner.set_used(pos);
                inner.free -= 1;
                out.push(Sector(pos));
            }
            pos += 1;
        }
        out
    }

    /// Return `sector` to the map.
    pub fn release(&self, sector: Sector) {
        let mut inner = self.inner.lock().unwrap();
        inner.set_free(sector.into_usize());
        inner.free += 1;
    }

    /// Number of sectors currently free.
    pub fn free_sectors(&self) -> usize {
        self.inner.lock().unwrap().free
    }
}
