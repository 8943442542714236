//! Swap slot allocator.
//!
//! The swap device is carved into page-sized slots: slot `i` occupies
//! sectors `[8i, 8(i+1))`, with no on-disk header. A slot stores exactly
//! one evicted page. The allocator lock covers only the slot bitmap;
//! slot I/O runs outside it, so two threads can be pushing different
//! pages to swap at once.
//!
//! Swap exhaustion is fatal to the caller by policy: the eviction path
//! has nowhere else to put a page, so it panics rather than retry.

use rook::KernelError;
use rook::dev::{BlockDevice, SECTOR_SIZE, Sector};
use rook::mm::{Page, SECTORS_PER_PAGE};
use std::sync::{Arc, Mutex};

/// Index of a page-sized swap slot.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd)]
pub struct SwapIndex(pub usize);

struct SwapMap {
    // true: slot is free.
    free: Vec<bool>,
    used: usize,
}

/// The swap slot allocator over one block device.
pub struct SwapTable {
    device: Arc<dyn BlockDevice>,
    map: Mutex<SwapMap>,
}

impl SwapTable {
    /// Carve `device` into page-sized slots.
    pub fn new(device: Arc<dyn BlockDevice>) -> Self {
        let slots = device.sector_count() / SECTORS_PER_PAGE;
        log::info!("swap: {} page slots", slots);
        Self {
            device,
            map: Mutex::new(SwapMap {
                free: vec![true; slots],
                used: 0,
            }),
        }
    }

    /// Number of slots on the device.
    pub fn slot_count(&self) -> usize {
        self.map.lock().unwrap().free.len()
    }

    /// Number of slots currently in use.
    pub fn used_slots(&self) -> usize {
        self.map.lock().unwrap().used
    }

    /// Claim the first free slot, or `None` when swap is exhausted.
    pub fn get(&self) -> Option<SwapIndex> {
        let mut map = self.map.lock().unwrap();
        let i = map.free.iter().position(|&f| f)?;
        map.free[i] = false;
        map.used += 1;
        Some(SwapIndex(i))
    }

    /// Return slot `index` to the allocator.
    pub fn free(&self, index: SwapIndex) {
        let mut map = self.map.lock().unwrap();
        debug_assert!(!map.free[index.0]);
        map.free[index.0] = true;
        map.used -= 1;
    }

    /// Copy one page into slot `index`.
    pub fn write(&self, index: SwapIndex, page: &Page) -> Result<(), KernelError> {
        let base = Sector(index.0 * SECTORS_PER_PAGE);
        for (i, chunk) in page.inner().chunks_exact(SECTOR_SIZE).enumerate() {
            self.device.write(base + i, chunk.try_into().unwrap())?;
        }
        Ok(())
    }

    /// Copy slot `index` into one page.
    pub fn read(&self, index: SwapIndex, page: &mut Page) -> Result<(), KernelError> {
        let base = Sector(index.0 * SECTORS_PER_PAGE);
        for (i, chunk) in page.inner_mut().chunks_exact_mut(SECTOR_SIZE).enumerate() {
            self.device.read(base + i, chunk.try_into().unwrap())?;
        }
        Ok(())
    }
}
