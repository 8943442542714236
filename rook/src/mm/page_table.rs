//! Page-table entries.
//!
//! A [`Pte`] maps one user virtual page to the physical frame backing it,
//! plus the per-entry flag bits. On real hardware the MMU maintains the
//! [`PteFlags::ACCESSED`] and [`PteFlags::DIRTY`] bits as a side effect of
//! loads and stores; in the hosted core the user-memory access paths set
//! them explicitly. Either way, the page replacement policy only ever goes
//! through the helpers here, so the rest of the kernel is indifferent to
//! who maintains the bits.

use crate::mm::FrameIndex;
use bitflags::bitflags;

bitflags! {
    /// Flag bits of a page-table entry.
    pub struct PteFlags: u32 {
        /// The entry maps a frame.
        const PRESENT = 1 << 0;
        /// Stores through this mapping are permitted.
        const WRITABLE = 1 << 1;
        /// The mapping has been read or written since the bit was cleared.
        const ACCESSED = 1 << 2;
        /// The mapping has been written since it was installed.
        const DIRTY = 1 << 3;
    }
}

/// A page-table entry: the frame backing one user virtual page.
#[derive(Debug, Clone, Copy)]
pub struct Pte {
    /// The physical frame this entry maps.
    pub frame: FrameIndex,
    /// Entry flag bits.
    pub flags: PteFlags,
}

impl Pte {
    /// Build a present entry for `frame`.
    pub fn new(frame: FrameIndex, writable: bool) -> Self {
        let mut flags = PteFlags::PRESENT;
        if writable {
            flags |= PteFlags::WRITABLE;
        }
        Self { frame, flags }
    }

    /// Whether this entry maps a frame.
    #[inline]
    pub fn is_present(&self) -> bool {
        self.flags.contains(PteFlags::PRESENT)
    }

    /// Whether stores through this entry are permitted.
    #[inline]
    pub fn is_writable(&self) -> bool {
        self.flags.contains(PteFlags::WRITABLE)
    }

    /// Read the hardware accessed bit.
    #[inline]
    pub fn is_accessed(&self) -> bool {
        self.flags.contains(PteFlags::ACCESSED)
    }

    /// Clear the hardware accessed bit.
    #[inline]
    pub fn clear_accessed(&mut self) {
        self.flags.remove(PteFlags::ACCESSED);
    }

    /// Read the hardware dirty bit.
    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.flags.contains(PteFlags::DIRTY)
    }

    /// Mark the entry accessed, and dirty for a store.
    #[inline]
    pub fn touch(&mut self, is_write: bool) {
        self.flags.insert(PteFlags::ACCESSED);
        if is_write {
            self.flags.insert(PteFlags::DIRTY);
        }
    }
}
