//! Supplemental page table.
//!
//! The hardware page table only knows about resident pages. For every
//! page that is valid but *not* resident, the supplemental page table
//! records where its contents live, as one of three backings:
//!
//! - [`PageLocation::Swap`]: a swap slot, for evicted anonymous pages.
//! - [`PageLocation::File`]: a byte range of a file, for pages of a
//!   memory-mapped region; only `len` bytes are valid, the rest of the
//!   page reads as zero.
//! - [`PageLocation::Zero`]: nothing to read at all; the page appears as
//!   zeroes on first touch.
//!
//! Each location travels inside a count-0/1 [`Semaphore`]: the ready
//! signal. Eviction inserts the entry *before* it starts writing the
//! page out and signals once the data is at rest, so a faulter that
//! races the eviction blocks on the signal instead of reading a slot or
//! file range that is still being filled. Lookup removes the entry
//! atomically; the removed entry stays alive (and waitable) through its
//! `Arc` until the faulter is done with it.

use crate::swap::{SwapIndex, SwapTable};
use rook::addressing::Vpn;
use rook::sync::Semaphore;
use rook_fs::file::File;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// Where the contents of a non-resident page live.
pub enum PageLocation {
    /// The page was evicted to this swap slot.
    Swap(SwapIndex),
    /// The page is read from a file: `len` bytes at `offset`, the tail
    /// of the page zero-filled.
    File {
        /// Backing file.
        file: File,
        /// Byte offset of this page's data within the file.
        offset: usize,
        /// Valid bytes at `offset`; at most one page.
        len: usize,
        /// Whether the mapping is writable.
        writable: bool,
    },
    /// The page is all zeroes; no read needed.
    Zero {
        /// Whether the mapping is writable.
        writable: bool,
    },
}

/// A page location plus its ready signal.
pub type LocationSlot = Semaphore<PageLocation>;

/// Per-process map from user virtual page to the location of its
/// non-resident contents.
#[derive(Default)]
pub struct SupplementalPageTable {
    entries: Mutex<BTreeMap<Vpn, Arc<LocationSlot>>>,
}

impl SupplementalPageTable {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, vpn: Vpn, location: PageLocation, ready: bool) -> Arc<LocationSlot> {
        let slot = Arc::new(Semaphore::new(ready as usize, location));
        let prev = self.entries.lock().unwrap().insert(vpn, slot.clone());
        debug_assert!(prev.is_none(), "page {:?} already had a location", vpn);
        slot
    }

    /// Record that `vpn` lives in swap slot `index`.
    ///
    /// `ready = false` for eviction-inserted entries whose write-out is
    /// still in flight; the inserter signals the returned slot when the
    /// I/O lands.
    pub fn add_swap(&self, vpn: Vpn, index: SwapIndex, ready: bool) -> Arc<LocationSlot> {
        self.insert(vpn, PageLocation::Swap(index), ready)
    }

    /// Record that `vpn` is backed by `len` bytes of `file` at `offset`.
    pub fn add_file(
        &self,
        vpn: Vpn,
        file: File,
        offset: usize,
        len: usize,
        writable: bool,
        ready: bool,
    ) -> Arc<LocationSlot> {
        self.insert(
            vpn,
            PageLocation::File {
                file,
                offset,
                len,
                writable,
            },
            ready,
        )
    }

    /// Record that `vpn` reads as zeroes.
    pub fn add_zero(&self, vpn: Vpn, writable: bool, ready: bool) -> Arc<LocationSlot> {
        self.insert(vpn, PageLocation::Zero { writable }, ready)
    }

    /// Look up the location of `vpn`, removing it atomically when
    /// `remove` is set.
    ///
    /// Callers must wait on the returned slot before using the location.
    pub fn lookup(&self, vpn: Vpn, remove: bool) -> Option<Arc<LocationSlot>> {
        let mut entries = self.entries.lock().unwrap();
        if remove {
            entries.remove(&vpn)
        } else {
            entries.get(&vpn).cloned()
        }
    }

    /// Unconditionally remove the entry of `vpn` (mapping teardown).
    pub fn remove(&self, vpn: Vpn) -> Option<Arc<LocationSlot>> {
        self.entries.lock().unwrap().remove(&vpn)
    }

    /// Number of recorded locations.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }

    /// Drop every entry, releasing the swap slots they reference.
    ///
    /// Waits out in-flight evictions so a slot is never released while
    /// its write is still landing.
    pub fn destroy(&self, swap: &SwapTable) {
        let entries: Vec<_> = {
            let mut map = self.entries.lock().unwrap();
            std::mem::take(&mut *map).into_values().collect()
        };
        for slot in entries {
            let location = slot.wait();
            if let PageLocation::Swap(index) = *location {
                swap.free(index);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rook::dev::MemDisk;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn lookup_removes_atomically() {
        let table = SupplementalPageTable::new();
        table.add_zero(Vpn(1), true, true);
        assert!(table.lookup(Vpn(1), false).is_some());
        assert!(table.lookup(Vpn(1), true).is_some());
        assert!(table.lookup(Vpn(1), true).is_none());
    }

    #[test]
    fn faulter_blocks_until_eviction_signals() {
        let table = Arc::new(SupplementalPageTable::new());
        let slot = table.add_swap(Vpn(7), SwapIndex(3), false);

        let faulter = {
            let table = table.clone();
            thread::spawn(move || {
                let slot = table.lookup(Vpn(7), true).unwrap();
                let location = slot.wait();
                match *location {
                    PageLocation::Swap(index) => index,
                    _ => unreachable!(),
                }
            })
        };
        thread::sleep(Duration::from_millis(20));
        // The "write-out" finishes now.
        slot.signal();
        assert_eq!(faulter.join().unwrap(), SwapIndex(3));
    }

    #[test]
    fn destroy_releases_swap_slots() {
        let swap = SwapTable::new(Arc::new(MemDisk::new(64)));
        let table = SupplementalPageTable::new();
        let a = swap.get().unwrap();
        let b = swap.get().unwrap();
        table.add_swap(Vpn(1), a, true);
        table.add_swap(Vpn(2), b, true);
        assert_eq!(swap.used_slots(), 2);

        table.destroy(&swap);
        assert_eq!(swap.used_slots(), 0);
        assert!(table.is_empty());
    }
}
