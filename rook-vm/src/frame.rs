//! Physical frame table and clock eviction.
//!
//! One record per physical user frame: whether the frame backs a live
//! user page, whether it is pinned, and which process page it backs. The
//! owner link is weak; a process that exits invalidates it by freeing its
//! frames, and the clock treats a dangling owner as a free frame.
//!
//! ## Replacement
//!
//! [`FrameTable::get`] serves requests from the free pool first. When the
//! pool is dry, a clock hand sweeps the records, skipping absent and
//! pinned frames. A frame whose page-table accessed bit is set gets a
//! second chance (the bit is cleared and the hand moves on); the first
//! frame found with the bit clear is the victim. The sweep approximates
//! LRU with O(1) amortized work and no bookkeeping beyond the hardware
//! bit, and the choice is deterministic given the bit pattern and the
//! hand position.
//!
//! ## Eviction handshake
//!
//! Still under the frame lock, the victim's page-table entry is removed
//! (so further accesses trap) and a **not-ready** location is recorded in
//! the owner's supplemental page table: a fresh swap slot, or the backing
//! file range when the page belongs to a memory-mapped region. Only then
//! is the frame lock released for the write-out: swap always, file only
//! if the hardware dirty bit was set. Signalling the location ready
//! completes the handoff; a faulter that raced the eviction has been
//! blocked on that signal the whole time, never on the frame lock.

use crate::mm_struct::MmInner;
use crate::page::LocationSlot;
use crate::swap::{SwapIndex, SwapTable};
use bitflags::bitflags;
use crossbeam_queue::ArrayQueue;
use rook::addressing::Vpn;
use rook::mm::{FrameIndex, Page};
use rook_fs::file::File;
use std::sync::{Arc, Mutex, Weak};

bitflags! {
    /// Options for [`FrameTable::get`].
    pub struct FrameGetFlags: u32 {
        /// Zero the frame before handing it out.
        const ZERO = 1 << 0;
    }
}

struct FrameRecord {
    present: bool,
    pinned: bool,
    owner: Option<(Weak<MmInner>, Vpn)>,
}

impl FrameRecord {
    const fn empty() -> Self {
        Self {
            present: false,
            pinned: false,
            owner: None,
        }
    }
}

struct FrameMeta {
    records: Vec<FrameRecord>,
    hand: usize,
}

/// What eviction has to push out before the location becomes ready.
enum WriteOut {
    Swap(SwapIndex),
    File {
        file: File,
        offset: usize,
        len: usize,
    },
    Clean,
}

/// The table of physical user frames.
pub struct FrameTable {
    swap: Arc<SwapTable>,
    frames: Vec<Mutex<Page>>,
    meta: Mutex<FrameMeta>,
    free: ArrayQueue<FrameIndex>,
}

impl FrameTable {
    /// Build a table of `frame_count` frames, all free.
    pub fn new(swap: Arc<SwapTable>, frame_count: usize) -> Self {
        assert!(frame_count > 0);
        log::info!("frame table: {} user frames", frame_count);
        let free = ArrayQueue::new(frame_count);
        for i in 0..frame_count {
            free.push(FrameIndex(i)).unwrap();
        }
        Self {
            swap,
            frames: (0..frame_count).map(|_| Mutex::new(Page::new())).collect(),
            meta: Mutex::new(FrameMeta {
                records: (0..frame_count).map(|_| FrameRecord::empty()).collect(),
                hand: 0,
            }),
            free,
        }
    }

    /// Number of frames in the table.
    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Number of frames in the free pool.
    pub fn free_frames(&self) -> usize {
        self.free.len()
    }

    /// Obtain a frame, evicting a victim if the free pool is dry.
    ///
    /// The returned frame backs no page yet, so the clock cannot take it
    /// back before [`install`] publishes it.
    ///
    /// [`install`]: FrameTable::install
    pub fn get(&self, flags: FrameGetFlags) -> FrameIndex {
        let fi = match self.free.pop() {
            Some(fi) => fi,
            None => self.evict(),
        };
        if flags.contains(FrameGetFlags::ZERO) {
            self.frames[fi.into_usize()].lock().unwrap().clear();
        }
        fi
    }

    /// Return `fi` to the free pool, clearing its record.
    pub fn free(&self, fi: FrameIndex) {
        {
            let mut meta = self.meta.lock().unwrap();
            let record = &mut meta.records[fi.into_usize()];
            record.present = false;
            record.pinned = false;
            record.owner = None;
        }
        if self.free.push(fi).is_err() {
            debug_assert!(false, "frame {:?} freed twice", fi);
        }
    }

    /// Mark `fi` ineligible for eviction.
    pub fn pin(&self, fi: FrameIndex) {
        self.meta.lock().unwrap().records[fi.into_usize()].pinned = true;
    }

    /// Make `fi` eligible for eviction again.
    pub fn unpin(&self, fi: FrameIndex) {
        self.meta.lock().unwrap().records[fi.into_usize()].pinned = false;
    }

    /// Pin `fi` only if it still backs `(owner, vpn)`.
    ///
    /// Returns the previous pin state on success, so a caller that
    /// borrowed the pin can restore it. `None` means an eviction claimed
    /// the frame first; the caller should re-walk its page table and
    /// fault the page back in.
    pub(crate) fn pin_for(&self, fi: FrameIndex, owner: &Arc<MmInner>, vpn: Vpn) -> Option<bool> {
        let mut meta = self.meta.lock().unwrap();
        let record = &mut meta.records[fi.into_usize()];
        match &record.owner {
            Some((weak, v)) if record.present && *v == vpn && weak.ptr_eq(&Arc::downgrade(owner)) => {
                let was_pinned = record.pinned;
                record.pinned = true;
                Some(was_pinned)
            }
            _ => None,
        }
    }

    /// Publish `fi` as backing `(owner, vpn)`.
    ///
    /// Called once the hardware mapping is installed.
    pub(crate) fn install(&self, fi: FrameIndex, owner: &Arc<MmInner>, vpn: Vpn, pinned: bool) {
        let mut meta = self.meta.lock().unwrap();
        let record = &mut meta.records[fi.into_usize()];
        record.present = true;
        record.pinned = pinned;
        record.owner = Some((Arc::downgrade(owner), vpn));
    }

    /// Access the contents of `fi`.
    ///
    /// The caller must hold the frame: either it is pinned for the
    /// caller, or not yet published.
    pub(crate) fn with_frame<R>(&self, fi: FrameIndex, f: impl FnOnce(&mut Page) -> R) -> R {
        let mut page = self.frames[fi.into_usize()].lock().unwrap();
        f(&mut page)
    }

    /// Evict a victim frame and return it.
    fn evict(&self) -> FrameIndex {
        loop {
            let mut meta = self.meta.lock().unwrap();
            let count = meta.records.len();
            let mut picked = None;
            for _ in 0..2 * count {
                let i = meta.hand;
                meta.hand = (meta.hand + 1) % count;
                let record = &mut meta.records[i];
                if !record.present || record.pinned {
                    continue;
                }
                let Some((weak, vpn)) = record.owner.clone() else {
                    continue;
                };
                let Some(owner) = weak.upgrade() else {
                    // The owner is gone; the frame is reclaimable as-is.
                    record.present = false;
                    record.owner = None;
                    return FrameIndex(i);
                };
                let mut pt = owner.page_table.lock().unwrap();
                match pt.walk_mut(vpn) {
                    Some(pte) if pte.is_accessed() => {
                        // Second chance.
                        pte.clear_accessed();
                    }
                    _ => {
                        drop(pt);
                        picked = Some((FrameIndex(i), owner, vpn));
                        break;
                    }
                }
            }
            let Some((fi, owner, vpn)) = picked else {
                // Every candidate is pinned right now; pins are
                // transient, so try again shortly.
                drop(meta);
                std::thread::yield_now();
                continue;
            };

            // The frame stops backing the page; further accesses trap.
            {
                let record = &mut meta.records[fi.into_usize()];
                record.present = false;
                record.owner = None;
            }
            let pte = owner.page_table.lock().unwrap().unmap(vpn);
            let dirty = pte.map(|p| p.is_dirty()).unwrap_or(false);

            // Record where the page is headed before the write-out
            // starts: a faulter blocks on the not-ready location, not on
            // the frame lock.
            let (write_out, slot): (WriteOut, Arc<LocationSlot>) = match owner.file_backing(vpn) {
                Some((file, offset, len, writable)) => {
                    let slot = owner
                        .pages
                        .add_file(vpn, file.clone(), offset, len, writable, false);
                    let out = if dirty {
                        WriteOut::File { file, offset, len }
                    } else {
                        WriteOut::Clean
                    };
                    (out, slot)
                }
                None => {
                    let index = self.swap.get().expect("out of swap");
                    let slot = owner.pages.add_swap(vpn, index, false);
                    (WriteOut::Swap(index), slot)
                }
            };
            drop(meta);

            match &write_out {
                WriteOut::Swap(index) => {
                    log::debug!("evict {:?}: page {:?} -> swap {:?}", fi, vpn, index);
                    let page = self.frames[fi.into_usize()].lock().unwrap();
                    if let Err(e) = self.swap.write(*index, &page) {
                        log::warn!("evict {:?}: swap write failed: {:?}", fi, e);
                    }
                }
                WriteOut::File { file, offset, len } => {
                    log::debug!("evict {:?}: page {:?} -> file @{}", fi, vpn, offset);
                    let page = self.frames[fi.into_usize()].lock().unwrap();
                    if let Err(e) = file.write_at(&page.inner()[..*len], *offset) {
                        log::warn!("evict {:?}: file write-back failed: {:?}", fi, e);
                    }
                }
                WriteOut::Clean => {}
            }
            slot.signal();
            return fi;
        }
    }
}
