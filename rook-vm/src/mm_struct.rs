//! # Memory state of a process.
//!
//! [`MmStruct`] is the per-process memory record: the page table, the
//! supplemental page table of non-resident locations, and the list of
//! memory-mapped regions. It is the surface through which everything
//! above the VM core acts on user memory: faults, stack growth, mmap
//! and munmap, and byte-level user access from the kernel.
//!
//! ## Fault handling
//!
//! A fault on `va` rounds down to the page and consults the supplemental
//! page table, removing the entry atomically. If a location is found,
//! the faulter waits on its ready signal (eviction may still be writing
//! the page out), obtains a frame, fills it from swap, from the backing
//! file, or with zeroes, and installs the mapping. If no location is
//! found, the fault is legal only as stack growth: `va` at or above the
//! stack pointer, or at most 32 bytes below it, the span a push
//! instruction may touch before the stack pointer moves. Anything else
//! is illegal and the process dies.
//!
//! ## User access
//!
//! [`MmStruct::read_user`] and [`MmStruct::write_user`] are the kernel's
//! way to touch user buffers. They walk the page table, maintain the
//! hardware accessed and dirty bits, fault non-resident pages in, and
//! keep the frame pinned for the duration of each copy so the clock
//! cannot pull a page out from under an in-progress transfer.
//!
//! Teardown is automatic: dropping the [`MmStruct`] unmaps every region
//! (writing dirty mapped pages back to their files), frees every owned
//! frame, and releases every swap slot its pages still occupy.

use crate::frame::{FrameGetFlags, FrameTable};
use crate::page::{PageLocation, SupplementalPageTable};
use crate::page_table::PageTable;
use crate::swap::SwapTable;
use rook::KernelError;
use rook::addressing::{PAGE_SIZE, USER_TOP, Va, Vpn};
use rook::dev::BlockDevice;
use rook::mm::{FrameIndex, Page};
use rook_fs::file::File;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// The shared VM core: one frame table and one swap allocator serving
/// every process.
pub struct Vm {
    frames: FrameTable,
    swap: Arc<SwapTable>,
}

impl Vm {
    /// Build a VM core with `frame_count` user frames and swap on
    /// `swap_device`.
    pub fn new(frame_count: usize, swap_device: Arc<dyn BlockDevice>) -> Arc<Self> {
        let swap = Arc::new(SwapTable::new(swap_device));
        Arc::new(Self {
            frames: FrameTable::new(swap.clone(), frame_count),
            swap,
        })
    }

    /// The frame table.
    pub fn frames(&self) -> &FrameTable {
        &self.frames
    }

    /// The swap allocator.
    pub fn swap(&self) -> &SwapTable {
        &self.swap
    }
}

/// Identifier of one memory-mapped region within a process.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct MapId(u64);

pub(crate) struct VmArea {
    pub(crate) id: MapId,
    pub(crate) file: Option<File>,
    pub(crate) writable: bool,
    pub(crate) start: Vpn,
    pub(crate) len: usize,
    pub(crate) offset: usize,
}

impl VmArea {
    fn pages(&self) -> usize {
        self.len.div_ceil(PAGE_SIZE)
    }

    fn contains(&self, vpn: Vpn) -> bool {
        vpn >= self.start && vpn.into_usize() < self.start.into_usize() + self.pages()
    }
}

pub(crate) struct MmInner {
    pub(crate) vm: Arc<Vm>,
    pub(crate) page_table: Mutex<PageTable>,
    pub(crate) pages: SupplementalPageTable,
    pub(crate) areas: Mutex<Vec<VmArea>>,
    // Serializes fault handling within the process; eviction from other
    // threads does not take this lock.
    faulting: Mutex<()>,
    next_map_id: AtomicU64,
}

impl MmInner {
    /// The file range backing `vpn`, if `vpn` falls in a file-backed
    /// region. Pages of anonymous regions, stack pages, and mapped pages
    /// wholly past end of file evict to swap instead.
    pub(crate) fn file_backing(&self, vpn: Vpn) -> Option<(File, usize, usize, bool)> {
        let areas = self.areas.lock().unwrap();
        for area in areas.iter() {
            if area.contains(vpn) {
                let file = area.file.as_ref()?;
                let offset = area.offset + (vpn.into_usize() - area.start.into_usize()) * PAGE_SIZE;
                let len = PAGE_SIZE.min(file.len().saturating_sub(offset));
                if len == 0 {
                    return None;
                }
                return Some((file.clone(), offset, len, area.writable));
            }
        }
        None
    }
}

/// The memory state of one process.
pub struct MmStruct {
    inner: Arc<MmInner>,
}

impl MmStruct {
    /// A fresh, empty address space on the given VM core.
    pub fn new(vm: &Arc<Vm>) -> Self {
        Self {
            inner: Arc::new(MmInner {
                vm: vm.clone(),
                page_table: Mutex::new(PageTable::new()),
                pages: SupplementalPageTable::new(),
                areas: Mutex::new(Vec::new()),
                faulting: Mutex::new(()),
                next_map_id: AtomicU64::new(1),
            }),
        }
    }

    /// Number of pages currently resident in frames.
    pub fn resident_pages(&self) -> usize {
        self.inner.page_table.lock().unwrap().len()
    }

    /// Whether the page containing `va` is resident.
    pub fn is_resident(&self, va: Va) -> bool {
        self.inner.page_table.lock().unwrap().walk(va.page()).is_some()
    }

    /// Number of pages tracked as non-resident.
    pub fn tracked_pages(&self) -> usize {
        self.inner.pages.len()
    }

    /// Handle a page fault at `va` with user stack pointer `esp`.
    ///
    /// `pin` leaves the freshly installed frame pinned; the caller
    /// unpins via [`MmStruct::unpin_page`] when its transfer is done.
    ///
    /// Errors mean the fault is illegal and the faulting process should
    /// be terminated.
    pub fn handle_fault(&self, va: Va, esp: Va, pin: bool) -> Result<(), KernelError> {
        if !va.is_user() {
            return Err(KernelError::BadAddress);
        }
        let vpn = va.page();
        let _faulting = self.inner.faulting.lock().unwrap();
        // A racing fault may have brought the page in already.
        if self.inner.page_table.lock().unwrap().walk(vpn).is_some() {
            return Ok(());
        }
        let frames = self.inner.vm.frames();
        if let Some(slot) = self.inner.pages.lookup(vpn, true) {
            // Block until the contents are at rest in swap or file.
            let location = slot.wait();
            let (fi, writable) = match &*location {
                PageLocation::Swap(index) => {
                    let fi = frames.get(FrameGetFlags::empty());
                    let filled = frames.with_frame(fi, |page| self.inner.vm.swap.read(*index, page));
                    if let Err(e) = filled {
                        frames.free(fi);
                        return Err(e);
                    }
                    self.inner.vm.swap.free(*index);
                    (fi, true)
                }
                PageLocation::Zero { writable } => {
                    (frames.get(FrameGetFlags::ZERO), *writable)
                }
                PageLocation::File {
                    file,
                    offset,
                    len,
                    writable,
                } => {
                    let fi = frames.get(FrameGetFlags::empty());
                    let filled = frames.with_frame(fi, |page| -> Result<(), KernelError> {
                        let n = file.read_at(&mut page.inner_mut()[..*len], *offset)?;
                        page.inner_mut()[n..].fill(0);
                        Ok(())
                    });
                    if let Err(e) = filled {
                        frames.free(fi);
                        return Err(e);
                    }
                    (fi, *writable)
                }
            };
            drop(location);
            self.install(vpn, fi, writable, pin)
        } else if va >= esp || esp.into_usize() - va.into_usize() <= 32 {
            // Stack growth: a fresh zeroed writable page, unless the
            // page raced out to swap, in which case pull it back.
            let fi = frames.get(FrameGetFlags::ZERO);
            if let Some(slot) = self.inner.pages.lookup(vpn, true) {
                let location = slot.wait();
                if let PageLocation::Swap(index) = &*location {
                    let filled = frames.with_frame(fi, |page| self.inner.vm.swap.read(*index, page));
                    if let Err(e) = filled {
                        frames.free(fi);
                        return Err(e);
                    }
                    self.inner.vm.swap.free(*index);
                }
            }
            self.install(vpn, fi, true, pin)
        } else {
            Err(KernelError::InvalidAccess)
        }
    }

    /// Unpin the frame backing `va` after a pinned fault.
    pub fn unpin_page(&self, va: Va) {
        let fi = self.inner.page_table.lock().unwrap().walk(va.page()).map(|pte| pte.frame);
        if let Some(fi) = fi {
            self.inner.vm.frames().unpin(fi);
        }
    }

    /// Whether `[va, va + len)` is accessible for the given access kind,
    /// without faulting anything in.
    pub fn access_ok(&self, va: Va, len: usize, is_write: bool) -> bool {
        let Some(end) = va.into_usize().checked_add(len) else {
            return false;
        };
        if !va.is_user() || end > USER_TOP.into_usize() {
            return false;
        }
        let last = Va(end.saturating_sub(1)).page();
        let mut vpn = va.page();
        loop {
            let ok = {
                let pt = self.inner.page_table.lock().unwrap();
                match pt.walk(vpn) {
                    Some(pte) => !is_write || pte.is_writable(),
                    None => match self.inner.pages.lookup(vpn, false) {
                        Some(slot) => {
                            !is_write
                                || match slot.get() {
                                    PageLocation::Swap(_) => true,
                                    PageLocation::File { writable, .. } => *writable,
                                    PageLocation::Zero { writable } => *writable,
                                }
                        }
                        None => false,
                    },
                }
            };
            if !ok {
                return false;
            }
            if vpn == last {
                return true;
            }
            vpn = vpn + 1;
        }
    }

    /// Map `len` bytes at `va`: an anonymous region when `file` is
    /// `None`, otherwise the contents of `file` starting at `offset`.
    ///
    /// `va` and `offset` must be page-aligned, the range must lie in
    /// user space, and it must not overlap an existing mapping. Pages
    /// are populated on first fault, not here.
    pub fn mmap(
        &self,
        file: Option<File>,
        va: Va,
        len: usize,
        offset: usize,
        writable: bool,
    ) -> Result<MapId, KernelError> {
        if !va.is_page_aligned() || len == 0 || offset % PAGE_SIZE != 0 {
            return Err(KernelError::InvalidArgument);
        }
        let end = va.into_usize().checked_add(len).ok_or(KernelError::BadAddress)?;
        if !va.is_user() || end > USER_TOP.into_usize() {
            return Err(KernelError::BadAddress);
        }
        if let Some(f) = &file {
            if f.is_empty() {
                return Err(KernelError::InvalidArgument);
            }
        }

        let start = va.page();
        let pages = len.div_ceil(PAGE_SIZE);
        let mut areas = self.inner.areas.lock().unwrap();
        for k in 0..pages {
            let vpn = start + k;
            if areas.iter().any(|a| a.contains(vpn))
                || self.inner.page_table.lock().unwrap().walk(vpn).is_some()
                || self.inner.pages.lookup(vpn, false).is_some()
            {
                return Err(KernelError::InvalidArgument);
            }
        }

        let id = MapId(self.inner.next_map_id.fetch_add(1, Ordering::Relaxed));
        for k in 0..pages {
            let vpn = start + k;
            match &file {
                Some(f) => {
                    let fofs = offset + k * PAGE_SIZE;
                    let flen = f.len();
                    if fofs < flen {
                        let plen = PAGE_SIZE.min(flen - fofs);
                        self.inner.pages.add_file(vpn, f.clone(), fofs, plen, writable, true);
                    } else {
                        self.inner.pages.add_zero(vpn, writable, true);
                    }
                }
                None => {
                    self.inner.pages.add_zero(vpn, writable, true);
                }
            }
        }
        areas.push(VmArea {
            id,
            file,
            writable,
            start,
            len,
            offset,
        });
        log::debug!("mmap {:?}: {} pages at {:?}", id, pages, start);
        Ok(id)
    }

    /// Tear down the region `id`.
    ///
    /// Dirty resident pages of a writable file mapping are written back
    /// to the file; every frame and swap slot of the region is released.
    pub fn munmap(&self, id: MapId) -> Result<(), KernelError> {
        let area = {
            let mut areas = self.inner.areas.lock().unwrap();
            let at = areas
                .iter()
                .position(|a| a.id == id)
                .ok_or(KernelError::NoSuchEntry)?;
            areas.remove(at)
        };
        for k in 0..area.pages() {
            self.reclaim_page(area.start + k, Some(&area), k);
        }
        Ok(())
    }

    /// Copy `buf.len()` bytes of user memory at `va` into `buf`.
    ///
    /// Faults pages in as needed, growing the stack against `esp`.
    pub fn read_user(&self, va: Va, esp: Va, buf: &mut [u8]) -> Result<usize, KernelError> {
        self.user_copy(va, esp, buf.len(), false, |page, ofs, chunk, done| {
            buf[done..done + chunk].copy_from_slice(&page.inner()[ofs..ofs + chunk]);
        })
    }

    /// Copy `buf` into user memory at `va`.
    ///
    /// Faults pages in as needed, growing the stack against `esp`.
    /// Writing through a read-only mapping fails with `InvalidAccess`.
    pub fn write_user(&self, va: Va, esp: Va, buf: &[u8]) -> Result<usize, KernelError> {
        self.user_copy(va, esp, buf.len(), true, |page, ofs, chunk, done| {
            page.inner_mut()[ofs..ofs + chunk].copy_from_slice(&buf[done..done + chunk]);
        })
    }

    fn user_copy(
        &self,
        va: Va,
        esp: Va,
        len: usize,
        is_write: bool,
        mut copy: impl FnMut(&mut Page, usize, usize, usize),
    ) -> Result<usize, KernelError> {
        if len == 0 {
            return Ok(0);
        }
        let end = va.into_usize().checked_add(len).ok_or(KernelError::BadAddress)?;
        if !va.is_user() || end > USER_TOP.into_usize() {
            return Err(KernelError::BadAddress);
        }
        let frames = self.inner.vm.frames();
        let mut done = 0;
        while done < len {
            let pos = va + done;
            let ofs = pos.page_offset();
            let chunk = (len - done).min(PAGE_SIZE - ofs);
            let (fi, was_pinned) = self.pin_resident(pos, esp, is_write)?;
            frames.with_frame(fi, |page| copy(page, ofs, chunk, done));
            if !was_pinned {
                frames.unpin(fi);
            }
            done += chunk;
        }
        Ok(done)
    }

    /// Walk-to-pin loop: make the page of `va` resident, touched, and
    /// pinned against eviction, then return its frame and whether it was
    /// pinned before (so the borrowed pin can be restored).
    fn pin_resident(&self, va: Va, esp: Va, is_write: bool) -> Result<(FrameIndex, bool), KernelError> {
        let vpn = va.page();
        loop {
            let fi = {
                let mut pt = self.inner.page_table.lock().unwrap();
                match pt.walk_mut(vpn) {
                    Some(pte) => {
                        if is_write && !pte.is_writable() {
                            return Err(KernelError::InvalidAccess);
                        }
                        pte.touch(is_write);
                        Some(pte.frame)
                    }
                    None => None,
                }
            };
            match fi {
                Some(fi) => {
                    if let Some(was_pinned) = self.inner.vm.frames().pin_for(fi, &self.inner, vpn) {
                        return Ok((fi, was_pinned));
                    }
                    // Evicted between the walk and the pin; fault it
                    // back in on the next turn.
                }
                None => self.handle_fault(va, esp, false)?,
            }
            std::thread::yield_now();
        }
    }

    fn install(&self, vpn: Vpn, fi: FrameIndex, writable: bool, pinned: bool) -> Result<(), KernelError> {
        {
            let mut pt = self.inner.page_table.lock().unwrap();
            if let Err(e) = pt.map(vpn, fi, writable) {
                drop(pt);
                self.inner.vm.frames().free(fi);
                return Err(e);
            }
        }
        self.inner.vm.frames().install(fi, &self.inner, vpn, pinned);
        Ok(())
    }

    /// Release one page of the address space: its frame if resident
    /// (writing it back to `area`'s file when dirty), its recorded
    /// location otherwise.
    fn reclaim_page(&self, vpn: Vpn, area: Option<&VmArea>, k: usize) {
        let frames = self.inner.vm.frames();
        loop {
            let fi = self.inner.page_table.lock().unwrap().walk(vpn).map(|pte| pte.frame);
            match fi {
                Some(fi) => {
                    if frames.pin_for(fi, &self.inner, vpn).is_none() {
                        // An eviction is moving this page; once it
                        // finishes, the location shows up in the
                        // supplemental table.
                        std::thread::yield_now();
                        continue;
                    }
                    let pte = self.inner.page_table.lock().unwrap().unmap(vpn).unwrap();
                    if pte.is_dirty() {
                        if let Some(area) = area {
                            if let (Some(file), true) = (&area.file, area.writable) {
                                let offset = area.offset + k * PAGE_SIZE;
                                let len = PAGE_SIZE.min(file.len().saturating_sub(offset));
                                if len > 0 {
                                    let written = frames.with_frame(fi, |page| {
                                        file.write_at(&page.inner()[..len], offset)
                                    });
                                    if let Err(e) = written {
                                        log::warn!("munmap: write-back of {:?} failed: {:?}", vpn, e);
                                    }
                                }
                            }
                        }
                    }
                    frames.free(fi);
                    return;
                }
                None => {
                    if let Some(slot) = self.inner.pages.remove(vpn) {
                        let location = slot.wait();
                        if let PageLocation::Swap(index) = &*location {
                            self.inner.vm.swap.free(*index);
                        }
                    }
                    return;
                }
            }
        }
    }
}

impl Drop for MmStruct {
    fn drop(&mut self) {
        let ids: Vec<MapId> = self.inner.areas.lock().unwrap().iter().map(|a| a.id).collect();
        for id in ids {
            let _ = self.munmap(id);
        }
        // Frames still mapped (stack pages and the like) go back to the
        // pool; eviction may concurrently move pages out from under us,
        // so sweep until the page table is empty.
        loop {
            let vpns = self.inner.page_table.lock().unwrap().mapped();
            if vpns.is_empty() {
                break;
            }
            for vpn in vpns {
                self.reclaim_page(vpn, None, 0);
            }
        }
        // Whatever lives in swap dies with the process.
        self.inner.pages.destroy(&self.inner.vm.swap);
    }
}
