//! # Indexed inodes.
//!
//! An inode is the authoritative metadata of one file: its length and the
//! tiered index ([`crate::disk_layout`]) that maps file-relative sector
//! indices to device sectors. Every access goes through the buffer cache,
//! data and index blocks alike.
//!
//! ## One in-memory inode per on-disk inode
//!
//! The kernel must present a single, coherent view of each inode no
//! matter how many openers it has. [`InodeTable`] maintains that view:
//! opening an inode that is already open returns the existing [`Inode`]
//! with its open count raised, and the in-memory inode is destroyed only
//! when the last opener closes it. If the inode was removed while open,
//! the final close releases the inode sector, every data sector, and the
//! index sectors themselves back to the free map.
//!
//! The in-memory inode caches its on-disk image, so length queries do not
//! touch the cache; the image is written through the buffer cache
//! whenever growth changes it.
//!
//! ## Growth
//!
//! Writing past the end of a file extends it. Extension fills the direct
//! tier first, then the indirect, then the doubly-indirect, allocating
//! (and zeroing) index blocks on demand and zeroing every fresh data
//! sector through the cache. The free map may satisfy a request
//! partially; extension then fails with `NoSpace` and already-placed
//! sectors stay allocated. Callers see a failed write, not a rollback.

use crate::cache::BufferCache;
use crate::disk_layout::{
    DIRECT_SLOTS, DOUBLY_BASE, DiskInode, INODE_MAGIC, IndirectBlock, MAX_LENGTH, MAX_SECTORS,
    PTRS_PER_INDIRECT, SectorPtr,
};
use crate::free_map::FreeMap;
use rook::KernelError;
use rook::dev::{SECTOR_SIZE, Sector};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

static ZEROS: [u8; SECTOR_SIZE] = [0; SECTOR_SIZE];

/// The open-inode table: deduplicates in-memory inodes by sector and
/// owns the machinery (cache and free map) they operate on.
pub struct InodeTable {
    cache: Arc<BufferCache>,
    free_map: Arc<FreeMap>,
    open: Mutex<BTreeMap<Sector, Arc<Inode>>>,
}

struct InodeState {
    disk: Box<DiskInode>,
    open_cnt: usize,
    removed: bool,
    deny_write_cnt: usize,
}

/// An in-memory inode shared by every opener of one on-disk inode.
pub struct Inode {
    sector: Sector,
    cache: Arc<BufferCache>,
    free_map: Arc<FreeMap>,
    state: Mutex<InodeState>,
}

impl InodeTable {
    /// Build a table over a cache and free map.
    pub fn new(cache: Arc<BufferCache>, free_map: Arc<FreeMap>) -> Self {
        Self {
            cache,
            free_map,
            open: Mutex::new(BTreeMap::new()),
        }
    }

    /// The buffer cache behind this table.
    pub fn cache(&self) -> &Arc<BufferCache> {
        &self.cache
    }

    /// The free map behind this table.
    pub fn free_map(&self) -> &Arc<FreeMap> {
        &self.free_map
    }

    /// Create an inode of `length` bytes and persist it.
    ///
    /// Returns the sector naming the new inode. Data sectors covering
    /// `length` are allocated and zeroed.
    pub fn create(&self, length: usize) -> Result<Sector, KernelError> {
        let sector = self.free_map.allocate_one().ok_or(KernelError::NoSpace)?;
        let mut disk = Box::new(DiskInode::default());
        extend_length(&self.cache, &self.free_map, &mut disk, length, true)?;
        disk.write_to(&self.cache, sector)?;
        Ok(sector)
    }

    /// Open the inode at `sector`, deduplicating concurrent openers.
    pub fn open(&self, sector: Sector) -> Result<Arc<Inode>, KernelError> {
        let mut open = self.open.lock().unwrap();
        if let Some(inode) = open.get(&sector) {
            inode.state.lock().unwrap().open_cnt += 1;
            return Ok(inode.clone());
        }
        let disk = DiskInode::read_from(&self.cache, sector)?;
        if disk.magic != INODE_MAGIC {
            return Err(KernelError::FilesystemCorrupted("inode magic mismatch"));
        }
        let inode = Arc::new(Inode {
            sector,
            cache: self.cache.clone(),
            free_map: self.free_map.clone(),
            state: Mutex::new(InodeState {
                disk,
                open_cnt: 1,
                removed: false,
                deny_write_cnt: 0,
            }),
        });
        open.insert(sector, inode.clone());
        Ok(inode)
    }

    /// Raise the open count of an already-open inode.
    pub fn reopen(&self, inode: &Arc<Inode>) {
        let _open = self.open.lock().unwrap();
        inode.state.lock().unwrap().open_cnt += 1;
    }

    /// Drop one open reference.
    ///
    /// The last close removes the inode from the table; if the inode was
    /// removed, its data sectors, its index blocks, and the inode sector
    /// itself go back to the free map.
    pub fn close(&self, inode: &Arc<Inode>) -> Result<(), KernelError> {
        let mut open = self.open.lock().unwrap();
        let mut state = inode.state.lock().unwrap();
        assert!(state.open_cnt > 0);
        state.open_cnt -= 1;
        if state.open_cnt > 0 {
            return Ok(());
        }
        open.remove(&inode.sector);
        if state.removed {
            inode.free_sectors(&state.disk)?;
            self.free_map.release(inode.sector);
        }
        Ok(())
    }

    /// Number of inodes currently open.
    pub fn open_count(&self) -> usize {
        self.open.lock().unwrap().len()
    }
}

impl Inode {
    /// The sector naming this inode on disk.
    pub fn sector(&self) -> Sector {
        self.sector
    }

    /// Length of the file, in bytes.
    pub fn length(&self) -> usize {
        self.state.lock().unwrap().disk.length as usize
    }

    /// Mark this inode to be deleted when the last opener closes it.
    pub fn remove(&self) {
        self.state.lock().unwrap().removed = true;
    }

    /// Disable writes. May be called at most once per opener.
    pub fn deny_write(&self) {
        let mut state = self.state.lock().unwrap();
        state.deny_write_cnt += 1;
        assert!(state.deny_write_cnt <= state.open_cnt);
    }

    /// Re-enable writes. Must pair with a previous [`Inode::deny_write`].
    pub fn allow_write(&self) {
        let mut state = self.state.lock().unwrap();
        assert!(state.deny_write_cnt > 0);
        assert!(state.deny_write_cnt <= state.open_cnt);
        state.deny_write_cnt -= 1;
    }

    /// Read up to `buf.len()` bytes starting at byte `offset`.
    ///
    /// Returns the number of bytes actually read, which is less than
    /// requested when the read crosses end of file.
    pub fn read_at(&self, buf: &mut [u8], offset: usize) -> Result<usize, KernelError> {
        let state = self.state.lock().unwrap();
        let length = state.disk.length as usize;
        let mut read = 0;
        while read < buf.len() {
            let pos = offset + read;
            if pos >= length {
                break;
            }
            let sector_ofs = pos % SECTOR_SIZE;
            let chunk = (buf.len() - read)
                .min(SECTOR_SIZE - sector_ofs)
                .min(length - pos);
            let Some(sector) = index_to_sector(&self.cache, &state.disk, pos / SECTOR_SIZE)? else {
                break;
            };
            self.cache
                .read(sector, sector_ofs, &mut buf[read..read + chunk])?;
            read += chunk;
        }
        Ok(read)
    }

    /// Write `buf` at byte `offset`, extending the file if the write
    /// lands past end of file.
    ///
    /// Returns the number of bytes written: `0` when writes are denied,
    /// `Err(NoSpace)` when extension runs out of sectors.
    pub fn write_at(&self, buf: &[u8], offset: usize) -> Result<usize, KernelError> {
        let mut state = self.state.lock().unwrap();
        if state.deny_write_cnt > 0 {
            return Ok(0);
        }
        if offset + buf.len() > state.disk.length as usize {
            extend_length(
                &self.cache,
                &self.free_map,
                &mut state.disk,
                offset + buf.len(),
                false,
            )?;
            state.disk.write_to(&self.cache, self.sector)?;
        }
        let length = state.disk.length as usize;
        let mut written = 0;
        while written < buf.len() {
            let pos = offset + written;
            if pos >= length {
                break;
            }
            let sector_ofs = pos % SECTOR_SIZE;
            let chunk = (buf.len() - written)
                .min(SECTOR_SIZE - sector_ofs)
                .min(length - pos);
            let Some(sector) = index_to_sector(&self.cache, &state.disk, pos / SECTOR_SIZE)? else {
                break;
            };
            self.cache
                .write(sector, sector_ofs, &buf[written..written + chunk])?;
            written += chunk;
        }
        Ok(written)
    }

    /// Release every sector this inode references.
    fn free_sectors(&self, disk: &DiskInode) -> Result<(), KernelError> {
        for idx in 0..disk.sectors() {
            if let Some(sector) = index_to_sector(&self.cache, disk, idx)? {
                self.free_map.release(sector);
            }
        }
        if let Some(ind) = disk.indirect {
            self.free_map.release(ind.get());
        }
        if let Some(doubly) = disk.doubly_indirect {
            let outer = IndirectBlock::read_from(&self.cache, doubly.get())?;
            for sub in outer.iter().flatten() {
                self.free_map.release(sub.get());
            }
            self.free_map.release(doubly.get());
        }
        Ok(())
    }
}

/// Map a file-relative sector index to the device sector holding it.
///
/// `None` means the index is within bounds but unallocated. An index past
/// the largest file the format can express is fatal.
fn index_to_sector(
    cache: &BufferCache,
    disk: &DiskInode,
    idx: usize,
) -> Result<Option<Sector>, KernelError> {
    if idx < DIRECT_SLOTS {
        Ok(disk.direct[idx].map(SectorPtr::get))
    } else if idx < DOUBLY_BASE {
        let Some(ind) = disk.indirect else {
            return Ok(None);
        };
        let block = IndirectBlock::read_from(cache, ind.get())?;
        Ok(block[idx - DIRECT_SLOTS].map(SectorPtr::get))
    } else if idx < MAX_SECTORS {
        let Some(doubly) = disk.doubly_indirect else {
            return Ok(None);
        };
        let outer = IndirectBlock::read_from(cache, doubly.get())?;
        let Some(sub) = outer[(idx - DOUBLY_BASE) / PTRS_PER_INDIRECT] else {
            return Ok(None);
        };
        let inner = IndirectBlock::read_from(cache, sub.get())?;
        Ok(inner[(idx - DOUBLY_BASE) % PTRS_PER_INDIRECT].map(SectorPtr::get))
    } else {
        panic!("file too long");
    }
}

/// Grow `disk` to cover `new_length` bytes.
///
/// Fills the direct tier, then the indirect, then the doubly-indirect.
/// On success updates `length`. On allocation failure returns `NoSpace`;
/// sectors already placed stay allocated and recorded.
pub(crate) fn extend_length(
    cache: &BufferCache,
    free_map: &FreeMap,
    disk: &mut DiskInode,
    new_length: usize,
    create: bool,
) -> Result<(), KernelError> {
    if new_length > MAX_LENGTH {
        panic!("file too long");
    }
    let current = if create { 0 } else { disk.length as usize };
    if new_length <= current {
        if create {
            disk.length = new_length as i32;
        }
        return Ok(());
    }

    let mut start = current.div_ceil(SECTOR_SIZE);
    let mut need = new_length.div_ceil(SECTOR_SIZE) - start;

    if start < DIRECT_SLOTS && need > 0 {
        let n = fill_slots(cache, free_map, &mut disk.direct, start, need)?;
        start += n;
        need -= n;
    }
    if start < DOUBLY_BASE && need > 0 {
        let n = fill_indirect(cache, free_map, &mut disk.indirect, start - DIRECT_SLOTS, need)?;
        start += n;
        need -= n;
    }
    if need > 0 {
        let n = fill_doubly(
            cache,
            free_map,
            &mut disk.doubly_indirect,
            start - DOUBLY_BASE,
            need,
        )?;
        need -= n;
    }
    debug_assert_eq!(need, 0);

    disk.length = new_length as i32;
    Ok(())
}

/// Allocate and zero data sectors into `slots[start..]`, up to `need`.
///
/// Returns how many were placed; `NoSpace` when the free map comes up
/// short (what was placed stays placed).
fn fill_slots(
    cache: &BufferCache,
    free_map: &FreeMap,
    slots: &mut [Option<SectorPtr>],
    start: usize,
    need: usize,
) -> Result<usize, KernelError> {
    let want = need.min(slots.len() - start);
    if want == 0 {
        return Ok(0);
    }
    let got = free_map.allocate(want);
    for (i, sector) in got.iter().enumerate() {
        cache.write(*sector, 0, &ZEROS)?;
        slots[start + i] = Some(SectorPtr::new(*sector).unwrap());
    }
    if got.len() < want {
        return Err(KernelError::NoSpace);
    }
    Ok(want)
}

/// Ensure an index block exists behind `ptr`, allocating and zeroing one
/// if needed.
fn ensure_index_block(
    cache: &BufferCache,
    free_map: &FreeMap,
    ptr: &mut Option<SectorPtr>,
) -> Result<Sector, KernelError> {
    if let Some(p) = ptr {
        return Ok(p.get());
    }
    let sector = free_map.allocate_one().ok_or(KernelError::NoSpace)?;
    cache.write(sector, 0, &ZEROS)?;
    *ptr = Some(SectorPtr::new(sector).unwrap());
    Ok(sector)
}

/// Fill the indirect tier rooted at `ptr`, starting at index `start`
/// within the block.
fn fill_indirect(
    cache: &BufferCache,
    free_map: &FreeMap,
    ptr: &mut Option<SectorPtr>,
    start: usize,
    need: usize,
) -> Result<usize, KernelError> {
    let want = need.min(PTRS_PER_INDIRECT - start);
    if want == 0 {
        return Ok(0);
    }
    let sector = ensure_index_block(cache, free_map, ptr)?;
    let mut block = IndirectBlock::read_from(cache, sector)?;
    let filled = fill_slots(cache, free_map, &mut block[..], start, want);
    // Persist whatever was placed, even on a failed allocation.
    block.write_to(cache, sector)?;
    filled
}

/// Fill the doubly-indirect tier rooted at `ptr`, starting at flat index
/// `start` within the tier.
fn fill_doubly(
    cache: &BufferCache,
    free_map: &FreeMap,
    ptr: &mut Option<SectorPtr>,
    mut start: usize,
    mut need: usize,
) -> Result<usize, KernelError> {
    if need == 0 {
        return Ok(0);
    }
    let sector = ensure_index_block(cache, free_map, ptr)?;
    let mut outer = IndirectBlock::read_from(cache, sector)?;
    let mut done = 0;
    let mut result = Ok(());
    while need > 0 {
        let sub = start / PTRS_PER_INDIRECT;
        if sub >= PTRS_PER_INDIRECT {
            break;
        }
        match fill_indirect(
            cache,
            free_map,
            &mut outer[sub],
            start % PTRS_PER_INDIRECT,
            need,
        ) {
            Ok(0) => break,
            Ok(n) => {
                done += n;
                start += n;
                need -= n;
            }
            Err(e) => {
                result = Err(e);
                break;
            }
        }
    }
    outer.write_to(cache, sector)?;
    result.map(|_| done)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rook::dev::MemDisk;
    use std::time::Duration;

    fn table(sectors: usize) -> InodeTable {
        let disk = Arc::new(MemDisk::new(sectors));
        let cache = Arc::new(BufferCache::with_flush_interval(
            disk,
            Duration::from_secs(3600),
        ));
        let free_map = Arc::new(FreeMap::new(sectors, 1));
        InodeTable::new(cache, free_map)
    }

    #[test]
    fn create_open_read_zeroes() {
        let table = table(1024);
        let sector = table.create(3 * SECTOR_SIZE + 17).unwrap();
        let inode = table.open(sector).unwrap();
        assert_eq!(inode.length(), 3 * SECTOR_SIZE + 17);

        let mut buf = vec![0xFFu8; SECTOR_SIZE];
        let n = inode.read_at(&mut buf, SECTOR_SIZE).unwrap();
        assert_eq!(n, SECTOR_SIZE);
        assert!(buf.iter().all(|&b| b == 0));
        table.close(&inode).unwrap();
    }

    #[test]
    fn write_read_round_trip() {
        let table = table(1024);
        let sector = table.create(0).unwrap();
        let inode = table.open(sector).unwrap();

        let payload: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
        assert_eq!(inode.write_at(&payload, 123).unwrap(), payload.len());
        assert_eq!(inode.length(), 123 + payload.len());

        let mut out = vec![0u8; payload.len()];
        assert_eq!(inode.read_at(&mut out, 123).unwrap(), payload.len());
        assert_eq!(out, payload);
        table.close(&table.open(sector).unwrap()).unwrap();
        table.close(&inode).unwrap();
    }

    #[test]
    fn growth_past_direct_region_materializes_indirect_block() {
        let table = table(2048);
        let sector = table.create(0).unwrap();
        let inode = table.open(sector).unwrap();

        let payload = [b'X'; SECTOR_SIZE];
        let offset = DIRECT_SLOTS * SECTOR_SIZE;
        assert_eq!(inode.write_at(&payload, offset).unwrap(), SECTOR_SIZE);
        assert_eq!(inode.length(), (DIRECT_SLOTS + 1) * SECTOR_SIZE);
        {
            let state = inode.state.lock().unwrap();
            assert!(state.disk.indirect.is_some());
            assert!(state.disk.direct.iter().all(|s| s.is_some()));
        }

        let mut out = [0u8; SECTOR_SIZE];
        assert_eq!(inode.read_at(&mut out, offset).unwrap(), SECTOR_SIZE);
        assert_eq!(out, payload);
        table.close(&inode).unwrap();
    }

    #[test]
    fn growth_past_indirect_region_materializes_doubly_indirect() {
        let table = table(4096);
        let sector = table.create(0).unwrap();
        let inode = table.open(sector).unwrap();

        let offset = DOUBLY_BASE * SECTOR_SIZE + 5;
        assert_eq!(inode.write_at(b"deep", offset).unwrap(), 4);
        {
            let state = inode.state.lock().unwrap();
            assert!(state.disk.indirect.is_some());
            assert!(state.disk.doubly_indirect.is_some());
        }
        let mut out = [0u8; 4];
        assert_eq!(inode.read_at(&mut out, offset).unwrap(), 4);
        assert_eq!(&out, b"deep");

        // Previously untouched bytes in the grown range read as zeroes.
        let mut mid = [0xAAu8; 64];
        assert_eq!(inode.read_at(&mut mid, 200 * SECTOR_SIZE).unwrap(), 64);
        assert!(mid.iter().all(|&b| b == 0));
        table.close(&inode).unwrap();
    }

    #[test]
    fn read_past_eof_is_short() {
        let table = table(1024);
        let sector = table.create(100).unwrap();
        let inode = table.open(sector).unwrap();

        let mut buf = [0u8; 64];
        assert_eq!(inode.read_at(&mut buf, 80).unwrap(), 20);
        assert_eq!(inode.read_at(&mut buf, 100).unwrap(), 0);
        assert_eq!(inode.read_at(&mut buf, 5000).unwrap(), 0);
        table.close(&inode).unwrap();
    }

    #[test]
    fn deny_write_makes_writes_return_zero() {
        let table = table(1024);
        let sector = table.create(SECTOR_SIZE).unwrap();
        let inode = table.open(sector).unwrap();

        inode.deny_write();
        assert_eq!(inode.write_at(b"nope", 0).unwrap(), 0);
        inode.allow_write();
        assert_eq!(inode.write_at(b"yes", 0).unwrap(), 3);
        table.close(&inode).unwrap();
    }

    #[test]
    fn openers_share_one_inode() {
        let table = table(1024);
        let sector = table.create(0).unwrap();
        let a = table.open(sector).unwrap();
        let b = table.open(sector).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(table.open_count(), 1);

        a.write_at(b"shared", 0).unwrap();
        let mut out = [0u8; 6];
        b.read_at(&mut out, 0).unwrap();
        assert_eq!(&out, b"shared");

        table.close(&a).unwrap();
        assert_eq!(table.open_count(), 1);
        table.close(&b).unwrap();
        assert_eq!(table.open_count(), 0);
    }

    #[test]
    fn removed_inode_releases_every_sector() {
        let table = table(2048);
        let before = table.free_map().free_sectors();

        // Spans all three tiers: direct, indirect, doubly-indirect.
        let length = (DOUBLY_BASE + 3) * SECTOR_SIZE;
        let sector = table.create(length).unwrap();
        let inode = table.open(sector).unwrap();
        assert!(table.free_map().free_sectors() < before);

        inode.remove();
        table.close(&inode).unwrap();
        assert_eq!(table.free_map().free_sectors(), before);
    }

    #[test]
    fn out_of_sectors_fails_the_write() {
        let table = table(64);
        let sector = table.create(0).unwrap();
        let inode = table.open(sector).unwrap();
        let huge = vec![1u8; 128 * SECTOR_SIZE];
        assert_eq!(inode.write_at(&huge, 0), Err(KernelError::NoSpace));
        table.close(&inode).unwrap();
    }

    #[test]
    #[should_panic(expected = "file too long")]
    fn oversize_file_is_fatal() {
        let table = table(1024);
        let sector = table.create(0).unwrap();
        let inode = table.open(sector).unwrap();
        let _ = inode.write_at(b"x", MAX_LENGTH);
    }

    #[test]
    fn corrupt_magic_is_detected() {
        let table = table(1024);
        let sector = table.free_map().allocate_one().unwrap();
        table.cache().write(sector, 0, &[0u8; SECTOR_SIZE]).unwrap();
        assert!(matches!(
            table.open(sector),
            Err(KernelError::FilesystemCorrupted(_))
        ));
    }

    #[test]
    fn random_offset_round_trips() {
        use rand::{Rng, SeedableRng, rngs::StdRng};
        let table = table(4096);
        let sector = table.create(0).unwrap();
        let inode = table.open(sector).unwrap();
        let mut rng = StdRng::seed_from_u64(0x5EED);

        let mut shadow = vec![0u8; 300 * SECTOR_SIZE];
        let mut high_water = 0;
        for _ in 0..40 {
            let ofs = rng.gen_range(0..shadow.len() - 2048);
            let len = rng.gen_range(1..2048);
            let data: Vec<u8> = (0..len).map(|_| rng.r#gen()).collect();
            assert_eq!(inode.write_at(&data, ofs).unwrap(), len);
            shadow[ofs..ofs + len].copy_from_slice(&data);
            high_water = high_water.max(ofs + len);
        }
        let mut out = vec![0u8; high_water];
        assert_eq!(inode.read_at(&mut out, 0).unwrap(), high_water);
        assert_eq!(out, shadow[..high_water]);
        table.close(&inode).unwrap();
    }
}
