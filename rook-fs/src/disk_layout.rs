//! On-disk layout of the inode layer.
//!
//! This module defines the raw disk-resident metadata structures: the
//! inode itself and the index blocks it points at. Each struct matches the
//! exact binary layout persisted on the file-system device, asserted at
//! compile time to be exactly one sector.
//!
//! An inode does not store file data directly; it maps a file-relative
//! sector index to a device sector through three tiers:
//!
//! ```text
//!            ┌───────────────────────────┐
//!            │        DiskInode          │
//!            ├───────────────────────────┤
//!            │ direct[0]   → data sec 0  │
//!            │ ...                       │
//!            │ direct[123] → data sec 123│
//!            │                           │
//!            │ indirect ───────────────┐ │
//!            │ doubly_indirect ─────┐  │ │
//!            └──────────────────────┬──┬─┘
//!                                   │  │
//!        ┌──────────────────────────┘  │
//! ┌──────▼───────┐                 ┌───▼───────────┐
//! │ Doubly ind.  │                 │ Indirect      │
//! ├──────────────┤                 ├───────────────┤
//! │ → indirect 1 │─┐               │ → data sec 124│
//! │ ...          │ │               │ ...           │
//! │ → indirect128│ │               │ → data sec 251│
//! └──────────────┘ │               └───────────────┘
//!   ┌──────────────┘
//! ┌─▼────────────┐
//! │ Indirect blk │
//! ├──────────────┤
//! │ → data sec X │
//! │ ...          │
//! └──────────────┘
//! ```
//!
//! A zero entry in any tier means "unallocated", expressed in memory as
//! `Option<SectorPtr>` over a non-zero integer so the niche matches the
//! on-disk encoding bit for bit.

use crate::cache::BufferCache;
use core::num::NonZeroU32;
use rook::KernelError;
use rook::dev::{SECTOR_SIZE, Sector};

/// Identifies a valid on-disk inode.
pub const INODE_MAGIC: u32 = 0x494E_4F44;

/// Number of direct sector slots in an inode.
pub const DIRECT_SLOTS: usize = 124;

/// Number of sector pointers held by one index block.
pub const PTRS_PER_INDIRECT: usize = SECTOR_SIZE / 4;

/// First file-sector index served by the doubly-indirect tier.
pub const DOUBLY_BASE: usize = DIRECT_SLOTS + PTRS_PER_INDIRECT;

/// The maximum number of data sectors a single inode can reference.
pub const MAX_SECTORS: usize = DOUBLY_BASE + PTRS_PER_INDIRECT * PTRS_PER_INDIRECT;

/// The maximum length of a file, in bytes.
pub const MAX_LENGTH: usize = MAX_SECTORS * SECTOR_SIZE;

/// An on-disk pointer to a device sector.
///
/// Sector 0 never holds file data (the free map reserves it), so the zero
/// encoding is free to mean "unallocated": `Option<SectorPtr>` occupies
/// exactly four bytes.
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub struct SectorPtr(NonZeroU32);
const_assert!(core::mem::size_of::<Option<SectorPtr>>() == 4);

impl SectorPtr {
    /// Creates a [`SectorPtr`] if the given sector is not the reserved
    /// sector 0.
    pub fn new(sector: Sector) -> Option<Self> {
        NonZeroU32::new(sector.into_usize() as u32).map(Self)
    }

    /// The device sector this pointer names.
    #[inline]
    pub fn get(self) -> Sector {
        Sector(self.0.get() as usize)
    }
}

/// On-disk representation of an inode. Exactly one sector.
#[repr(C)]
pub struct DiskInode {
    /// File size in bytes.
    pub length: i32,
    /// Magic number, [`INODE_MAGIC`].
    pub magic: u32,
    /// Directly mapped data sectors.
    pub direct: [Option<SectorPtr>; DIRECT_SLOTS],
    /// An indirect block of [`PTRS_PER_INDIRECT`] data-sector pointers.
    pub indirect: Option<SectorPtr>,
    /// A doubly-indirect block whose entries each name an indirect block.
    pub doubly_indirect: Option<SectorPtr>,
}
const_assert!(core::mem::size_of::<DiskInode>() == SECTOR_SIZE);

impl Default for DiskInode {
    fn default() -> Self {
        Self {
            length: 0,
            magic: INODE_MAGIC,
            direct: [None; DIRECT_SLOTS],
            indirect: None,
            doubly_indirect: None,
        }
    }
}

impl DiskInode {
    /// Load an inode through the buffer cache from `sector`.
    pub fn read_from(cache: &BufferCache, sector: Sector) -> Result<Box<Self>, KernelError> {
        let mut inode = Box::new(Self::default());
        {
            // Every bit pattern is a valid DiskInode: zero is the
            // unallocated niche of each pointer field.
            let raw = unsafe {
                core::slice::from_raw_parts_mut(&mut *inode as *mut _ as *mut u8, SECTOR_SIZE)
            };
            cache.read(sector, 0, raw)?;
        }
        Ok(inode)
    }

    /// Persist this inode through the buffer cache to `sector`.
    pub fn write_to(&self, cache: &BufferCache, sector: Sector) -> Result<(), KernelError> {
        let raw =
            unsafe { core::slice::from_raw_parts(self as *const _ as *const u8, SECTOR_SIZE) };
        cache.write(sector, 0, raw)?;
        Ok(())
    }

    /// Number of data sectors covering the current length.
    #[inline]
    pub fn sectors(&self) -> usize {
        (self.length as usize).div_ceil(SECTOR_SIZE)
    }
}

/// An index block: one sector of data-sector pointers.
#[repr(C)]
pub struct IndirectBlock {
    ptrs: [Option<SectorPtr>; PTRS_PER_INDIRECT],
}
const_assert!(core::mem::size_of::<IndirectBlock>() == SECTOR_SIZE);

impl Default for IndirectBlock {
    fn default() -> Self {
        Self {
            ptrs: [None; PTRS_PER_INDIRECT],
        }
    }
}

impl core::ops::Deref for IndirectBlock {
    type Target = [Option<SectorPtr>; PTRS_PER_INDIRECT];
    fn deref(&self) -> &Self::Target {
        &self.ptrs
    }
}

impl core::ops::DerefMut for IndirectBlock {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.ptrs
    }
}

impl IndirectBlock {
    /// Load an index block through the buffer cache from `sector`.
    pub fn read_from(cache: &BufferCache, sector: Sector) -> Result<Box<Self>, KernelError> {
        let mut block = Box::new(Self::default());
        {
            let raw = unsafe {
                core::slice::from_raw_parts_mut(&mut *block as *mut _ as *mut u8, SECTOR_SIZE)
            };
            cache.read(sector, 0, raw)?;
        }
        Ok(block)
    }

    /// Persist this index block through the buffer cache to `sector`.
    pub fn write_to(&self, cache: &BufferCache, sector: Sector) -> Result<(), KernelError> {
        let raw =
            unsafe { core::slice::from_raw_parts(self as *const _ as *const u8, SECTOR_SIZE) };
        cache.write(sector, 0, raw)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_offsets() {
        let inode = DiskInode::default();
        let base = &inode as *const _ as usize;
        assert_eq!(&inode.length as *const _ as usize - base, 0);
        assert_eq!(&inode.magic as *const _ as usize - base, 4);
        assert_eq!(&inode.direct as *const _ as usize - base, 8);
        assert_eq!(
            &inode.indirect as *const _ as usize - base,
            8 + 4 * DIRECT_SLOTS
        );
        assert_eq!(
            &inode.doubly_indirect as *const _ as usize - base,
            12 + 4 * DIRECT_SLOTS
        );
    }

    #[test]
    fn sector_ptr_niche() {
        assert!(SectorPtr::new(Sector(0)).is_none());
        assert_eq!(SectorPtr::new(Sector(7)).unwrap().get(), Sector(7));
    }

    #[test]
    fn max_file_is_8mib_plus_change() {
        assert_eq!(MAX_SECTORS, 124 + 128 + 128 * 128);
        assert_eq!(MAX_LENGTH, MAX_SECTORS * 512);
    }
}
