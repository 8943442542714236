//! # Rook: a teaching operating system's storage and memory core.
//!
//! Rook is a minimal but functional rendition of the two subsystems that
//! make an operating system's resource management interesting: the storage
//! stack (a sector buffer cache and an indexed-inode file layer) and the
//! virtual memory stack (a physical frame table with clock replacement, a
//! swap slot allocator, and per-process demand paging).
//!
//! This crate is the foundation the subsystems build on. It provides:
//!
//! - [`KernelError`], the error currency of every kernel operation.
//! - [`addressing`], newtypes for user virtual addresses and page numbers.
//! - [`dev`], the sector-addressable block device seam and an in-memory
//!   device backing it in a hosted environment.
//! - [`mm`], the [`Page`] buffer abstraction and the page-table entry
//!   types, including the hardware accessed/dirty bit helpers that the
//!   replacement policy consults.
//! - [`sync`], the counting [`Semaphore`] used as a ready signal between
//!   an evicting thread and a faulting thread.
//!
//! The subsystems themselves live in the `rook-fs` and `rook-vm` crates.
//!
//! [`Page`]: mm::Page
//! [`Semaphore`]: sync::Semaphore

#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

pub mod addressing;
pub mod dev;
pub mod mm;
pub mod sync;

/// Enum representing errors that can occur during a kernel operation.
///
/// This enum is used to categorize errors encountered by a kernel
/// operation. Each variant corresponds to a specific type of error that
/// might occur while serving a request. These errors can be returned to a
/// user program to indicate the nature of the failure.
#[derive(Debug, Eq, PartialEq)]
pub enum KernelError {
    /// Operation is not permitted. (EPERM)
    OperationNotPermitted,
    /// No such file or directory. (ENOENT)
    NoSuchEntry,
    /// IO Error. (EIO)
    IOError,
    /// Out of memory. (ENOMEM)
    NoMemory,
    /// Permission denied. (EACCES)
    InvalidAccess,
    /// Bad address. (EFAULT)
    BadAddress,
    /// Invalid argument. (EINVAL)
    InvalidArgument,
    /// No space left on device. (ENOSPC)
    NoSpace,
    /// File system is corrupted. (EFSCORRUPTED)
    FilesystemCorrupted(&'static str),
}

impl KernelError {
    /// Converts the [`KernelError`] enum into a corresponding `usize` error
    /// code. The result is cast to `usize` for use as a return value in
    /// system calls.
    pub fn into_usize(self) -> usize {
        (match self {
            KernelError::OperationNotPermitted => -1isize,
            KernelError::NoSuchEntry => -2,
            KernelError::IOError => -5,
            KernelError::NoMemory => -12,
            KernelError::InvalidAccess => -13,
            KernelError::BadAddress => -14,
            KernelError::InvalidArgument => -22,
            KernelError::NoSpace => -28,
            KernelError::FilesystemCorrupted(_) => -117,
        }) as usize
    }
}

/// The given `isize` does not indicate a [`KernelError`].
#[derive(Debug, Eq, PartialEq)]
pub struct TryFromError {
    e: isize,
}

impl TryFrom<isize> for KernelError {
    type Error = TryFromError;

    fn try_from(value: isize) -> Result<Self, Self::Error> {
        match value {
            -1 => Ok(Self::OperationNotPermitted),
            -2 => Ok(Self::NoSuchEntry),
            -5 => Ok(Self::IOError),
            -12 => Ok(Self::NoMemory),
            -13 => Ok(Self::InvalidAccess),
            -14 => Ok(Self::BadAddress),
            -22 => Ok(Self::InvalidArgument),
            -28 => Ok(Self::NoSpace),
            -117 => Ok(Self::FilesystemCorrupted("")),
            e => Err(TryFromError { e }),
        }
    }
}
