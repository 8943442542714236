//! Open-file handles.
//!
//! A [`File`] is a clonable handle over an open inode. Cloning reopens
//! the inode, so a handle stowed away in a file table, a memory mapping,
//! or a page location keeps the inode alive on its own, and dropping the
//! last handle lets a removed inode release its sectors.
//!
//! A handle can veto writes for as long as it lives: a loaded executable
//! image calls [`File::deny_write`], and the deny is lifted automatically
//! when the handle drops.

use crate::inode::{Inode, InodeTable};
use rook::KernelError;
use rook::dev::Sector;
use std::sync::Arc;

/// A handle to an open file.
pub struct File {
    table: Arc<InodeTable>,
    inode: Arc<Inode>,
    denies_write: bool,
}

impl File {
    /// Open the file whose inode lives at `sector`.
    pub fn open(table: &Arc<InodeTable>, sector: Sector) -> Result<Self, KernelError> {
        let inode = table.open(sector)?;
        Ok(Self {
            table: table.clone(),
            inode,
            denies_write: false,
        })
    }

    /// The sector naming this file's inode.
    pub fn sector(&self) -> Sector {
        self.inode.sector()
    }

    /// Length of the file, in bytes.
    pub fn len(&self) -> usize {
        self.inode.length()
    }

    /// Whether the file is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read up to `buf.len()` bytes at `offset`; short at end of file.
    pub fn read_at(&self, buf: &mut [u8], offset: usize) -> Result<usize, KernelError> {
        self.inode.read_at(buf, offset)
    }

    /// Write `buf` at `offset`, growing the file as needed.
    ///
    /// Returns 0 while any handle denies writes.
    pub fn write_at(&self, buf: &[u8], offset: usize) -> Result<usize, KernelError> {
        self.inode.write_at(buf, offset)
    }

    /// Mark the file deleted; sectors are released once every handle is
    /// gone.
    pub fn remove(&self) {
        self.inode.remove();
    }

    /// Veto writes for the lifetime of this handle.
    ///
    /// At most one deny per handle; dropping the handle (or calling
    /// [`File::allow_write`]) lifts it.
    pub fn deny_write(&mut self) {
        if !self.denies_write {
            self.denies_write = true;
            self.inode.deny_write();
        }
    }

    /// Lift this handle's write veto.
    pub fn allow_write(&mut self) {
        if self.denies_write {
            self.denies_write = false;
            self.inode.allow_write();
        }
    }
}

impl Clone for File {
    fn clone(&self) -> Self {
        self.table.reopen(&self.inode);
        Self {
            table: self.table.clone(),
            inode: self.inode.clone(),
            denies_write: false,
        }
    }
}

impl Drop for File {
    fn drop(&mut self) {
        self.allow_write();
        if let Err(e) = self.table.close(&self.inode) {
            log::warn!("file: closing inode {:?} failed: {:?}", self.inode.sector(), e);
        }
    }
}
