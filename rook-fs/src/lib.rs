//! # Rook storage stack.
//!
//! The storage half of the Rook core, layered bottom-up:
//!
//! ```text
//! ┌─────────────────────────────────┐
//! │ file::File                      │
//! │ - clonable open-file handle     │
//! │ - deny-write accounting         │
//! └───────────────┬─────────────────┘
//!                 │
//! ┌───────────────▼─────────────────┐
//! │ inode::{InodeTable, Inode}      │
//! │ - open-inode deduplication      │
//! │ - direct/indirect/doubly-       │
//! │   indirect sector indexing      │
//! │ - growth, read_at / write_at    │
//! └───────────────┬─────────────────┘
//!                 │
//! ┌───────────────▼─────────────────┐
//! │ cache::BufferCache              │
//! │ - 64 sector slots               │
//! │ - per-slot concurrency          │
//! │ - write-back + periodic flush   │
//! └───────────────┬─────────────────┘
//!                 │
//! ┌───────────────▼─────────────────┐
//! │ rook::dev::BlockDevice          │
//! └─────────────────────────────────┘
//! ```
//!
//! The [`free_map`] allocator hands out device sectors to the inode layer;
//! [`disk_layout`] pins down the exact on-disk byte format of inodes and
//! index blocks.
//!
//! The directory and pathname layer that would sit on top of
//! [`inode::InodeTable`] is not part of this crate; files are named by the
//! sector of their inode.

#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

macro_rules! const_assert {
    ($($tt:tt)*) => {
        const _: () = assert!($($tt)*);
    }
}

pub mod cache;
pub mod disk_layout;
pub mod file;
pub mod free_map;
pub mod inode;
