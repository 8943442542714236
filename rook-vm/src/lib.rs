//! # Rook virtual memory stack.
//!
//! Demand-paged user memory for the Rook core. Physical user memory is a
//! fixed pool of frames; when the pool runs dry, a clock sweep over the
//! frame table picks a victim, pushes its contents out to swap or to the
//! backing file, and hands the frame to the requester. A faulting thread
//! finds where its page went through the per-process supplemental page
//! table and pulls it back in.
//!
//! ```text
//!        fault                           eviction
//!          │                                │
//! ┌────────▼─────────┐            ┌─────────▼────────┐
//! │ mm_struct        │            │ frame            │
//! │ - MmStruct       │◄───────────│ - FrameTable     │
//! │ - fault handler  │  not-ready │ - clock hand     │
//! │ - stack growth   │  location  │ - pin/unpin      │
//! │ - mmap / munmap  │            └─────────┬────────┘
//! └────────┬─────────┘                      │ write-out
//!          │ page-in                        │
//! ┌────────▼─────────┐            ┌─────────▼────────┐
//! │ page             │            │ swap             │
//! │ - per-process    │            │ - slot bitmap    │
//! │   page locations │            │ - page-sized I/O │
//! └──────────────────┘            └──────────────────┘
//! ```
//!
//! The handoff between the two sides is the ready signal on each page
//! location: eviction inserts the location *before* its write-out and
//! signals once the data is at rest, so a concurrent faulter blocks
//! instead of reading a half-written slot.

#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

pub mod frame;
pub mod mm_struct;
pub mod page;
pub mod page_table;
pub mod swap;

pub use frame::{FrameGetFlags, FrameTable};
pub use mm_struct::{MapId, MmStruct, Vm};
pub use page::{PageLocation, SupplementalPageTable};
pub use page_table::PageTable;
pub use swap::{SwapIndex, SwapTable};
