//! Per-process page table.
//!
//! The page table records, for each mapped user virtual page, the frame
//! backing it and the entry flag bits. In a hosted build there is no MMU
//! walking a radix tree, so a map keyed by [`Vpn`] stands in for the
//! hardware structure; the entry type and its accessed/dirty helpers come
//! from the core crate so the replacement policy is independent of the
//! representation.

use rook::KernelError;
use rook::addressing::Vpn;
use rook::mm::FrameIndex;
use rook::mm::page_table::Pte;
use std::collections::BTreeMap;

/// Page table of one user process.
#[derive(Default)]
pub struct PageTable {
    entries: BTreeMap<Vpn, Pte>,
}

impl PageTable {
    /// An empty page table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `vpn` to `frame`.
    ///
    /// Fails if `vpn` is already mapped; replacing a live mapping is
    /// always a bug in the caller.
    pub fn map(&mut self, vpn: Vpn, frame: FrameIndex, writable: bool) -> Result<(), KernelError> {
        if self.entries.contains_key(&vpn) {
            return Err(KernelError::InvalidArgument);
        }
        self.entries.insert(vpn, Pte::new(frame, writable));
        Ok(())
    }

    /// Remove the mapping of `vpn`, returning the entry it held.
    pub fn unmap(&mut self, vpn: Vpn) -> Option<Pte> {
        self.entries.remove(&vpn)
    }

    /// Look up the entry mapping `vpn`.
    pub fn walk(&self, vpn: Vpn) -> Option<&Pte> {
        self.entries.get(&vpn)
    }

    /// Look up the entry mapping `vpn`, mutably (to maintain the
    /// accessed and dirty bits).
    pub fn walk_mut(&mut self, vpn: Vpn) -> Option<&mut Pte> {
        self.entries.get_mut(&vpn)
    }

    /// Pages currently mapped.
    pub fn mapped(&self) -> Vec<Vpn> {
        self.entries.keys().copied().collect()
    }

    /// Number of live mappings.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no page is mapped.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn double_map_is_rejected() {
        let mut pt = PageTable::new();
        pt.map(Vpn(5), FrameIndex(0), true).unwrap();
        assert_eq!(
            pt.map(Vpn(5), FrameIndex(1), true),
            Err(KernelError::InvalidArgument)
        );
        assert_eq!(pt.walk(Vpn(5)).unwrap().frame, FrameIndex(0));
    }

    #[test]
    fn unmap_returns_the_entry() {
        let mut pt = PageTable::new();
        pt.map(Vpn(9), FrameIndex(4), false).unwrap();
        pt.walk_mut(Vpn(9)).unwrap().touch(false);

        let pte = pt.unmap(Vpn(9)).unwrap();
        assert_eq!(pte.frame, FrameIndex(4));
        assert!(pte.is_accessed());
        assert!(!pte.is_writable());
        assert!(pt.walk(Vpn(9)).is_none());
    }
}
