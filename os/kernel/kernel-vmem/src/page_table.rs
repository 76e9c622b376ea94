//! # Page Table
//!
//! One 4 KiB page-table frame: 512 [`PageTableEntry`] values, the same shape
//! at every level.
//!
//! ## Invariants & Notes
//!
//! - [`PageTable`] is 4 KiB aligned and exactly one frame in size.
//! - A table is reclaimable once [`PageTable::is_zero`] holds.
//! - After modifying active mappings, the caller must perform any required TLB maintenance.

use crate::PageTableEntry;
use crate::level::Level;
use kernel_memory_addresses::VirtualAddress;

/// Entries per table.
pub const ENTRIES: usize = 512;

#[doc(alias = "PML4")]
#[doc(alias = "PDPT")]
#[doc(alias = "PD")]
#[doc(alias = "PT")]
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; ENTRIES],
}

const _: () = {
    assert!(size_of::<PageTable>() == 4096);
    assert!(align_of::<PageTable>() == 4096);
};

impl PageTable {
    /// An all-zero table.
    #[inline]
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            entries: [PageTableEntry::zero(); ENTRIES],
        }
    }

    /// Clears every entry.
    #[inline]
    pub fn zero(&mut self) {
        self.entries.fill(PageTableEntry::zero());
    }

    /// `true` when no entry is in use.
    #[inline]
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.entries.iter().all(|e| e.is_zero())
    }

    #[inline]
    #[must_use]
    pub const fn get(&self, i: usize) -> PageTableEntry {
        self.entries[i]
    }

    #[inline]
    pub const fn set(&mut self, i: usize, e: PageTableEntry) {
        self.entries[i] = e;
    }

    /// The entry translating `va` when this table sits at `level`.
    #[inline]
    #[must_use]
    pub const fn entry_for(&self, level: Level, va: VirtualAddress) -> PageTableEntry {
        self.get(level.index_of(va))
    }

    #[inline]
    pub const fn set_for(&mut self, level: Level, va: VirtualAddress, e: PageTableEntry) {
        self.set(level.index_of(va), e);
    }

    /// Number of non-zero entries.
    #[must_use]
    pub fn used(&self) -> usize {
        self.entries.iter().filter(|e| !e.is_zero()).count()
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::zeroed()
    }
}
