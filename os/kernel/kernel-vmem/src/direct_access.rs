//! # Direct-Access Slot
//!
//! Once the kernel runs on its final tables, free frames and page-table
//! frames are no longer identity mapped. The direct-access slot is one fixed
//! virtual page whose level 1 entry can be pointed at any physical frame:
//!
//! ```text
//!  root ──► L3 ──► L2 ──► L1 ──► [slot entry] ──► any frame
//!           └──── chain, kept in the kernel image ────┘
//! ```
//!
//! The three chain tables live in identity-mapped kernel memory, so the slot
//! entry itself is always writable. At most one frame is accessible at a time;
//! [`DirectAccessSlot::setup`] asserts the slot is free and the returned
//! [`DirectAccessGuard`] clears the entry and flushes the page when dropped.

use crate::level::Level;
use crate::mapper::IdentityMapper;
use crate::mmu::Mmu;
use crate::page_table::PageTable;
use crate::{AddressSpace, PageTableEntry, PhysMapper};
use kernel_memory_addresses::{PhysicalPage, Size4K, VirtualAddress, VirtualPage};

#[derive(Debug)]
pub struct DirectAccessSlot {
    page: VirtualPage<Size4K>,
    /// Level 3, level 2 and level 1 tables, in that order.
    chain: [PhysicalPage<Size4K>; 3],
}

impl DirectAccessSlot {
    /// Clears the chain tables and links them towards `page`.
    ///
    /// # Safety
    /// The chain frames must be identity mapped in every address space the
    /// slot is installed in, and must not be used for anything else.
    #[must_use]
    pub unsafe fn new(page: VirtualPage<Size4K>, chain: [PhysicalPage<Size4K>; 3]) -> Self {
        let va = page.base();
        let mut m = IdentityMapper;
        for table in chain {
            m.with_table(table, PageTable::zero);
        }
        m.with_table(chain[0], |t| {
            t.set_for(Level::L3, va, PageTableEntry::init(Level::L3, chain[1]));
        });
        m.with_table(chain[1], |t| {
            t.set_for(Level::L2, va, PageTableEntry::init(Level::L2, chain[2]));
        });
        Self { page, chain }
    }

    #[inline]
    #[must_use]
    pub const fn page(&self) -> VirtualPage<Size4K> {
        self.page
    }

    #[inline]
    #[must_use]
    pub const fn chain(&self) -> [PhysicalPage<Size4K>; 3] {
        self.chain
    }

    /// Links the chain into `space` and pins its tables there.
    ///
    /// Other mappings under the same root entry (stack, heap) then share the
    /// chain tables without ever reclaiming them.
    pub fn install<M: PhysMapper>(&self, space: &mut AddressSpace, mapper: &mut M) {
        space.attach(mapper, self.page.base(), self.chain[0]);
        for table in self.chain {
            space.pin(table);
        }
    }

    /// `true` while a frame is mapped at the slot.
    #[must_use]
    pub fn in_use(&self) -> bool {
        let va = self.page.base();
        !IdentityMapper.with_table(self.chain[2], |t| t.entry_for(Level::L1, va).is_zero())
    }

    /// Maps `frame` at the slot page.
    ///
    /// # Panics
    /// If the slot is already in use.
    pub fn setup<'s, U: Mmu>(
        &'s mut self,
        mmu: &'s mut U,
        frame: PhysicalPage<Size4K>,
    ) -> DirectAccessGuard<'s, U> {
        let va = self.page.base();
        IdentityMapper.with_table(self.chain[2], |t| {
            assert!(
                t.entry_for(Level::L1, va).is_zero(),
                "direct-access slot already in use"
            );
            t.set_for(Level::L1, va, PageTableEntry::init(Level::L1, frame));
        });
        let ptr = mmu.resolve(va);
        DirectAccessGuard {
            slot: self,
            mmu,
            ptr,
        }
    }

    fn release<U: Mmu>(&mut self, mmu: &mut U) {
        let va = self.page.base();
        IdentityMapper.with_table(self.chain[2], |t| {
            t.set_for(Level::L1, va, PageTableEntry::zero());
        });
        mmu.flush(self.page);
    }
}

/// A frame mapped at the direct-access page.
///
/// Dropping the guard unmaps the frame and invalidates the translation.
pub struct DirectAccessGuard<'s, U: Mmu> {
    slot: &'s mut DirectAccessSlot,
    mmu: &'s mut U,
    ptr: *mut u8,
}

impl<U: Mmu> DirectAccessGuard<'_, U> {
    /// Pointer to the start of the frame.
    #[inline]
    #[must_use]
    pub const fn as_ptr<T>(&self) -> *mut T {
        self.ptr.cast()
    }

    #[inline]
    #[must_use]
    pub const fn va(&self) -> VirtualAddress {
        self.slot.page.base()
    }
}

impl<U: Mmu> Drop for DirectAccessGuard<'_, U> {
    fn drop(&mut self) {
        self.slot.release(&mut *self.mmu);
    }
}

/// [`PhysMapper`] that reaches each frame through the direct-access slot.
pub struct DirectAccess<'s, U: Mmu> {
    slot: &'s mut DirectAccessSlot,
    mmu: &'s mut U,
}

impl<'s, U: Mmu> DirectAccess<'s, U> {
    pub const fn new(slot: &'s mut DirectAccessSlot, mmu: &'s mut U) -> Self {
        Self { slot, mmu }
    }

    /// The MMU the slot is flushed on, for invalidating other pages.
    pub const fn mmu(&mut self) -> &mut U {
        self.mmu
    }

    /// Where `va` is reachable under the active tables.
    pub fn resolve(&self, va: VirtualAddress) -> *mut u8 {
        self.mmu.resolve(va)
    }
}

impl<U: Mmu> PhysMapper for DirectAccess<'_, U> {
    unsafe fn with_frame<T, R>(
        &mut self,
        frame: PhysicalPage<Size4K>,
        f: impl FnOnce(&mut T) -> R,
    ) -> R {
        let guard = self.slot.setup(&mut *self.mmu, frame);
        // SAFETY: the frame is mapped at the slot until `guard` drops; the
        // caller vouches for `T` and exclusivity.
        f(unsafe { &mut *guard.as_ptr::<T>() })
    }
}
