//! # MMU Access
//!
//! The memory core touches the processor's paging hardware in exactly three
//! ways: loading a new root table, invalidating one translation, and turning
//! a virtual address into a pointer. [`Mmu`] captures those so that the
//! bootstrap sequence and the direct-access slot can run against the real CPU
//! ([`X86Mmu`]) or a software walker ([`SoftMmu`]).

use crate::level::Level;
use crate::page_table::PageTable;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress, VirtualPage};

pub trait Mmu {
    /// Make `root` the active PML4.
    ///
    /// # Safety
    /// The tables under `root` must map the code that is executing, its stack
    /// and everything else in use once the switch happens.
    unsafe fn load_root(&mut self, root: PhysicalPage<Size4K>);

    /// Invalidate any cached translation for `page`.
    fn flush(&mut self, page: VirtualPage<Size4K>);

    /// Pointer through which `va` is reachable under the active tables.
    fn resolve(&self, va: VirtualAddress) -> *mut u8;
}

/// The executing x86-64 processor.
#[derive(Debug, Default)]
pub struct X86Mmu;

impl Mmu for X86Mmu {
    #[inline]
    unsafe fn load_root(&mut self, root: PhysicalPage<Size4K>) {
        #[cfg(target_arch = "x86_64")]
        unsafe {
            let cr3 = root.base().as_u64();
            core::arch::asm!("mov cr3, {}", in(reg) cr3, options(nostack, preserves_flags));
        }
        #[cfg(not(target_arch = "x86_64"))]
        let _ = root;
    }

    #[inline]
    fn flush(&mut self, page: VirtualPage<Size4K>) {
        #[cfg(target_arch = "x86_64")]
        // SAFETY: invlpg only drops a cached translation.
        unsafe {
            core::arch::asm!("invlpg [{}]", in(reg) page.base().as_u64(), options(nostack, preserves_flags));
        }
        #[cfg(not(target_arch = "x86_64"))]
        let _ = page;
    }

    #[inline]
    fn resolve(&self, va: VirtualAddress) -> *mut u8 {
        va.as_mut_ptr()
    }
}

/// Software page walker over identity-addressable tables.
///
/// Keeps the loaded root and resolves virtual addresses by walking it, which
/// is what the hardware would do. Used by hosted test runs, where "physical"
/// memory is an ordinary buffer. An unmapped address panics, the hosted
/// equivalent of a page fault.
#[derive(Debug, Default)]
pub struct SoftMmu {
    root: Option<PhysicalPage<Size4K>>,
    loads: usize,
    flushes: usize,
}

impl SoftMmu {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            root: None,
            loads: 0,
            flushes: 0,
        }
    }

    #[must_use]
    pub const fn root(&self) -> Option<PhysicalPage<Size4K>> {
        self.root
    }

    /// Number of root loads so far.
    #[must_use]
    pub const fn loads(&self) -> usize {
        self.loads
    }

    /// Number of single-page invalidations so far.
    #[must_use]
    pub const fn flushes(&self) -> usize {
        self.flushes
    }

    /// Walks the loaded tables.
    #[must_use]
    pub fn translate(&self, va: VirtualAddress) -> Option<u64> {
        let mut table = self.root?;
        for level in Level::WALK {
            // SAFETY: table frames are identity addressable in a hosted run.
            let t = unsafe { &*table.as_identity_ptr::<PageTable>() };
            let e = t.entry_for(level, va);
            if !e.present() {
                return None;
            }
            if level == Level::L1 || e.huge() {
                let offset = va.as_u64() & (level.covers() - 1);
                return Some(e.physical_address().as_u64() + offset);
            }
            table = e.next_table()?;
        }
        None
    }
}

impl Mmu for SoftMmu {
    unsafe fn load_root(&mut self, root: PhysicalPage<Size4K>) {
        log::trace!("soft mmu: root {root}");
        self.root = Some(root);
        self.loads += 1;
    }

    fn flush(&mut self, _page: VirtualPage<Size4K>) {
        self.flushes += 1;
    }

    fn resolve(&self, va: VirtualAddress) -> *mut u8 {
        match self.translate(va) {
            Some(pa) => PhysicalAddress::new(pa).as_identity_ptr(),
            None => panic!("page fault at {va}"),
        }
    }
}
