//! # Virtual Memory Support
//!
//! x86-64 four-level paging for the kernel: entries, tables, address spaces
//! and the single-page direct-access window used once page-table frames are no
//! longer identity mapped.
//!
//! ## x86-64 Virtual Address → Physical Address Walk
//!
//! Each 48-bit virtual address is divided into five fields:
//!
//! ```text
//! | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! |  PML4 |  PDPT |   PD  |   PT  | Offset |
//! ```
//!
//! The CPU uses these fields as **indices** into four levels of page tables,
//! each holding 512 entries of 8 bytes:
//!
//! ```text
//!  PML4 (L4) →  PDPT (L3) →  PD (L2) →  PT (L1) →  Physical Page
//!                  │             │          └───► maps 4 KiB page
//!                  │             └──────────────► PS=1 → 2 MiB page
//!                  └────────────────────────────► PS=1 → 1 GiB page
//! ```
//!
//! ## What you get
//! - [`PageTableEntry`], one bitfield layout for every level, and [`PageTable`].
//! - [`AddressSpace`]: map 2 MiB identity pages, map runs of 4 KiB pages from a
//!   list of physical ranges, unmap with reclamation of emptied tables, and
//!   software translation.
//! - [`DirectAccessSlot`]: a fixed virtual page that can be pointed at any
//!   physical frame, one frame at a time.
//! - [`Mmu`]: the two privileged operations (root load, TLB flush) plus the
//!   virtual-to-pointer step, with [`X86Mmu`] for the real CPU and [`SoftMmu`]
//!   for hosted runs.
//!
//! ## Seams
//!
//! Page tables need frames, and a frame allocator that keeps its free list
//! inside free frames needs a way to touch them. Both directions go through
//! the two traits below: [`FrameAlloc`] hands out and takes back frames,
//! [`PhysMapper`] makes a frame's contents accessible for the duration of a
//! closure. Early boot uses [`IdentityMapper`]; after the switch to the final
//! tables the kernel uses [`DirectAccess`].
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! # use kernel_vmem::{Level, PageTableEntry};
//! let va = VirtualAddress::new(0xFFFF_8000_0000_1000);
//! assert_eq!(Level::L4.index_of(va), 256);
//! assert_eq!(Level::L1.index_of(va), 1);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod address_space;
pub mod direct_access;
mod level;
mod mapper;
pub mod mmu;
mod pa_list;
mod page_entry_bits;
mod page_table;

pub use crate::address_space::{AddressSpace, LeafSize, MapError};
pub use crate::direct_access::{DirectAccess, DirectAccessGuard, DirectAccessSlot};
pub use crate::level::Level;
pub use crate::mapper::IdentityMapper;
pub use crate::mmu::{Mmu, SoftMmu, X86Mmu};
pub use crate::pa_list::PaRange;
pub use crate::page_entry_bits::PageTableEntry;
pub use crate::page_table::{ENTRIES, PageTable};

use kernel_memory_addresses::{PhysicalPage, Size4K};

/// Source of physical 4 KiB frames for page tables and mapped pages.
///
/// The mapper is passed through because an allocator may keep its bookkeeping
/// inside the frames themselves.
///
/// Returns `None` on out-of-memory.
pub trait FrameAlloc {
    /// Allocate one 4 KiB frame. Contents are unspecified.
    fn alloc_4k<M: PhysMapper>(&mut self, mapper: &mut M) -> Option<PhysicalPage<Size4K>>;

    /// Return a frame that is no longer referenced by any mapping.
    fn release_4k<M: PhysMapper>(&mut self, mapper: &mut M, frame: PhysicalPage<Size4K>);
}

/// Makes the contents of a physical frame accessible to a closure.
///
/// Typical patterns:
/// - **Bootstrap**: physical memory is identity mapped; the frame base is the pointer.
/// - **Kernel**: the frame is temporarily mapped at the direct-access page.
///
/// The access ends when the closure returns; implementations may reuse their
/// window afterwards, so the reference must not escape.
pub trait PhysMapper {
    /// Run `f` with the frame viewed as a `T`.
    ///
    /// # Safety
    /// - `T` must fit into 4 KiB, be valid for any bit pattern the frame
    ///   holds, and need at most 4 KiB alignment.
    /// - No other reference to the frame's contents may be live.
    unsafe fn with_frame<T, R>(
        &mut self,
        frame: PhysicalPage<Size4K>,
        f: impl FnOnce(&mut T) -> R,
    ) -> R;

    /// Run `f` on the page table stored in `frame`.
    ///
    /// The frame must hold a page table (or be about to become one); every
    /// bit pattern is a valid [`PageTable`].
    fn with_table<R>(
        &mut self,
        frame: PhysicalPage<Size4K>,
        f: impl FnOnce(&mut PageTable) -> R,
    ) -> R {
        // SAFETY: a page table is exactly one frame of plain u64 entries.
        unsafe { self.with_frame(frame, f) }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Hosted "physical memory": a heap buffer whose host addresses double as
    //! physical addresses, so identity pointers work unchanged.

    use super::{FrameAlloc, PhysMapper};
    use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K};

    #[repr(C, align(4096))]
    pub struct Aligned4K(#[allow(dead_code)] pub [u8; 4096]);

    pub struct TestPhys {
        frames: Vec<Aligned4K>,
    }

    impl TestPhys {
        pub fn with_frames(n: usize) -> Self {
            let mut v = Vec::with_capacity(n);
            for _ in 0..n {
                v.push(Aligned4K([0u8; 4096]));
            }
            Self { frames: v }
        }

        pub fn frame(&self, idx: usize) -> PhysicalPage<Size4K> {
            PhysicalPage::from_aligned(PhysicalAddress::from_ptr(&raw const self.frames[idx]))
        }

        /// A bump allocator over this memory, skipping the first `skip` frames.
        pub fn bump(&self, skip: usize) -> BumpAlloc {
            BumpAlloc {
                next: self.frame(skip),
                end: self.frame(self.frames.len() - 1).next(),
                released: Vec::new(),
            }
        }
    }

    /// Hands out the next frame; records what comes back.
    pub struct BumpAlloc {
        next: PhysicalPage<Size4K>,
        end: PhysicalPage<Size4K>,
        pub released: Vec<PhysicalPage<Size4K>>,
    }

    impl BumpAlloc {
        pub fn remaining(&self) -> u64 {
            (self.end.base() - self.next.base()) >> 12
        }
    }

    impl FrameAlloc for BumpAlloc {
        fn alloc_4k<M: PhysMapper>(&mut self, _: &mut M) -> Option<PhysicalPage<Size4K>> {
            if self.next >= self.end {
                return None;
            }
            let p = self.next;
            self.next = self.next.next();
            Some(p)
        }

        fn release_4k<M: PhysMapper>(&mut self, _: &mut M, frame: PhysicalPage<Size4K>) {
            self.released.push(frame);
        }
    }
}
