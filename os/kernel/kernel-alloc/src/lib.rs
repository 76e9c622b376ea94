//! # Kernel Memory Allocation
//!
//! The three allocators of the memory core, from the bottom up:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 Arena ([`arena`])                   │
//! │    • per-owner bump allocation                      │
//! │    • whole-group teardown                           │
//! └─────────────────┬───────────────────────────────────┘
//!                   │ areas
//! ┌─────────────────▼───────────────────────────────────┐
//! │              Buddy Heap ([`heap`])                  │
//! │    • power-of-two page classes                      │
//! │    • eager coalescing, grows by whole units         │
//! └─────────────────┬───────────────────────────────────┘
//!                   │ HeapBacking (frames + mappings)
//! ┌─────────────────▼───────────────────────────────────┐
//! │           Physical Frame Allocator ([`frame`])      │
//! │    • bootstrap pool, then intrusive free list       │
//! │    • usable sections from the boot memory map       │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! None of the allocators owns a global; the kernel keeps them in its memory
//! context and passes the pieces each call needs (a [`PhysMapper`] for the
//! frame allocator, a [`heap::HeapBacking`] for the heap, the heap and its
//! backing for the arena).
//!
//! [`PhysMapper`]: kernel_vmem::PhysMapper

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod arena;
pub mod frame;
pub mod heap;

pub use arena::{ArenaPool, MmAllocator};
pub use frame::{BootstrapPool, FrameAllocator, FrameAllocatorError};
pub use heap::{BuddyHeap, HeapBacking, HeapError, HeapStats};

#[cfg(test)]
pub(crate) mod testing {
    use crate::heap::{BuddyHeap, HeapBacking, HeapError};
    use kernel_memory_addresses::VirtualAddress;

    #[repr(C, align(4096))]
    struct Page([u8; 4096]);

    /// Host memory standing in for a higher-half heap window.
    ///
    /// The heap sees the window at [`BASE`](Self::BASE); [`resolve`] translates
    /// into the host pages, so any access that bypasses it faults. Commits are
    /// recorded instead of mapped; setting `fail` makes them error.
    ///
    /// [`resolve`]: HeapBacking::resolve
    pub struct HostWindow {
        pages: Vec<Page>,
        host: *mut u8,
        pub commits: Vec<(VirtualAddress, u64)>,
        pub fail: bool,
    }

    impl HostWindow {
        pub const BASE: VirtualAddress = VirtualAddress::new(0xFFFF_8000_4000_0000);

        pub fn new(pages: usize) -> Self {
            let mut pages: Vec<_> = (0..pages).map(|_| Page([0xAA; 4096])).collect();
            let host = pages.as_mut_ptr().cast::<u8>();
            Self {
                pages,
                host,
                commits: Vec::new(),
                fail: false,
            }
        }

        /// A heap spanning the whole window.
        pub fn heap<const N: usize>(&self) -> BuddyHeap<N> {
            let units = self.pages.len() as u64 / BuddyHeap::<N>::UNIT_PAGES;
            BuddyHeap::new(Self::BASE, units)
        }
    }

    impl HeapBacking for HostWindow {
        fn commit(&mut self, va: VirtualAddress, pages: u64) -> Result<(), HeapError> {
            if self.fail {
                return Err(HeapError::OutOfMemory);
            }
            self.commits.push((va, pages));
            Ok(())
        }

        fn resolve(&self, va: VirtualAddress) -> *mut u8 {
            let offset = va.as_u64() - Self::BASE.as_u64();
            let committed: u64 = self.commits.iter().map(|&(_, n)| n * 4096).sum();
            assert!(offset < committed, "{va} is not committed");
            self.host.wrapping_add(offset as usize)
        }
    }
}
