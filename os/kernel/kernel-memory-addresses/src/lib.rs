//! # Virtual and Physical Memory Address Types
//!
//! Strongly typed wrappers for raw addresses and page bases used by the
//! frame allocator, the page table manager and the heap.
//!
//! | Type | Meaning |
//! |------|---------|
//! | [`PhysicalAddress`] / [`PhysicalPage<S>`] | Physical memory or MMIO, frames |
//! | [`VirtualAddress`] / [`VirtualPage<S>`] | Page-table translated memory |
//! | [`PhysicalRange`] | Half-open physical interval (RAM section, kernel image) |
//!
//! Page sizes are marker types implementing [`PageSize`]: [`Size4K`],
//! [`Size2M`] and [`Size1G`].
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let va = VirtualAddress::new(0xFFFF_8000_0040_1234);
//! let page = va.page::<Size4K>();
//! assert_eq!(page.base().as_u64() + va.offset::<Size4K>(), va.as_u64());
//!
//! let pa = PhysicalAddress::new(0x0000_0010_2000_0042);
//! assert_eq!(pa.align_up::<Size2M>().as_u64(), 0x0000_0010_2020_0000);
//! ```
//!
//! All types are `#[repr(transparent)]` over `u64` and all alignment math is
//! `const fn`.

#![cfg_attr(not(any(test, doctest)), no_std)]

mod align;
mod page_size;
mod physical_address;
mod physical_page;
mod range;
mod virtual_address;
mod virtual_page;

pub use align::{align_down, align_up, is_aligned, log2_up};
pub use page_size::{PageSize, Size1G, Size2M, Size4K};
pub use physical_address::PhysicalAddress;
pub use physical_page::PhysicalPage;
pub use range::PhysicalRange;
pub use virtual_address::VirtualAddress;
pub use virtual_page::VirtualPage;
