//! # Kernel Memory Subsystem
//!
//! Ties the frame allocator, the page table manager, the buddy heap and the
//! arena allocator into one context object, [`MemorySubsystem`], and walks it
//! through the boot stages:
//!
//! ```text
//! Stage 0  PrePaging        physical == virtual, nothing of ours is loaded
//!    │ bootstrap_1          parse boot info, identity map RAM and frame buffer
//! Stage 1  BootstrapPaging  frames come from the bootstrap pool
//!    │ bootstrap_2          build the final space, free list, switch, tear down
//! Stage 2  SteadyState      page_map / page_unmap / frame_alloc / direct_access
//!    │ bootstrap_3          open the heap window
//! Stage 3  HeapReady        heap_alloc / allocator_new / allocate
//! ```
//!
//! The final address space maps only what the kernel needs: its own image at
//! the physical address, the stack between two guard pages, the relocated
//! frame buffer, the direct-access page and the heap window. Everything else
//! is reached one frame at a time through the direct-access slot.
//!
//! The subsystem is single threaded and passed around by `&mut`; calling an
//! operation in the wrong stage panics.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod error;
mod pool;
mod stage;
mod subsystem;
#[cfg(test)]
mod testing;

pub use error::MemoryError;
pub use pool::{BOOTSTRAP_FRAMES, BootstrapFrames};
pub use stage::Stage;
pub use subsystem::{FrameBuffer, MemorySubsystem};

use kernel_alloc::BootstrapPool;
use kernel_memory_addresses::PhysicalAddress;

/// What the boot code hands to [`MemorySubsystem::bootstrap_1`].
#[derive(Debug, Copy, Clone)]
pub struct BootHandoff<'a> {
    /// Multiboot2 memory map tag payload.
    pub memory_map: &'a [u8],
    /// Multiboot2 ELF symbols tag payload.
    pub elf_symbols: &'a [u8],
    /// VESA frame buffer descriptor, if the loader set up one.
    pub framebuffer: Option<&'a [u8]>,
    /// Frames for the first page tables, inside the kernel image.
    pub pool: BootstrapPool,
    /// An address inside the running kernel code.
    pub probe: PhysicalAddress,
}
