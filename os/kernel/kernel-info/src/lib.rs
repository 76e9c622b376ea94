//! # Kernel Configuration and Boot Interface
//!
//! The data the memory subsystem receives from the bootloader and the fixed
//! configuration it runs with.
//!
//! ## Boot Information ([`boot`])
//!
//! The bootloader (GRUB, multiboot2) leaves three tags the memory core reads:
//!
//! * **Memory map**: usable RAM ranges; only `type == 1` entries are RAM.
//! * **ELF symbols**: section headers of the loaded kernel, used to find the
//!   physical extent of the kernel image so it is never handed out as free.
//! * **Frame buffer**: the VESA linear frame buffer, which is mapped into a
//!   fixed high-half window once paging is rebuilt.
//!
//! Tag iteration itself belongs to the boot glue; the parsers here take the
//! raw tag payloads as byte slices.
//!
//! ## Memory Layout ([`memory`])
//!
//! Capacities (bootstrap frame pool, section table, heap classes) and the
//! high-half virtual layout (stack with guards, frame buffer window,
//! direct-access page, heap window). The layout is a value, [`memory::MemoryLayout`],
//! so that tests and other boards can move the windows around; the
//! compile-time defaults are validated by `const` assertions.
//!
//! ## Usage
//!
//! ```rust
//! use kernel_info::memory::MemoryLayout;
//!
//! let layout = MemoryLayout::DEFAULT;
//! assert!(layout.check().is_ok());
//! assert!(layout.heap > layout.direct_access);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

#[cfg(any(test, feature = "payloads"))]
extern crate alloc;

pub mod boot;
pub mod memory;
