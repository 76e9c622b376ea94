//! Hosted machine for pipeline tests.
//!
//! A 16 MiB, 2 MiB-aligned host buffer plays physical RAM; its addresses are
//! used as physical addresses and a [`SoftMmu`] walks the tables. Relative to
//! the buffer base `B`:
//!
//! ```text
//! B + 0M   ┌ usable ─────────────────────┐
//! B + 1M   │ kernel image, pool (256)    │
//! B + 3M   │                             │
//! B + 4M   │ managed                     │
//! B + 10M  ├ reserved: frame buffer (1M) ┤
//! B + 11M  ├ usable, managed ────────────┤
//! B + 16M  └─────────────────────────────┘
//! ```
//!
//! Frames below the 2 MiB boundary past the kernel image are never managed.

use std::alloc::{Layout, alloc_zeroed, dealloc};

use kernel_alloc::BootstrapPool;
use kernel_info::boot::payload::{elf_symbols, framebuffer, memory_map};
use kernel_info::memory::MemoryLayout;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage};
use kernel_vmem::SoftMmu;

use crate::{BootHandoff, MemorySubsystem};

pub const MIB: u64 = 1 << 20;

/// Frames the test machine manages once in steady state: `[B+4M, B+10M)`
/// and `[B+11M, B+16M)`.
pub const MANAGED_FRAMES: u64 = (16 - 4 - 1) * MIB / 4096;

pub type TestSubsystem = MemorySubsystem<SoftMmu, 5>;

pub struct HostRam {
    ptr: *mut u8,
    layout: Layout,
}

impl HostRam {
    pub fn new() -> Self {
        let layout = Layout::from_size_align(16 * MIB as usize, 2 * MIB as usize).unwrap();
        let ptr = unsafe { alloc_zeroed(layout) };
        assert!(!ptr.is_null());
        Self { ptr, layout }
    }

    pub fn at(&self, offset: u64) -> u64 {
        PhysicalAddress::from_ptr(self.ptr).as_u64() + offset
    }

    pub fn page(&self, offset: u64) -> PhysicalPage<kernel_memory_addresses::Size4K> {
        PhysicalPage::from_aligned(PhysicalAddress::new(self.at(offset)))
    }

    pub fn read_u64(&self, offset: u64) -> u64 {
        unsafe { PhysicalAddress::new(self.at(offset)).as_identity_ptr::<u64>().read() }
    }
}

impl Drop for HostRam {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr, self.layout) };
    }
}

/// 1024 pixels of 32 bits per line, no padding: `height` lines take
/// `height * 4 KiB`.
pub fn vesa(paddr: u64, height: u32) -> Vec<u8> {
    framebuffer(paddr, 4096, height, 32, 1)
}

/// Boot payloads describing the test machine.
pub struct Boot {
    pub memory_map: Vec<u8>,
    pub elf_symbols: Vec<u8>,
    pub framebuffer: Vec<u8>,
    pub pool: BootstrapPool,
    pub probe: PhysicalAddress,
}

impl Boot {
    pub fn new(ram: &HostRam) -> Self {
        Self {
            memory_map: memory_map(&[
                (ram.at(0), 10 * MIB, 1),
                (ram.at(10 * MIB), MIB, 2),
                (ram.at(11 * MIB), 5 * MIB, 1),
            ]),
            elf_symbols: elf_symbols(&[
                (0, 0, 0),
                (1, ram.at(MIB), MIB),
                (1, ram.at(2 * MIB), MIB),
            ]),
            framebuffer: vesa(ram.at(10 * MIB), 256),
            pool: BootstrapPool::new(ram.page(MIB), 256),
            probe: PhysicalAddress::new(ram.at(2 * MIB + 0x100)),
        }
    }

    pub fn handoff(&self) -> BootHandoff<'_> {
        BootHandoff {
            memory_map: &self.memory_map,
            elf_symbols: &self.elf_symbols,
            framebuffer: Some(&self.framebuffer),
            pool: self.pool,
            probe: self.probe,
        }
    }
}

/// A subsystem on the test machine, advanced to stage 2.
pub fn steady(boot: &Boot) -> TestSubsystem {
    let mut mm = TestSubsystem::new(SoftMmu::new(), MemoryLayout::DEFAULT).unwrap();
    mm.bootstrap_1(&boot.handoff()).unwrap();
    mm.bootstrap_2().unwrap();
    mm
}
