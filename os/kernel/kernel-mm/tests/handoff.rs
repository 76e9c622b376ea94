//! Boot hand-off validation, before any page table is touched.

use kernel_alloc::{BootstrapPool, FrameAllocatorError};
use kernel_info::boot::BootInfoError;
use kernel_info::boot::payload::{elf_symbols, memory_map};
use kernel_info::memory::{LayoutError, MemoryLayout};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, VirtualAddress};
use kernel_mm::{BootHandoff, MemoryError, MemorySubsystem, Stage};
use kernel_vmem::SoftMmu;

const MIB: u64 = 1 << 20;

fn subsystem() -> MemorySubsystem<SoftMmu> {
    MemorySubsystem::new(SoftMmu::new(), MemoryLayout::DEFAULT).unwrap()
}

fn pool() -> BootstrapPool {
    BootstrapPool::new(PhysicalPage::from_aligned(PhysicalAddress::new(0x20_0000)), 16)
}

#[test]
fn rejects_a_broken_layout() {
    let mut layout = MemoryLayout::DEFAULT;
    layout.heap = VirtualAddress::new(layout.heap.as_u64() + 1);
    let err = MemorySubsystem::<SoftMmu>::new(SoftMmu::new(), layout).err();
    assert_eq!(
        err,
        Some(MemoryError::Layout(LayoutError::Unaligned(layout.heap.as_u64())))
    );
}

#[test]
fn rejects_a_malformed_memory_map() {
    let mut map = memory_map(&[(0, 64 * MIB, 1)]);
    map.pop();
    let sections = elf_symbols(&[(1, 0x10_0000, 2 * MIB)]);
    let handoff = BootHandoff {
        memory_map: &map,
        elf_symbols: &sections,
        framebuffer: None,
        pool: pool(),
        probe: PhysicalAddress::new(0x10_1000),
    };

    let mut mm = subsystem();
    assert!(matches!(
        mm.bootstrap_1(&handoff),
        Err(MemoryError::Frames(FrameAllocatorError::Boot(
            BootInfoError::RaggedMemoryMap { .. }
        )))
    ));
}

#[test]
fn rejects_a_probe_outside_the_image() {
    let map = memory_map(&[(0, 64 * MIB, 1)]);
    let sections = elf_symbols(&[(0, 0, 0), (1, 0x10_0000, 2 * MIB)]);
    let handoff = BootHandoff {
        memory_map: &map,
        elf_symbols: &sections,
        framebuffer: None,
        pool: pool(),
        probe: PhysicalAddress::new(32 * MIB),
    };

    let mut mm = subsystem();
    assert!(matches!(
        mm.bootstrap_1(&handoff),
        Err(MemoryError::Frames(FrameAllocatorError::ProbeOutsideImage { .. }))
    ));
}

#[test]
fn rejects_a_bad_frame_buffer_descriptor() {
    let map = memory_map(&[(0, 64 * MIB, 1)]);
    let sections = elf_symbols(&[(1, 0x10_0000, 2 * MIB)]);
    let fb = [0u8; 12];
    let handoff = BootHandoff {
        memory_map: &map,
        elf_symbols: &sections,
        framebuffer: Some(&fb),
        pool: pool(),
        probe: PhysicalAddress::new(0x10_1000),
    };

    let mut mm = subsystem();
    assert!(matches!(
        mm.bootstrap_1(&handoff),
        Err(MemoryError::Boot(BootInfoError::Truncated { .. }))
    ));
    assert_eq!(mm.stage(), Stage::PrePaging);
}

#[test]
fn stage_names_are_readable() {
    assert_eq!(Stage::SteadyState.to_string(), "stage 2 (steady state)");
    assert!(Stage::PrePaging < Stage::HeapReady);
}
