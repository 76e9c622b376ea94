//! Encoders for the multiboot2 tag payloads the parsers in this module read.
//!
//! Hosted tests across the kernel crates describe their fake machines with
//! these; nothing in the kernel proper writes boot information.

use alloc::vec::Vec;

use super::elf_symbols::ELF64_SECTION_HEADER_LEN;
use super::memory_map::{ENTRY_SIZE, ENTRY_VERSION};

/// Memory map payload from `(base, len, type)` records.
///
/// The reserved word of each record is filled with garbage, as some firmware
/// does.
#[must_use]
pub fn memory_map(entries: &[(u64, u64, u32)]) -> Vec<u8> {
    let mut v = Vec::new();
    v.extend_from_slice(&ENTRY_SIZE.to_le_bytes());
    v.extend_from_slice(&ENTRY_VERSION.to_le_bytes());
    for &(base, len, kind) in entries {
        v.extend_from_slice(&base.to_le_bytes());
        v.extend_from_slice(&len.to_le_bytes());
        v.extend_from_slice(&kind.to_le_bytes());
        v.extend_from_slice(&0xdead_u32.to_le_bytes());
    }
    v
}

/// ELF-symbols payload from `(type, addr, size)` section triples.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn elf_symbols(sections: &[(u32, u64, u64)]) -> Vec<u8> {
    let mut v = Vec::new();
    v.extend_from_slice(&(sections.len() as u32).to_le_bytes());
    v.extend_from_slice(&ELF64_SECTION_HEADER_LEN.to_le_bytes());
    v.extend_from_slice(&0u32.to_le_bytes());
    for &(kind, addr, size) in sections {
        v.extend_from_slice(&0u32.to_le_bytes()); // name
        v.extend_from_slice(&kind.to_le_bytes());
        v.extend_from_slice(&0x2u64.to_le_bytes()); // SHF_ALLOC
        v.extend_from_slice(&addr.to_le_bytes());
        v.extend_from_slice(&addr.to_le_bytes()); // offset
        v.extend_from_slice(&size.to_le_bytes());
        v.extend_from_slice(&0u32.to_le_bytes()); // link
        v.extend_from_slice(&0u32.to_le_bytes()); // info
        v.extend_from_slice(&0x1000u64.to_le_bytes());
        v.extend_from_slice(&0u64.to_le_bytes());
    }
    v
}

/// Frame buffer payload, 1024 pixels wide with a `16/8/8/0` RGB layout.
#[must_use]
pub fn framebuffer(paddr: u64, pitch: u32, height: u32, depth: u8, colour_type: u8) -> Vec<u8> {
    let mut v = Vec::new();
    v.extend_from_slice(&paddr.to_le_bytes());
    v.extend_from_slice(&pitch.to_le_bytes());
    v.extend_from_slice(&1024u32.to_le_bytes());
    v.extend_from_slice(&height.to_le_bytes());
    v.extend_from_slice(&[depth, colour_type, 0]);
    v.extend_from_slice(&[16, 8, 8, 8, 0, 8]);
    v.push(0);
    v
}
