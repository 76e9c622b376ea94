//! # Multiboot2 Boot Information
//!
//! Parsers for the three multiboot2 tag payloads the memory subsystem consumes.
//! Each parser takes the tag **payload** (the bytes after the generic
//! `type u32, size u32` tag header) and borrows from it; nothing is copied
//! until the frame allocator records the usable sections.
//!
//! | Tag | Parser | Result |
//! |-----|--------|--------|
//! | Memory map (type 6) | [`MemoryMap::parse`] | usable RAM ranges |
//! | ELF symbols (type 9) | [`ElfSections::parse`] | kernel image extent |
//! | Frame buffer (type 8) | [`FramebufferInfo::parse`] | VESA linear frame buffer |
//!
//! All multi-byte fields are little endian. Malformed payloads produce a
//! [`BootInfoError`]; the kernel treats any of them as fatal.

mod elf_symbols;
mod framebuffer;
mod memory_map;
#[cfg(any(test, feature = "payloads"))]
pub mod payload;

pub use elf_symbols::{ElfSection, ElfSections};
pub use framebuffer::{ColourField, FramebufferInfo};
pub use memory_map::{MemoryKind, MemoryMap, MemoryMapEntry};

/// Errors raised while decoding boot information payloads.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BootInfoError {
    #[error("{tag} payload truncated: need {needed} bytes, got {actual}")]
    Truncated {
        tag: &'static str,
        needed: usize,
        actual: usize,
    },
    #[error("unsupported memory map entry size {0} (expected 24)")]
    EntrySize(u32),
    #[error("unsupported memory map entry version {0} (expected 0)")]
    EntryVersion(u32),
    #[error("memory map length {len} is not a multiple of the entry size {entry_size}")]
    RaggedMemoryMap { len: usize, entry_size: usize },
    #[error("ELF section header size {0} is smaller than 64 bytes")]
    SectionHeaderSize(u32),
    #[error("ELF symbols contain no loaded section")]
    NoLoadedSection,
    #[error("unsupported frame buffer depth {0} (expected 32)")]
    Depth(u8),
    #[error("unsupported frame buffer colour type {0} (expected direct RGB)")]
    ColourType(u8),
    #[error("frame buffer reserved field is {0:#x}, expected 0")]
    Reserved(u8),
}

/// Little-endian cursor over a borrowed payload.
///
/// Bounds are checked once by the caller against the payload length, the
/// reader itself only slices.
#[derive(Clone, Copy)]
struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    const fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    const fn at(bytes: &'a [u8], pos: usize) -> Self {
        Self { bytes, pos }
    }

    fn take<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.bytes[self.pos..self.pos + N]);
        self.pos += N;
        out
    }

    fn u8(&mut self) -> u8 {
        self.take::<1>()[0]
    }

    fn u32(&mut self) -> u32 {
        u32::from_le_bytes(self.take())
    }

    fn u64(&mut self) -> u64 {
        u64::from_le_bytes(self.take())
    }

    const fn skip(&mut self, n: usize) {
        self.pos += n;
    }
}

const fn ensure_len(tag: &'static str, bytes: &[u8], needed: usize) -> Result<(), BootInfoError> {
    if bytes.len() < needed {
        Err(BootInfoError::Truncated {
            tag,
            needed,
            actual: bytes.len(),
        })
    } else {
        Ok(())
    }
}
