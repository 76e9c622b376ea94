use super::{BootInfoError, Reader, ensure_len};
use kernel_memory_addresses::{PhysicalAddress, PhysicalRange};

/// Size of the `num, section_size, shndx` header.
const HEADER_LEN: usize = 12;

/// Size of an ELF64 section header.
pub const ELF64_SECTION_HEADER_LEN: u32 = 64;

/// The fields of an ELF64 section header the kernel looks at.
///
/// On-disk layout (64 bytes):
///
/// ```text
/// name u32 | type u32 | flags u64 | addr u64 | offset u64 | size u64 |
/// link u32 | info u32 | alignment u64 | entry_size u64
/// ```
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ElfSection {
    pub kind: u32,
    pub flags: u64,
    pub addr: u64,
    pub size: u64,
}

impl ElfSection {
    /// `SHT_NULL` sections carry no image bytes.
    #[must_use]
    pub const fn is_loaded(&self) -> bool {
        self.kind != 0
    }
}

/// Validated view over a multiboot2 ELF-symbols payload.
#[derive(Debug, Clone, Copy)]
pub struct ElfSections<'a> {
    sections: &'a [u8],
    count: usize,
    stride: usize,
    shndx: u32,
}

impl<'a> ElfSections<'a> {
    /// # Errors
    /// The header must announce at least 64-byte section headers and the
    /// payload must hold `num` of them.
    pub fn parse(payload: &'a [u8]) -> Result<Self, BootInfoError> {
        ensure_len("ELF symbols", payload, HEADER_LEN)?;
        let mut r = Reader::new(payload);
        let num = r.u32() as usize;
        let section_size = r.u32();
        let shndx = r.u32();

        if section_size < ELF64_SECTION_HEADER_LEN {
            return Err(BootInfoError::SectionHeaderSize(section_size));
        }

        let stride = section_size as usize;
        ensure_len("ELF symbols", payload, HEADER_LEN + num * stride)?;

        Ok(Self {
            sections: &payload[HEADER_LEN..],
            count: num,
            stride,
            shndx,
        })
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.count
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Index of the section-name string table.
    #[must_use]
    pub const fn string_table_index(&self) -> u32 {
        self.shndx
    }

    pub fn iter(&self) -> impl Iterator<Item = ElfSection> + use<'a> {
        let bytes = self.sections;
        let stride = self.stride;
        (0..self.count).map(move |i| {
            let mut r = Reader::at(bytes, i * stride);
            r.skip(4);
            let kind = r.u32();
            let flags = r.u64();
            let addr = r.u64();
            r.skip(8);
            let size = r.u64();
            ElfSection {
                kind,
                flags,
                addr,
                size,
            }
        })
    }

    /// Physical extent `[min addr, max addr + size)` of all loaded sections.
    ///
    /// # Errors
    /// [`BootInfoError::NoLoadedSection`] if every section is `SHT_NULL`.
    pub fn kernel_image(&self) -> Result<PhysicalRange, BootInfoError> {
        let (start, end) = self
            .iter()
            .filter(ElfSection::is_loaded)
            .fold((u64::MAX, 0u64), |(start, end), s| {
                (start.min(s.addr), end.max(s.addr + s.size))
            });

        if start > end {
            return Err(BootInfoError::NoLoadedSection);
        }

        Ok(PhysicalRange::new(
            PhysicalAddress::new(start),
            PhysicalAddress::new(end),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boot::payload::elf_symbols as payload;

    #[test]
    fn kernel_image_spans_loaded_sections() {
        let bytes = payload(&[
            (0, 0, 0),
            (1, 0x10_0000, 0x8000),
            (8, 0x10_8000, 0x2_0000),
            (1, 0x10_4000, 0x100),
        ]);
        let elf = ElfSections::parse(&bytes).unwrap();
        assert_eq!(elf.len(), 4);
        assert_eq!(elf.iter().nth(2).unwrap().kind, 8);

        let image = elf.kernel_image().unwrap();
        assert_eq!(image.start().as_u64(), 0x10_0000);
        assert_eq!(image.end().as_u64(), 0x12_8000);
    }

    #[test]
    fn null_sections_do_not_contribute() {
        let bytes = payload(&[(0, 0x1000, 0x1000), (1, 0x20_0000, 0x1000)]);
        let image = ElfSections::parse(&bytes).unwrap().kernel_image().unwrap();
        assert_eq!(image.start().as_u64(), 0x20_0000);
        assert_eq!(image.len(), 0x1000);

        let bytes = payload(&[(0, 0x1000, 0x1000)]);
        assert_eq!(
            ElfSections::parse(&bytes).unwrap().kernel_image(),
            Err(BootInfoError::NoLoadedSection)
        );
    }

    #[test]
    fn rejects_truncated_payloads() {
        let mut bytes = payload(&[(1, 0x20_0000, 0x1000)]);
        bytes.truncate(40);
        assert!(matches!(
            ElfSections::parse(&bytes),
            Err(BootInfoError::Truncated { needed: 76, .. })
        ));

        let mut bytes = payload(&[]);
        bytes[4] = 40;
        assert_eq!(
            ElfSections::parse(&bytes).unwrap_err(),
            BootInfoError::SectionHeaderSize(40)
        );
    }
}
