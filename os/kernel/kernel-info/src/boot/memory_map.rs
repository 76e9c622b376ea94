use super::{BootInfoError, Reader, ensure_len};
use kernel_memory_addresses::{PhysicalAddress, PhysicalRange};

/// Size of one memory map record.
pub const ENTRY_SIZE: u32 = 24;

/// The only entry version defined by multiboot2.
pub const ENTRY_VERSION: u32 = 0;

/// Memory map region type.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MemoryKind {
    /// Usable RAM (type 1).
    Available,
    /// ACPI tables, reclaimable after parsing (type 3).
    AcpiReclaimable,
    /// Must be preserved across hibernation (type 4).
    Nvs,
    /// Defective RAM (type 5).
    Bad,
    /// Reserved or unknown.
    Reserved(u32),
}

impl MemoryKind {
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        match raw {
            1 => Self::Available,
            3 => Self::AcpiReclaimable,
            4 => Self::Nvs,
            5 => Self::Bad,
            other => Self::Reserved(other),
        }
    }
}

/// One record of the memory map: `base u64, len u64, type u32, reserved u32`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MemoryMapEntry {
    pub base: PhysicalAddress,
    pub len: u64,
    pub kind: MemoryKind,
}

impl MemoryMapEntry {
    #[must_use]
    pub const fn range(&self) -> PhysicalRange {
        PhysicalRange::with_len(self.base, self.len)
    }

    #[must_use]
    pub const fn is_usable(&self) -> bool {
        matches!(self.kind, MemoryKind::Available)
    }
}

/// Validated view over a multiboot2 memory map payload.
///
/// ```text
/// | entry_size u32 | entry_version u32 | entry 0 | entry 1 | ... |
/// ```
#[derive(Debug, Clone, Copy)]
pub struct MemoryMap<'a> {
    entries: &'a [u8],
}

impl<'a> MemoryMap<'a> {
    /// Validates the payload header.
    ///
    /// # Errors
    /// The entry size must be 24, the version 0 and the record area a whole
    /// number of records.
    pub fn parse(payload: &'a [u8]) -> Result<Self, BootInfoError> {
        ensure_len("memory map", payload, 8)?;
        let mut r = Reader::new(payload);
        let entry_size = r.u32();
        let entry_version = r.u32();

        if entry_size != ENTRY_SIZE {
            return Err(BootInfoError::EntrySize(entry_size));
        }
        if entry_version != ENTRY_VERSION {
            return Err(BootInfoError::EntryVersion(entry_version));
        }

        let entries = &payload[8..];
        if !entries.len().is_multiple_of(ENTRY_SIZE as usize) {
            return Err(BootInfoError::RaggedMemoryMap {
                len: entries.len(),
                entry_size: ENTRY_SIZE as usize,
            });
        }

        Ok(Self { entries })
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.entries.len() / ENTRY_SIZE as usize
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All records in firmware order.
    pub fn entries(&self) -> impl Iterator<Item = MemoryMapEntry> + use<'a> {
        let bytes = self.entries;
        (0..self.len()).map(move |i| {
            let mut r = Reader::at(bytes, i * ENTRY_SIZE as usize);
            let base = PhysicalAddress::new(r.u64());
            let len = r.u64();
            let kind = MemoryKind::from_raw(r.u32());
            // The trailing reserved word is not guaranteed to be zero on real
            // hardware and is ignored.
            MemoryMapEntry { base, len, kind }
        })
    }

    /// Usable RAM records (type 1) only.
    pub fn usable(&self) -> impl Iterator<Item = PhysicalRange> + use<'a> {
        self.entries()
            .filter(MemoryMapEntry::is_usable)
            .map(|e| e.range())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boot::payload::memory_map as payload;

    #[test]
    fn keeps_only_available_entries() {
        let bytes = payload(&[
            (0, 0x9_fc00, 1),
            (0x9_fc00, 0x400, 2),
            (0x10_0000, 0x7ee_0000, 1),
            (0xfffc_0000, 0x4_0000, 2),
        ]);
        let map = MemoryMap::parse(&bytes).unwrap();
        assert_eq!(map.len(), 4);
        assert_eq!(map.entries().nth(1).unwrap().kind, MemoryKind::Reserved(2));

        let usable: Vec<_> = map.usable().collect();
        assert_eq!(usable.len(), 2);
        assert_eq!(usable[1].start().as_u64(), 0x10_0000);
        assert_eq!(usable[1].len(), 0x7ee_0000);
    }

    #[test]
    fn rejects_bad_headers() {
        let mut bytes = payload(&[(0, 0x1000, 1)]);
        bytes[0] = 20;
        assert_eq!(MemoryMap::parse(&bytes).unwrap_err(), BootInfoError::EntrySize(20));

        let mut bytes = payload(&[(0, 0x1000, 1)]);
        bytes[4] = 1;
        assert_eq!(MemoryMap::parse(&bytes).unwrap_err(), BootInfoError::EntryVersion(1));

        let mut bytes = payload(&[(0, 0x1000, 1)]);
        bytes.pop();
        assert!(matches!(
            MemoryMap::parse(&bytes),
            Err(BootInfoError::RaggedMemoryMap { len: 23, .. })
        ));

        assert!(matches!(
            MemoryMap::parse(&[0u8; 4]),
            Err(BootInfoError::Truncated { .. })
        ));
    }

    #[test]
    fn empty_map_is_valid() {
        let bytes = payload(&[]);
        let map = MemoryMap::parse(&bytes).unwrap();
        assert!(map.is_empty());
        assert_eq!(map.usable().count(), 0);
    }
}
