use crate::{PageSize, PhysicalAddress, PhysicalPage, Size4K};
use core::fmt;

/// Half-open physical range `[start, end)`.
///
/// Used for usable RAM sections from the boot memory map, the kernel image
/// extent and reserved MMIO windows such as the frame buffer.
///
/// ```rust
/// # use kernel_memory_addresses::*;
/// let ram = PhysicalRange::new(PhysicalAddress::new(0x10_0000), PhysicalAddress::new(0x80_0000));
/// let img = PhysicalRange::with_len(PhysicalAddress::new(0x20_0000), 0x1000);
/// assert!(ram.contains_range(img));
/// assert_eq!(ram.frames().count(), 0x700);
/// ```
#[derive(Copy, Clone, Default, Eq, PartialEq, Hash)]
pub struct PhysicalRange {
    start: PhysicalAddress,
    end: PhysicalAddress,
}

impl PhysicalRange {
    /// # Panics
    /// If `end < start`.
    #[inline]
    #[must_use]
    pub const fn new(start: PhysicalAddress, end: PhysicalAddress) -> Self {
        assert!(start.as_u64() <= end.as_u64(), "inverted physical range");
        Self { start, end }
    }

    #[inline]
    #[must_use]
    pub const fn with_len(start: PhysicalAddress, len: u64) -> Self {
        Self::new(start, PhysicalAddress::new(start.as_u64() + len))
    }

    #[inline]
    #[must_use]
    pub const fn start(&self) -> PhysicalAddress {
        self.start
    }

    #[inline]
    #[must_use]
    pub const fn end(&self) -> PhysicalAddress {
        self.end
    }

    #[inline]
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.end.as_u64() - self.start.as_u64()
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    #[must_use]
    pub const fn contains(&self, addr: PhysicalAddress) -> bool {
        self.start.as_u64() <= addr.as_u64() && addr.as_u64() < self.end.as_u64()
    }

    #[inline]
    #[must_use]
    pub const fn contains_range(&self, other: Self) -> bool {
        self.start.as_u64() <= other.start.as_u64() && other.end.as_u64() <= self.end.as_u64()
    }

    #[inline]
    #[must_use]
    pub const fn overlaps(&self, other: Self) -> bool {
        self.start.as_u64() < other.end.as_u64() && other.start.as_u64() < self.end.as_u64()
    }

    /// Smallest range of whole `S` pages covering this range.
    #[inline]
    #[must_use]
    pub const fn page_aligned<S: PageSize>(&self) -> Self {
        Self {
            start: self.start.align_down::<S>(),
            end: self.end.align_up::<S>(),
        }
    }

    /// Every 4 KiB frame that lies fully inside the range.
    pub fn frames(&self) -> impl Iterator<Item = PhysicalPage<Size4K>> + use<> {
        let first = self.start.align_up::<Size4K>();
        let count = self.end.as_u64().saturating_sub(first.as_u64()) >> Size4K::SHIFT;
        let first = PhysicalPage::<Size4K>::containing(first);
        (0..count).map(move |i| first.add(i))
    }
}

impl fmt::Debug for PhysicalRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}..{})", self.start, self.end)
    }
}

impl fmt::Display for PhysicalRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
