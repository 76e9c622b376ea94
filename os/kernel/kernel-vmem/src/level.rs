use core::fmt;
use kernel_memory_addresses::{PageSize, Size1G, Size2M, Size4K, VirtualAddress};

/// Paging level in the 4-level x86-64 hierarchy.
///
/// `L4` is the root (PML4), `L1` the page table holding 4 KiB leaves.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Level {
    L1 = 1,
    L2 = 2,
    L3 = 3,
    L4 = 4,
}

impl Level {
    /// Levels from root to leaf.
    pub const WALK: [Self; 4] = [Self::L4, Self::L3, Self::L2, Self::L1];

    #[inline]
    #[must_use]
    pub const fn number(self) -> u8 {
        self as u8
    }

    /// Bit position of this level's index within a virtual address.
    #[inline]
    #[must_use]
    pub const fn shift(self) -> u32 {
        (self as u32 - 1) * 9 + 12
    }

    /// Bytes covered by one entry at this level.
    #[inline]
    #[must_use]
    pub const fn covers(self) -> u64 {
        1 << self.shift()
    }

    /// Index (0..512) of the entry at this level that translates `va`.
    ///
    /// ```rust
    /// # use kernel_memory_addresses::VirtualAddress;
    /// # use kernel_vmem::Level;
    /// let va = VirtualAddress::new(0xFFFF_8000_0020_3000);
    /// assert_eq!(Level::L4.index_of(va), 256);
    /// assert_eq!(Level::L2.index_of(va), 1);
    /// assert_eq!(Level::L1.index_of(va), 3);
    /// ```
    #[inline]
    #[must_use]
    pub const fn index_of(self, va: VirtualAddress) -> usize {
        ((va.as_u64() >> self.shift()) & 0x1ff) as usize
    }

    /// The next level towards the leaves.
    #[inline]
    #[must_use]
    pub const fn lower(self) -> Option<Self> {
        match self {
            Self::L4 => Some(Self::L3),
            Self::L3 => Some(Self::L2),
            Self::L2 => Some(Self::L1),
            Self::L1 => None,
        }
    }

    /// Whether an entry at this level may refer to a page of size `S`.
    ///
    /// `Size4K` is accepted everywhere (a table link above `L1`, a leaf at
    /// `L1`). Large pages live at `L2` (2 MiB) and `L3` (1 GiB).
    #[must_use]
    pub const fn accepts<S: PageSize>(self) -> bool {
        match self {
            Self::L4 | Self::L1 => S::SIZE == Size4K::SIZE,
            Self::L3 => S::SIZE == Size4K::SIZE || S::SIZE == Size1G::SIZE,
            Self::L2 => S::SIZE == Size4K::SIZE || S::SIZE == Size2M::SIZE,
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.number())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coverage() {
        assert_eq!(Level::L1.covers(), Size4K::SIZE);
        assert_eq!(Level::L2.covers(), Size2M::SIZE);
        assert_eq!(Level::L3.covers(), Size1G::SIZE);
        assert_eq!(Level::L4.covers(), 512 * Size1G::SIZE);
    }

    #[test]
    fn indices_of_highest_address() {
        let va = VirtualAddress::new(0xFFFF_FFFF_FFFF_F000);
        for level in Level::WALK {
            assert_eq!(level.index_of(va), 511);
        }
    }

    #[test]
    fn lower_walks_to_the_leaf() {
        let mut level = Level::L4;
        let mut seen = 1;
        while let Some(next) = level.lower() {
            level = next;
            seen += 1;
        }
        assert_eq!(level, Level::L1);
        assert_eq!(seen, 4);
    }
}
