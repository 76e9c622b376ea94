use crate::level::Level;
use bitfield_struct::bitfield;
use kernel_memory_addresses::{PageSize, PhysicalAddress, PhysicalPage, Size1G, Size2M, Size4K};

/// A single 64-bit x86-64 page table entry.
///
/// The same layout serves all four levels. An entry either points to the
/// next-level table or, with `huge` set in a level 3 or level 2 entry, maps a
/// 1 GiB or 2 MiB page directly.
///
/// | Bits   | Field             | Meaning |
/// |--------|-------------------|---------|
/// | 0      | `present`         | Entry is valid |
/// | 1      | `writable`        | Writes allowed |
/// | 2      | `user_accessible` | CPL 3 may access |
/// | 3      | `write_through`   | PWT |
/// | 4      | `no_cache`        | PCD |
/// | 5      | `accessed`        | Set by the CPU on access |
/// | 6      | `dirty`           | Set by the CPU on write (leaf only) |
/// | 7      | `huge`            | PS, large page at L3/L2 |
/// | 8      | `global`          | Survives CR3 reloads (leaf only) |
/// | 9–11   | `os_low`          | Free for the OS |
/// | 12–51  | `phy_addr`        | Physical frame bits \[51:12\] |
/// | 52–62  | `os_high`         | Free for the OS |
/// | 63     | `no_exe`          | Execute disable |
///
/// An entry is either all zero (absent) or `present` with a valid address.
///
/// ```rust
/// # use kernel_memory_addresses::*;
/// # use kernel_vmem::{Level, PageTableEntry};
/// let table = PhysicalPage::<Size4K>::from_aligned(PhysicalAddress::new(0x5000));
/// let e = PageTableEntry::init(Level::L4, table);
/// assert!(e.present() && e.writable() && !e.huge());
/// assert_eq!(e.next_table(), Some(table));
/// ```
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageTableEntry {
    pub present: bool,
    pub writable: bool,
    pub user_accessible: bool,
    pub write_through: bool,
    pub no_cache: bool,
    pub accessed: bool,
    pub dirty: bool,
    pub huge: bool,
    pub global: bool,
    #[bits(3)]
    pub os_low: u8,
    #[bits(40)]
    phy_addr: u64,
    #[bits(11)]
    pub os_high: u16,
    pub no_exe: bool,
}

impl PageTableEntry {
    /// Mask of the physical address field.
    pub const ADDRESS_MASK: u64 = 0x000F_FFFF_FFFF_F000;

    /// The absent entry.
    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self::new()
    }

    #[inline]
    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.into_bits() == 0
    }

    /// Builds a present, writable entry at `level` referring to `pa`.
    ///
    /// For `S = Size4K` at levels 4 to 2 the entry links the next table; at
    /// level 1 it maps a 4 KiB page. `Size2M` at level 2 and `Size1G` at
    /// level 3 produce large-page leaves with `huge` set.
    ///
    /// # Panics
    /// If `level` cannot hold an entry of size `S`.
    #[must_use]
    pub fn init<S: PageSize>(level: Level, pa: PhysicalPage<S>) -> Self {
        assert!(
            level.accepts::<S>(),
            "level {level} entries cannot refer to {} pages",
            S::NAME
        );
        assert!(pa.base().is_aligned::<S>());

        let mut e = Self::new().with_present(true).with_writable(true);
        e.set_physical_address(pa.base());
        if S::SIZE == Size2M::SIZE || S::SIZE == Size1G::SIZE {
            e.set_huge(true);
        }
        e
    }

    #[inline]
    pub const fn set_physical_address(&mut self, pa: PhysicalAddress) {
        self.set_phy_addr(pa.as_u64() >> 12);
    }

    #[inline]
    #[must_use]
    pub const fn physical_address(self) -> PhysicalAddress {
        PhysicalAddress::new(self.phy_addr() << 12)
    }

    /// The table this entry links to, if it is present and not a leaf.
    ///
    /// Only meaningful at levels 4 to 2; a level 1 entry is always a leaf.
    #[inline]
    #[must_use]
    pub fn next_table(self) -> Option<PhysicalPage<Size4K>> {
        if self.present() && !self.huge() {
            Some(PhysicalPage::from_aligned(self.physical_address()))
        } else {
            None
        }
    }
}
