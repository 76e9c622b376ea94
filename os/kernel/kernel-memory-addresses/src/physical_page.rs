use crate::{PageSize, PhysicalAddress};
use core::fmt;
use core::marker::PhantomData;

/// Page-aligned base of a physical page of size `S`.
///
/// Frames handed out by the frame allocator and the targets of page-table
/// entries are `PhysicalPage<Size4K>`; large identity mappings use
/// `PhysicalPage<Size2M>`.
///
/// ### Invariants
/// - The low `S::SHIFT` bits of the base are zero.
///
/// ### Examples
/// ```rust
/// # use kernel_memory_addresses::*;
/// let frame = PhysicalPage::<Size4K>::from_aligned(PhysicalAddress::new(0x20_0000));
/// assert_eq!(frame.next().base().as_u64(), 0x20_1000);
/// assert_eq!(frame.base().page::<Size2M>().base(), frame.base());
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalPage<S: PageSize> {
    base: u64,
    _size: PhantomData<S>,
}

impl<S: PageSize> PhysicalPage<S> {
    /// The page that contains `addr` (aligns down).
    #[inline]
    #[must_use]
    pub const fn containing(addr: PhysicalAddress) -> Self {
        Self {
            base: addr.as_u64() & !(S::SIZE - 1),
            _size: PhantomData,
        }
    }

    /// Wraps an address that must already be aligned to `S`.
    ///
    /// # Panics
    /// If `addr` is not aligned to `S::SIZE`.
    #[inline]
    #[must_use]
    pub const fn from_aligned(addr: PhysicalAddress) -> Self {
        assert!(addr.is_aligned::<S>(), "unaligned physical page address");
        Self::containing(addr)
    }

    /// Like [`from_aligned`](Self::from_aligned) but returns `None` if unaligned.
    #[inline]
    #[must_use]
    pub const fn try_from_aligned(addr: PhysicalAddress) -> Option<Self> {
        if addr.is_aligned::<S>() {
            Some(Self::containing(addr))
        } else {
            None
        }
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> PhysicalAddress {
        PhysicalAddress::new(self.base)
    }

    /// End of the page (exclusive).
    #[inline]
    #[must_use]
    pub const fn end(self) -> PhysicalAddress {
        PhysicalAddress::new(self.base + S::SIZE)
    }

    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        self.add(1)
    }

    /// The page `n` pages above this one.
    #[inline]
    #[must_use]
    pub const fn add(self, n: u64) -> Self {
        Self {
            base: self.base + n * S::SIZE,
            _size: PhantomData,
        }
    }

    /// Identity-mapped pointer to the start of this page.
    #[inline]
    #[must_use]
    pub const fn as_identity_ptr<T>(self) -> *mut T {
        self.base().as_identity_ptr()
    }
}

impl<S: PageSize> fmt::Display for PhysicalPage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}/{}", self.base, S::NAME)
    }
}

impl<S: PageSize> fmt::Debug for PhysicalPage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysicalPage<{}>(0x{:016X})", S::NAME, self.base)
    }
}

impl<S: PageSize> From<PhysicalPage<S>> for PhysicalAddress {
    #[inline]
    fn from(value: PhysicalPage<S>) -> Self {
        value.base()
    }
}
