use crate::{PageSize, VirtualAddress};
use core::fmt;
use core::marker::PhantomData;

/// Page-aligned base of a virtual page of size `S`.
///
/// ### Examples
/// ```rust
/// # use kernel_memory_addresses::*;
/// let va = VirtualAddress::new(0xFFFF_8000_0020_0123);
/// let page = va.page::<Size2M>();
/// assert_eq!(page.base().as_u64(), 0xFFFF_8000_0020_0000);
/// assert_eq!(page.next().base().as_u64(), 0xFFFF_8000_0040_0000);
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualPage<S: PageSize> {
    base: u64,
    _size: PhantomData<S>,
}

impl<S: PageSize> VirtualPage<S> {
    #[inline]
    #[must_use]
    pub const fn containing(addr: VirtualAddress) -> Self {
        Self {
            base: addr.as_u64() & !(S::SIZE - 1),
            _size: PhantomData,
        }
    }

    /// # Panics
    /// If `addr` is not aligned to `S::SIZE`.
    #[inline]
    #[must_use]
    pub const fn from_aligned(addr: VirtualAddress) -> Self {
        assert!(addr.is_aligned::<S>(), "unaligned virtual page address");
        Self::containing(addr)
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> VirtualAddress {
        VirtualAddress::new(self.base)
    }

    #[inline]
    #[must_use]
    pub const fn end(self) -> VirtualAddress {
        VirtualAddress::new(self.base + S::SIZE)
    }

    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        self.add(1)
    }

    #[inline]
    #[must_use]
    pub const fn add(self, n: u64) -> Self {
        Self {
            base: self.base + n * S::SIZE,
            _size: PhantomData,
        }
    }
}

impl<S: PageSize> fmt::Display for VirtualPage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}/{}", self.base, S::NAME)
    }
}

impl<S: PageSize> fmt::Debug for VirtualPage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtualPage<{}>(0x{:016X})", S::NAME, self.base)
    }
}

impl<S: PageSize> From<VirtualPage<S>> for VirtualAddress {
    #[inline]
    fn from(value: VirtualPage<S>) -> Self {
        value.base()
    }
}
