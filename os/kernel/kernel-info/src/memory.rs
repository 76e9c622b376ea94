//! # Memory Layout
//!
//! Sizes, capacities and the kernel's high-half virtual layout.
//!
//! ```text
//! VA_48_HIGH_START ┌──────────────────────────┐ 0xFFFF_8000_0000_0000
//!  (stack top guard)│ unmapped                 │
//!                   ├──────────────────────────┤ +1 page
//!                   │ kernel stack (254 pages) │
//!                   ├──────────────────────────┤
//!                   │ bottom guard, unmapped   │
//!                   ├──────────────────────────┤ +1 page
//!                   │ frame buffer window      │
//!                   ├──────────────────────────┤ HIGH + 4096 pages
//!                   │ PCIe config window       │ (1M pages, not managed here)
//!                   ├──────────────────────────┤
//!                   │ direct-access page       │
//!                   ├──────────────────────────┤ +1 page
//!                   │ heap window, grows up    │
//!                   └──────────────────────────┘
//! ```
//!
//! The exact offsets are not a contract; anything that needs them goes through a
//! [`MemoryLayout`], which boards and tests may replace.

use kernel_memory_addresses::{PageSize, Size4K, VirtualAddress};

/// Frame and small-page size.
pub const FRAME_SIZE: u64 = Size4K::SIZE;

/// Frames available before the free list exists (64 MiB).
pub const BOOTSTRAP_FRAME_CAP: usize = 16 * 1024;

/// Maximum number of usable RAM sections taken from the memory map.
pub const MEMORY_SECTION_CAP: usize = 32;

/// Upper bound for a plausible kernel image.
pub const KERNEL_IMAGE_MAX: u64 = 1024 * 1024 * 1024;

/// Number of buddy size classes; class `k` spans `2^k` pages.
pub const HEAP_CLASSES: usize = 16;

pub const VA_48_LOW_END: u64 = 0x0000_7FFF_FFFF_FFFF;
pub const VA_48_HIGH_START: u64 = 0xFFFF_8000_0000_0000;

/// Pages between the two stack guards.
pub const STACK_PAGES: u64 = 254;

pub const VA_48_STACK_TOP_GUARD: u64 = VA_48_HIGH_START;
pub const VA_48_STACK_TOP: u64 = VA_48_STACK_TOP_GUARD + FRAME_SIZE;
/// Page start of the last stack page, next to the bottom guard.
pub const VA_48_STACK_BOTTOM: u64 = VA_48_STACK_TOP + (STACK_PAGES - 1) * FRAME_SIZE;
pub const VA_48_STACK_BOTTOM_GUARD: u64 = VA_48_STACK_BOTTOM + FRAME_SIZE;
pub const VA_48_FRAME_BUFFER: u64 = VA_48_STACK_BOTTOM_GUARD + FRAME_SIZE;
pub const VA_48_PCIE_CFG_START: u64 = VA_48_HIGH_START + 4096 * FRAME_SIZE;
pub const VA_48_PCIE_CFG_END: u64 = VA_48_PCIE_CFG_START + 1024 * 1024 * FRAME_SIZE;
/// The single direct-access ("grip") page.
pub const VA_48_DIRECT_ACCESS: u64 = VA_48_PCIE_CFG_END;
pub const VA_48_HEAP: u64 = VA_48_DIRECT_ACCESS + FRAME_SIZE;

const _: () = {
    assert!(BOOTSTRAP_FRAME_CAP > 0);
    assert!(HEAP_CLASSES > 1 && HEAP_CLASSES <= 16);
    assert!(VA_48_FRAME_BUFFER < VA_48_PCIE_CFG_START);
    assert!(VA_48_HEAP > VA_48_DIRECT_ACCESS);
    assert!(MemoryLayout::DEFAULT.check().is_ok());
};

/// Reasons a [`MemoryLayout`] is rejected.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LayoutError {
    #[error("layout address {0:#x} is not page aligned")]
    Unaligned(u64),
    #[error("layout address {0:#x} is not in the higher half")]
    NotHigherHalf(u64),
    #[error("the kernel stack needs at least one page")]
    EmptyStack,
    #[error("layout windows overlap or are out of order")]
    Overlap,
}

/// Placement of the kernel's fixed high-half regions.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MemoryLayout {
    /// Unmapped guard page above the stack.
    pub stack_top_guard: VirtualAddress,
    /// Number of mapped stack pages.
    pub stack_pages: u64,
    /// Start of the frame buffer window.
    pub frame_buffer: VirtualAddress,
    /// End (exclusive) of the frame buffer window.
    pub frame_buffer_end: VirtualAddress,
    /// The direct-access page.
    pub direct_access: VirtualAddress,
    /// Base of the heap window.
    pub heap: VirtualAddress,
}

impl MemoryLayout {
    pub const DEFAULT: Self = Self {
        stack_top_guard: VirtualAddress::new(VA_48_STACK_TOP_GUARD),
        stack_pages: STACK_PAGES,
        frame_buffer: VirtualAddress::new(VA_48_FRAME_BUFFER),
        frame_buffer_end: VirtualAddress::new(VA_48_PCIE_CFG_START),
        direct_access: VirtualAddress::new(VA_48_DIRECT_ACCESS),
        heap: VirtualAddress::new(VA_48_HEAP),
    };

    /// First mapped stack page.
    #[must_use]
    pub const fn stack_top(&self) -> VirtualAddress {
        VirtualAddress::new(self.stack_top_guard.as_u64() + FRAME_SIZE)
    }

    /// Last mapped stack page (page start).
    #[must_use]
    pub const fn stack_bottom(&self) -> VirtualAddress {
        VirtualAddress::new(self.stack_top().as_u64() + (self.stack_pages - 1) * FRAME_SIZE)
    }

    #[must_use]
    pub const fn stack_bottom_guard(&self) -> VirtualAddress {
        VirtualAddress::new(self.stack_bottom().as_u64() + FRAME_SIZE)
    }

    /// Bytes available for the frame buffer mapping.
    #[must_use]
    pub const fn frame_buffer_capacity(&self) -> u64 {
        self.frame_buffer_end.as_u64() - self.frame_buffer.as_u64()
    }

    /// Checks alignment and ordering of the windows.
    ///
    /// # Errors
    /// See [`LayoutError`].
    pub const fn check(&self) -> Result<(), LayoutError> {
        let points = [
            self.stack_top_guard,
            self.frame_buffer,
            self.frame_buffer_end,
            self.direct_access,
            self.heap,
        ];
        let mut i = 0;
        while i < points.len() {
            let va = points[i];
            if !va.is_aligned::<Size4K>() {
                return Err(LayoutError::Unaligned(va.as_u64()));
            }
            if !va.is_higher_half() {
                return Err(LayoutError::NotHigherHalf(va.as_u64()));
            }
            i += 1;
        }

        if self.stack_pages == 0 {
            return Err(LayoutError::EmptyStack);
        }

        let ordered = self.stack_bottom_guard().as_u64() < self.frame_buffer.as_u64()
            && self.frame_buffer.as_u64() < self.frame_buffer_end.as_u64()
            && self.frame_buffer_end.as_u64() <= self.direct_access.as_u64()
            && self.direct_access.as_u64() < self.heap.as_u64();
        if !ordered {
            return Err(LayoutError::Overlap);
        }

        Ok(())
    }
}

impl Default for MemoryLayout {
    fn default() -> Self {
        Self::DEFAULT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_layout_matches_constants() {
        let l = MemoryLayout::DEFAULT;
        assert_eq!(l.stack_top().as_u64(), VA_48_STACK_TOP);
        assert_eq!(l.stack_bottom().as_u64(), VA_48_STACK_BOTTOM);
        assert_eq!(l.stack_bottom_guard().as_u64(), VA_48_STACK_BOTTOM_GUARD);
        assert_eq!(l.frame_buffer.as_u64(), 0xFFFF_8000_0010_0000);
        assert_eq!(l.frame_buffer_capacity(), (4096 - 256) * FRAME_SIZE);
        assert_eq!(l.direct_access.as_u64(), 0xFFFF_8001_0100_0000);
        assert_eq!(l.heap.as_u64(), 0xFFFF_8001_0100_1000);
        assert_eq!(l.check(), Ok(()));
    }

    #[test]
    fn rejects_broken_layouts() {
        let mut l = MemoryLayout::DEFAULT;
        l.heap = VirtualAddress::new(VA_48_HEAP + 1);
        assert_eq!(l.check(), Err(LayoutError::Unaligned(VA_48_HEAP + 1)));

        let mut l = MemoryLayout::DEFAULT;
        l.direct_access = VirtualAddress::new(0x1000);
        assert_eq!(l.check(), Err(LayoutError::NotHigherHalf(0x1000)));

        let mut l = MemoryLayout::DEFAULT;
        l.heap = l.direct_access;
        assert_eq!(l.check(), Err(LayoutError::Overlap));

        let mut l = MemoryLayout::DEFAULT;
        l.stack_pages = 0;
        assert_eq!(l.check(), Err(LayoutError::EmptyStack));
    }
}
