//! # Buddy Heap
//!
//! A binary-buddy allocator over a virtual window that grows on demand.
//!
//! The window is carved into **units** of `2^(N-1)` pages, committed one at a
//! time at the high-water mark through a [`HeapBacking`]. Inside a unit,
//! blocks of class `k` span `2^k` pages and sit at an offset that is a multiple
//! of their size:
//!
//! ```text
//! unit (class N-1)
//! ┌───────────────────────────────┬───────────────────────────────┐
//! │ class N-2                     │ class N-2                     │
//! ├───────────────┬───────────────┼───────────────────────────────┤
//! │ class N-3     │ class N-3     │                               │
//! └───────────────┴───────────────┴───────────────────────────────┘
//!  ▲ header | payload ...
//! ```
//!
//! Every block starts with a [`Header`]-sized record. The buddy of a class-`k`
//! block is at `offset XOR 2^k pages`. Frees coalesce eagerly up to, but not
//! into, the unit level; the heap never shrinks.
//!
//! Callers get window addresses. The heap itself touches block memory only
//! through [`HeapBacking::resolve`], so the window need not be mapped in the
//! address space the heap code runs in; free lists link window offsets.

use core::mem::size_of;
use core::ptr::NonNull;
use kernel_memory_addresses::{VirtualAddress, log2_up};
use kernel_vmem::MapError;
use log::{debug, trace};

use kernel_info::memory::{FRAME_SIZE, HEAP_CLASSES};

/// Sentinel stored in every live block header.
pub const MAGIC: u32 = 0xBABE_FACE;

/// Bytes of every block taken by its header.
pub const HEADER: usize = size_of::<Header>();

const PAGE: usize = FRAME_SIZE as usize;

/// Terminates a free list.
const END: usize = usize::MAX;

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HeapError {
    #[error("heap backing is out of physical memory")]
    OutOfMemory,
    #[error("heap window is exhausted")]
    WindowFull,
    #[error(transparent)]
    Map(#[from] MapError),
}

/// Commits virtual memory for the heap and gives access to it.
pub trait HeapBacking {
    /// Makes `pages` pages starting at `va` readable and writable.
    ///
    /// # Errors
    /// When no memory can be provided.
    fn commit(&mut self, va: VirtualAddress, pages: u64) -> Result<(), HeapError>;

    /// A pointer through which the committed byte at `va` can be accessed
    /// from the running code.
    fn resolve(&self, va: VirtualAddress) -> *mut u8;
}

#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct Header {
    class: u8,
    is_free: bool,
    /// Window offset of the next free block of the same class, or [`END`].
    next_free: usize,
    magic: u32,
}

/// Counts gathered by [`BuddyHeap::validate`].
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct HeapStats {
    pub blocks: usize,
    pub free_blocks: usize,
    pub free_bytes: usize,
}

/// Buddy heap with `N` size classes.
pub struct BuddyHeap<const N: usize = HEAP_CLASSES> {
    base: VirtualAddress,
    max_units: u64,
    units: u64,
    expansions: usize,
    free: [usize; N],
}

#[allow(clippy::cast_possible_truncation)]
impl<const N: usize> BuddyHeap<N> {
    /// Pages per unit.
    pub const UNIT_PAGES: u64 = 1 << (N - 1);

    const UNIT: usize = PAGE << (N - 1);

    const CLASSES_FIT: () = assert!(N >= 2 && N <= 16, "between 2 and 16 classes");

    /// An empty heap over the window at `base` with room for `max_units` units.
    ///
    /// # Panics
    /// If `base` is null or not page aligned.
    #[must_use]
    pub const fn new(base: VirtualAddress, max_units: u64) -> Self {
        let () = Self::CLASSES_FIT;
        assert!(base.as_u64() != 0, "heap window at null");
        assert!(base.as_u64().is_multiple_of(FRAME_SIZE), "heap window must be page aligned");
        Self {
            base,
            max_units,
            units: 0,
            expansions: 0,
            free: [END; N],
        }
    }

    /// Bytes covered by a block of `class`.
    #[must_use]
    pub const fn class_size(class: usize) -> usize {
        PAGE << class
    }

    /// Largest request the heap accepts.
    #[must_use]
    pub const fn max_payload() -> usize {
        Self::UNIT - HEADER
    }

    #[must_use]
    pub const fn window_base(&self) -> VirtualAddress {
        self.base
    }

    /// End of committed memory.
    #[must_use]
    pub const fn high_water(&self) -> VirtualAddress {
        VirtualAddress::new(self.base.as_u64() + self.units * Self::UNIT as u64)
    }

    /// Number of units committed so far.
    #[must_use]
    pub const fn expansions(&self) -> usize {
        self.expansions
    }

    /// Length of the free list of `class`.
    #[must_use]
    pub fn free_blocks<B: HeapBacking>(&self, class: usize, backing: &B) -> usize {
        let mut n = 0;
        let mut cur = self.free[class];
        while cur != END {
            n += 1;
            cur = self.read(&*backing, cur).next_free;
        }
        n
    }

    /// Allocates at least `len` bytes.
    ///
    /// Returns the payload's window address and the usable length, which is
    /// the class size minus the header and never less than `len`.
    ///
    /// # Errors
    /// When the heap must grow and the window or the backing is exhausted.
    ///
    /// # Panics
    /// If `len` is zero or does not fit into a unit together with the header.
    pub fn alloc<B: HeapBacking>(
        &mut self,
        len: usize,
        backing: &mut B,
    ) -> Result<(NonNull<u8>, usize), HeapError> {
        assert!(len > 0, "zero-length heap allocation");
        assert!(
            len <= Self::max_payload(),
            "heap allocation of {len} bytes exceeds the largest class"
        );

        let class = Self::class_for(len);
        let offset = self.take(class, backing)?;
        let mut h = self.read(&*backing, offset);
        h.is_free = false;
        h.next_free = END;
        self.write(&*backing, offset, h);

        let payload = self.va_at(offset + HEADER);
        trace!("heap alloc {len} bytes, class {class} at {payload}");
        Ok((window_ptr(payload), Self::class_size(class) - HEADER))
    }

    /// Allocates one class-0 block.
    ///
    /// # Errors
    /// As [`alloc`](Self::alloc).
    pub fn alloc_minimum<B: HeapBacking>(
        &mut self,
        backing: &mut B,
    ) -> Result<(NonNull<u8>, usize), HeapError> {
        self.alloc(Self::class_size(0) - HEADER, backing)
    }

    /// Returns a block and merges it with free buddies.
    ///
    /// # Safety
    /// `ptr` must come from [`alloc`](Self::alloc) on this heap and must not be
    /// used afterwards.
    ///
    /// # Panics
    /// On a bad magic, a double free, or a pointer outside the window.
    pub unsafe fn free<B: HeapBacking>(&mut self, ptr: NonNull<u8>, backing: &B) {
        let addr = VirtualAddress::from_nonnull(ptr);
        assert!(
            addr.as_u64() >= self.base.as_u64() + HEADER as u64 && addr < self.high_water(),
            "{addr} is not a heap pointer"
        );
        let mut offset = (addr.as_u64() - self.base.as_u64()) as usize - HEADER;
        let h = self.read(&*backing, offset);
        assert_eq!(h.magic, MAGIC, "heap block at {addr} has a bad magic");
        assert!(!h.is_free, "double free of heap block at {addr}");
        let mut class = usize::from(h.class);

        while class < N - 1 {
            let buddy = offset ^ Self::class_size(class);
            // The buddy lies in the same committed unit and always starts
            // with a header (whole block or the first of its parts).
            let b = self.read(&*backing, buddy);
            if b.magic != MAGIC || !b.is_free || usize::from(b.class) != class {
                break;
            }
            self.unlink(&*backing, class, buddy);

            // SAFETY: the upper header is dead after the merge.
            unsafe { backing.resolve(self.va_at(offset.max(buddy))).write_bytes(0, HEADER) };
            offset = offset.min(buddy);
            class += 1;
            trace!("heap coalesced into class {class} at {}", self.va_at(offset));
        }

        self.push(&*backing, class, offset);
    }

    /// Walks every block from the window base to the high-water mark and
    /// checks headers, the buddy law and free-list consistency.
    ///
    /// # Panics
    /// On any violation.
    #[must_use]
    pub fn validate<B: HeapBacking>(&self, backing: &B) -> HeapStats {
        let mut stats = HeapStats::default();
        let end = self.units as usize * Self::UNIT;
        let mut offset = 0;
        while offset < end {
            let h = self.read(&*backing, offset);
            assert_eq!(h.magic, MAGIC, "bad magic at heap offset {offset:#x}");
            let class = usize::from(h.class);
            assert!(class < N, "class {class} out of range at heap offset {offset:#x}");
            assert!(
                offset.is_multiple_of(Self::class_size(class)),
                "heap offset {offset:#x} breaks the buddy law for class {class}"
            );
            stats.blocks += 1;
            if h.is_free {
                stats.free_blocks += 1;
                stats.free_bytes += Self::class_size(class) - HEADER;
            }
            offset += Self::class_size(class);
        }

        let mut listed = 0;
        for class in 0..N {
            let mut cur = self.free[class];
            while cur != END {
                let h = self.read(&*backing, cur);
                assert!(
                    h.is_free && usize::from(h.class) == class,
                    "free list {class} holds a foreign block at heap offset {cur:#x}"
                );
                listed += 1;
                cur = h.next_free;
            }
        }
        assert_eq!(listed, stats.free_blocks, "free lists disagree with the block walk");
        stats
    }

    /// Smallest class whose blocks hold `len` payload bytes.
    const fn class_for(len: usize) -> usize {
        let pages = (len + HEADER).div_ceil(PAGE);
        log2_up(pages as u64) as usize
    }

    /// Offset of a free, unlinked block of exactly `class`, splitting or
    /// expanding as needed.
    fn take<B: HeapBacking>(&mut self, class: usize, backing: &mut B) -> Result<usize, HeapError> {
        let mut k = match (class..N).find(|&k| self.free[k] != END) {
            Some(k) => k,
            None => {
                self.expand(backing)?;
                N - 1
            }
        };
        let Some(offset) = self.pop(&*backing, k) else {
            unreachable!("class {k} was checked to be non-empty");
        };

        while k > class {
            k -= 1;
            self.push(&*backing, k, offset + Self::class_size(k));
            self.init(&*backing, offset, k);
        }
        Ok(offset)
    }

    fn expand<B: HeapBacking>(&mut self, backing: &mut B) -> Result<(), HeapError> {
        if self.units == self.max_units {
            return Err(HeapError::WindowFull);
        }
        let va = self.high_water();
        backing.commit(va, Self::UNIT_PAGES)?;
        let unit = self.units as usize * Self::UNIT;
        self.units += 1;
        self.expansions += 1;
        self.push(&*backing, N - 1, unit);
        debug!("heap expanded by {} pages at {va}", Self::UNIT_PAGES);
        Ok(())
    }

    const fn va_at(&self, offset: usize) -> VirtualAddress {
        VirtualAddress::new(self.base.as_u64() + offset as u64)
    }

    #[allow(clippy::cast_ptr_alignment)]
    fn read<B: HeapBacking>(&self, backing: &B, offset: usize) -> Header {
        // SAFETY: `offset` is a block start inside committed memory; headers
        // are plain data.
        unsafe { backing.resolve(self.va_at(offset)).cast::<Header>().read_unaligned() }
    }

    #[allow(clippy::cast_ptr_alignment)]
    fn write<B: HeapBacking>(&self, backing: &B, offset: usize, header: Header) {
        // SAFETY: as in `read`.
        unsafe { backing.resolve(self.va_at(offset)).cast::<Header>().write_unaligned(header) };
    }

    /// Writes a free, unlinked header of `class` at `offset`.
    fn init<B: HeapBacking>(&self, backing: &B, offset: usize, class: usize) {
        debug_assert!(offset.is_multiple_of(Self::class_size(class)));
        let header = Header {
            class: class as u8,
            is_free: true,
            next_free: END,
            magic: MAGIC,
        };
        self.write(&*backing, offset, header);
    }

    fn push<B: HeapBacking>(&mut self, backing: &B, class: usize, offset: usize) {
        debug_assert!(offset.is_multiple_of(Self::class_size(class)));
        let header = Header {
            class: class as u8,
            is_free: true,
            next_free: self.free[class],
            magic: MAGIC,
        };
        self.write(&*backing, offset, header);
        self.free[class] = offset;
    }

    fn pop<B: HeapBacking>(&mut self, backing: &B, class: usize) -> Option<usize> {
        let offset = self.free[class];
        if offset == END {
            return None;
        }
        let mut h = self.read(&*backing, offset);
        self.free[class] = h.next_free;
        h.next_free = END;
        self.write(&*backing, offset, h);
        Some(offset)
    }

    fn unlink<B: HeapBacking>(&mut self, backing: &B, class: usize, target: usize) {
        let next = self.read(&*backing, target).next_free;
        if self.free[class] == target {
            self.free[class] = next;
            return;
        }
        let mut cur = self.free[class];
        while cur != END {
            let mut h = self.read(&*backing, cur);
            if h.next_free == target {
                h.next_free = next;
                self.write(&*backing, cur, h);
                return;
            }
            cur = h.next_free;
        }
        panic!("free block at heap offset {target:#x} missing from free list {class}");
    }
}

/// A non-null pointer carrying the window address `va`.
///
/// The pointer is handed out as an address; access goes through
/// [`HeapBacking::resolve`].
pub(crate) const fn window_ptr<T>(va: VirtualAddress) -> NonNull<T> {
    assert!(va.as_u64() != 0, "window address is null");
    // SAFETY: checked above.
    unsafe { NonNull::new_unchecked(va.as_mut_ptr::<T>()) }
}
