//! # Arena Allocator
//!
//! Groups many small, differently aligned allocations and releases them all at
//! once. Each [`MmAllocator`] owns a most-recent-first list of **areas**, each
//! one a whole heap block:
//!
//! ```text
//! heap payload
//! ┌──────────┬─────────────────────────────────────────┬───────┐
//! │ Area     │ bump region: used ──► | free tail        │ guard │
//! └──────────┴─────────────────────────────────────────┴───────┘
//!                                                        └ owning allocator
//! ```
//!
//! Allocations bump a cursor inside the newest area; nothing is freed on its
//! own. Allocator records are recycled through a free list that is seeded by
//! carving one minimal heap block into record-sized slots.
//!
//! Like the heap, the arena links and hands out window addresses and reads
//! or writes its records only through [`HeapBacking::resolve`].

use core::mem::size_of;
use core::ptr::NonNull;
use kernel_memory_addresses::VirtualAddress;
use log::{debug, trace};

use crate::heap::{BuddyHeap, HeapBacking, HeapError, window_ptr};

/// Bytes at the end of every area naming its allocator.
const GUARD: usize = size_of::<usize>();

#[derive(Copy, Clone)]
struct RawAllocator {
    areas: Option<NonNull<Area>>,
    next_free: Option<NonNull<RawAllocator>>,
}

#[repr(C)]
#[derive(Copy, Clone)]
struct Area {
    block: NonNull<u8>,
    block_len: usize,
    use_len: usize,
    prev_area: Option<NonNull<Area>>,
}

impl Area {
    /// The word right after the bump region.
    fn guard(&self) -> NonNull<usize> {
        window_ptr(VirtualAddress::from_nonnull(self.block) + self.block_len as u64)
    }
}

/// Reads the record at window address `at`.
fn load<T: Copy, B: HeapBacking>(backing: &B, at: NonNull<T>) -> T {
    // SAFETY: arena records live in committed heap payloads.
    unsafe { backing.resolve(VirtualAddress::from_nonnull(at)).cast::<T>().read_unaligned() }
}

fn store<T, B: HeapBacking>(backing: &B, at: NonNull<T>, value: T) {
    // SAFETY: as in `load`.
    unsafe { backing.resolve(VirtualAddress::from_nonnull(at)).cast::<T>().write_unaligned(value) };
}

/// Handle to one arena allocator.
///
/// Handed out by [`ArenaPool::new_allocator`] and consumed by
/// [`ArenaPool::free_allocator`].
#[derive(Debug, PartialEq, Eq)]
pub struct MmAllocator(NonNull<RawAllocator>);

impl MmAllocator {
    fn identity(&self) -> usize {
        self.0.as_ptr().addr()
    }
}

/// Recycled allocator records.
#[derive(Debug, Default)]
pub struct ArenaPool {
    free: Option<NonNull<RawAllocator>>,
    recycled: usize,
}

impl ArenaPool {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            free: None,
            recycled: 0,
        }
    }

    /// Number of allocator records ready for reuse.
    #[must_use]
    pub const fn recycled(&self) -> usize {
        self.recycled
    }

    /// A fresh allocator with no areas.
    ///
    /// # Errors
    /// When the record pool is empty and the heap cannot provide a block to
    /// refill it.
    pub fn new_allocator<const N: usize, B: HeapBacking>(
        &mut self,
        heap: &mut BuddyHeap<N>,
        backing: &mut B,
    ) -> Result<MmAllocator, HeapError> {
        if self.free.is_none() {
            self.seed(heap, backing)?;
        }
        let Some(raw) = self.free else {
            unreachable!("allocator pool was just seeded");
        };
        let mut r = load(&*backing, raw);
        self.free = r.next_free.take();
        r.areas = None;
        store(&*backing, raw, r);
        self.recycled -= 1;
        Ok(MmAllocator(raw))
    }

    /// Bump-allocates `size` bytes aligned to `align` from `allocator`.
    ///
    /// A new area of at least `size + align` bytes is drawn from the heap when
    /// the newest area's tail is too short.
    ///
    /// # Errors
    /// When the heap cannot provide a new area.
    ///
    /// # Panics
    /// If `size` is zero, `align` is not a power of two, or the request does
    /// not fit into a single heap block.
    pub fn allocate<const N: usize, B: HeapBacking>(
        &mut self,
        heap: &mut BuddyHeap<N>,
        backing: &mut B,
        allocator: &mut MmAllocator,
        size: usize,
        align: usize,
    ) -> Result<NonNull<u8>, HeapError> {
        assert!(size > 0, "zero-sized arena allocation");
        assert!(align.is_power_of_two(), "arena alignment {align} is not a power of two");

        let mut raw = load(&*backing, allocator.0);
        if let Some(ptr) = raw.areas.and_then(|a| Self::bump(&*backing, a, size, align)) {
            return Ok(ptr);
        }

        let need = size + align + size_of::<Area>() + GUARD;
        let (payload, all_len) = heap.alloc(need, backing)?;
        let area = payload.cast::<Area>();
        let record = Area {
            block: window_ptr(VirtualAddress::from_nonnull(payload) + size_of::<Area>() as u64),
            block_len: all_len - size_of::<Area>() - GUARD,
            use_len: 0,
            prev_area: raw.areas,
        };
        store(&*backing, area, record);
        store(&*backing, record.guard(), allocator.identity());
        raw.areas = Some(area);
        store(&*backing, allocator.0, raw);
        trace!("arena {:p}: new area of {all_len} bytes for {size}", allocator.0);

        let Some(ptr) = Self::bump(&*backing, area, size, align) else {
            unreachable!("a fresh area holds size + align bytes");
        };
        Ok(ptr)
    }

    /// Returns every area of `allocator` to the heap and recycles its record.
    ///
    /// # Safety
    /// `heap` must be the heap the allocator drew its areas from and `backing`
    /// its backing. No pointer obtained through the allocator may be used
    /// afterwards.
    ///
    /// # Panics
    /// If an area's guard does not name `allocator`.
    pub unsafe fn free_allocator<const N: usize, B: HeapBacking>(
        &mut self,
        heap: &mut BuddyHeap<N>,
        backing: &B,
        allocator: MmAllocator,
    ) {
        let id = allocator.identity();
        let raw = allocator.0;
        let mut r = load(backing, raw);
        let mut freed = 0usize;
        while let Some(area) = r.areas {
            let a = load(backing, area);
            let guard = load(backing, a.guard());
            assert_eq!(guard, id, "arena area {area:p} does not belong to allocator {raw:p}");
            r.areas = a.prev_area;
            // SAFETY: the area is the payload returned by `heap.alloc`.
            unsafe { heap.free(area.cast(), backing) };
            freed += 1;
        }
        r.next_free = self.free;
        store(backing, raw, r);
        self.free = Some(raw);
        self.recycled += 1;
        trace!("arena {raw:p}: released {freed} areas");
    }

    /// Number of areas `allocator` currently owns.
    #[must_use]
    pub fn area_count<B: HeapBacking>(backing: &B, allocator: &MmAllocator) -> usize {
        let mut n = 0;
        let mut cur = load(backing, allocator.0).areas;
        while let Some(a) = cur {
            n += 1;
            cur = load(backing, a).prev_area;
        }
        n
    }

    fn bump<B: HeapBacking>(
        backing: &B,
        area: NonNull<Area>,
        size: usize,
        align: usize,
    ) -> Option<NonNull<u8>> {
        let mut a = load(backing, area);
        let base = a.block.as_ptr().addr();
        let start = (base + a.use_len).next_multiple_of(align);
        let end = start.checked_add(size)?;
        if end > base + a.block_len {
            return None;
        }
        a.use_len = end - base;
        store(backing, area, a);
        Some(window_ptr(VirtualAddress::new(start as u64)))
    }

    fn seed<const N: usize, B: HeapBacking>(
        &mut self,
        heap: &mut BuddyHeap<N>,
        backing: &mut B,
    ) -> Result<(), HeapError> {
        let (block, len) = heap.alloc_minimum(backing)?;
        let slots = len / size_of::<RawAllocator>();
        let first = VirtualAddress::from_nonnull(block);
        for i in (0..slots).rev() {
            let slot = window_ptr(first + (i * size_of::<RawAllocator>()) as u64);
            let record = RawAllocator {
                areas: None,
                next_free: self.free,
            };
            store(&*backing, slot, record);
            self.free = Some(slot);
        }
        self.recycled += slots;
        debug!("arena pool seeded with {slots} allocator records");
        Ok(())
    }
}
