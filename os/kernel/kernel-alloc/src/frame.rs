//! # Physical Frame Allocator
//!
//! Tracks which 4 KiB frames of usable RAM are free.
//!
//! The allocator runs in two modes, strictly one after the other:
//!
//! * **Bootstrap**: frames are handed out from a fixed pool inside the kernel
//!   image by bumping an index. Nothing can be freed. This is what builds the
//!   first page tables, before any other memory is known to be mapped.
//! * **Steady state**: entered once with [`FrameAllocator::enter_steady_state`].
//!   Every managed frame sits on an intrusive singly-linked list: the first
//!   eight bytes of a free frame hold the physical address of the next one,
//!   [`NIL`] terminates the list. Following or updating a link needs the frame
//!   to be accessible, hence the [`PhysMapper`] on every steady-state call.
//!
//! A frame is **managed** when it lies inside a usable memory-map section, at
//! or above the first 2 MiB boundary past the kernel image, and outside every
//! reserved range. Low memory, the image and the rest of its 2 MiB page stay
//! with the boot identity map. Only managed frames ever enter the free list.

use kernel_info::boot::{BootInfoError, ElfSections, MemoryMap};
use kernel_info::memory::{BOOTSTRAP_FRAME_CAP, KERNEL_IMAGE_MAX, MEMORY_SECTION_CAP};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, PhysicalRange, Size2M, Size4K};
use kernel_vmem::{FrameAlloc, PhysMapper};
use log::{debug, info, trace, warn};

/// End-of-list marker stored in the last free frame.
pub const NIL: u64 = u64::MAX;

/// Ranges that can be excluded with [`FrameAllocator::reserve`].
const RESERVED_CAP: usize = 4;

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameAllocatorError {
    #[error(transparent)]
    Boot(#[from] BootInfoError),
    #[error("memory map has more than {} usable sections", MEMORY_SECTION_CAP)]
    TooManySections,
    #[error("usable section {0} overlaps or precedes the previous one")]
    Unsorted(PhysicalRange),
    #[error("memory map has no usable RAM")]
    NoUsableMemory,
    #[error("kernel image {0} is empty or not smaller than 1 GiB")]
    KernelImageSize(PhysicalRange),
    #[error("kernel image {image} does not contain the running code at {probe}")]
    ProbeOutsideImage {
        image: PhysicalRange,
        probe: PhysicalAddress,
    },
    #[error("kernel image {0} is not inside one usable section")]
    ImageOutsideRam(PhysicalRange),
    #[error("bootstrap pool {0} is not inside the kernel image")]
    PoolOutsideImage(PhysicalRange),
    #[error("bootstrap pool of {0} frames exceeds the capacity of {cap}", cap = BOOTSTRAP_FRAME_CAP)]
    PoolTooLarge(u64),
}

/// Frames reserved in the kernel image for the bootstrap mode.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BootstrapPool {
    pub base: PhysicalPage<Size4K>,
    pub frames: u64,
}

impl BootstrapPool {
    #[must_use]
    pub const fn new(base: PhysicalPage<Size4K>, frames: u64) -> Self {
        Self { base, frames }
    }

    #[must_use]
    pub const fn range(&self) -> PhysicalRange {
        PhysicalRange::with_len(self.base.base(), self.frames << 12)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Mode {
    Bootstrap,
    Steady { head: u64, free: u64 },
}

/// The physical frame allocator.
#[derive(Debug)]
pub struct FrameAllocator {
    sections: [PhysicalRange; MEMORY_SECTION_CAP],
    section_count: usize,
    total: u64,
    kernel: PhysicalRange,
    pool: BootstrapPool,
    pool_used: u64,
    reserved: [PhysicalRange; RESERVED_CAP],
    reserved_count: usize,
    mode: Mode,
}

impl FrameAllocator {
    /// Reads the usable sections and the kernel image extent and starts in
    /// bootstrap mode.
    ///
    /// `probe` is an address inside the running kernel's code; the detected
    /// image must contain it.
    ///
    /// # Errors
    /// Malformed boot payloads, unsorted or too many sections, or an
    /// implausible kernel image or pool. See [`FrameAllocatorError`].
    pub fn bootstrap(
        mmap: &[u8],
        elf: &[u8],
        pool: BootstrapPool,
        probe: PhysicalAddress,
    ) -> Result<Self, FrameAllocatorError> {
        let map = MemoryMap::parse(mmap)?;
        let mut sections = [PhysicalRange::default(); MEMORY_SECTION_CAP];
        let mut section_count = 0;
        let mut total = 0;
        for range in map.usable().filter(|r| !r.is_empty()) {
            if section_count == MEMORY_SECTION_CAP {
                return Err(FrameAllocatorError::TooManySections);
            }
            if section_count > 0 && range.start() < sections[section_count - 1].end() {
                return Err(FrameAllocatorError::Unsorted(range));
            }
            debug!("usable section {range}");
            sections[section_count] = range;
            section_count += 1;
            total += range.len();
        }
        if section_count == 0 {
            return Err(FrameAllocatorError::NoUsableMemory);
        }

        let kernel = ElfSections::parse(elf)?.kernel_image()?;
        if kernel.is_empty() || kernel.len() >= KERNEL_IMAGE_MAX {
            return Err(FrameAllocatorError::KernelImageSize(kernel));
        }
        if !kernel.contains(probe) {
            return Err(FrameAllocatorError::ProbeOutsideImage { image: kernel, probe });
        }
        if !sections[..section_count].iter().any(|s| s.contains_range(kernel)) {
            return Err(FrameAllocatorError::ImageOutsideRam(kernel));
        }

        if pool.frames > BOOTSTRAP_FRAME_CAP as u64 {
            return Err(FrameAllocatorError::PoolTooLarge(pool.frames));
        }
        if !kernel.contains_range(pool.range()) {
            return Err(FrameAllocatorError::PoolOutsideImage(pool.range()));
        }

        info!(
            "{section_count} usable sections, {} KiB; kernel image {kernel}",
            total >> 10
        );
        Ok(Self {
            sections,
            section_count,
            total,
            kernel,
            pool,
            pool_used: 0,
            reserved: [PhysicalRange::default(); RESERVED_CAP],
            reserved_count: 0,
            mode: Mode::Bootstrap,
        })
    }

    /// Keeps `range` off the free list (frame buffer, firmware tables).
    ///
    /// # Panics
    /// After [`enter_steady_state`](Self::enter_steady_state), or when the
    /// reservation table is full.
    pub fn reserve(&mut self, range: PhysicalRange) {
        assert_eq!(self.mode, Mode::Bootstrap, "reservations must precede steady state");
        assert!(self.reserved_count < RESERVED_CAP, "too many reserved ranges");
        self.reserved[self.reserved_count] = range;
        self.reserved_count += 1;
        debug!("reserved {range}");
    }

    /// Next frame of the bootstrap pool.
    ///
    /// # Panics
    /// In steady state.
    pub fn alloc_bootstrap(&mut self) -> Option<PhysicalPage<Size4K>> {
        assert_eq!(self.mode, Mode::Bootstrap, "frame allocator is in steady state");
        if self.pool_used == self.pool.frames {
            return None;
        }
        let frame = self.pool.base.add(self.pool_used);
        self.pool_used += 1;
        trace!("bootstrap frame {frame}");
        Some(frame)
    }

    /// Threads every managed frame onto the free list and switches modes.
    ///
    /// # Panics
    /// If already in steady state.
    pub fn enter_steady_state<M: PhysMapper>(&mut self, mapper: &mut M) {
        assert_eq!(self.mode, Mode::Bootstrap, "frame allocator is already in steady state");
        self.mode = Mode::Steady { head: NIL, free: 0 };
        for i in 0..self.section_count {
            for frame in self.sections[i].frames() {
                if self.is_managed(frame) {
                    self.push(mapper, frame);
                }
            }
        }
        info!(
            "frame allocator in steady state: {} free frames, {} bootstrap frames used",
            self.free_count(),
            self.pool_used
        );
    }

    #[must_use]
    pub const fn is_steady(&self) -> bool {
        matches!(self.mode, Mode::Steady { .. })
    }

    /// Allocates a frame in either mode.
    pub fn alloc<M: PhysMapper>(&mut self, mapper: &mut M) -> Option<PhysicalPage<Size4K>> {
        match self.mode {
            Mode::Bootstrap => self.alloc_bootstrap(),
            Mode::Steady { head, .. } => {
                if head == NIL {
                    return None;
                }
                let frame = PhysicalPage::from_aligned(PhysicalAddress::new(head));
                // SAFETY: a free frame holds nothing but the link.
                let next = unsafe { mapper.with_frame::<u64, _>(frame, |link| *link) };
                self.set_head(next, -1);
                trace!("frame {frame} allocated");
                Some(frame)
            }
        }
    }

    /// Pushes `pa` whose contents are reachable at `frame_va`.
    ///
    /// # Safety
    /// `frame_va` must be a writable mapping of `pa` and the frame must not be
    /// referenced anywhere else.
    ///
    /// # Panics
    /// In bootstrap mode, or if `pa` is not a managed frame.
    pub unsafe fn free(&mut self, frame_va: *mut u64, pa: PhysicalPage<Size4K>) {
        let head = self.steady_head();
        assert!(self.is_managed(pa), "frame {pa} is not managed");
        // SAFETY: guaranteed by the caller.
        unsafe { frame_va.write(head) };
        self.set_head(pa.base().as_u64(), 1);
        trace!("frame {pa} freed");
    }

    /// Like [`free`](Self::free), reaching the frame through `mapper`.
    ///
    /// # Panics
    /// In bootstrap mode, or if `pa` is not a managed frame.
    pub fn free_via<M: PhysMapper>(&mut self, mapper: &mut M, pa: PhysicalPage<Size4K>) {
        assert!(self.is_managed(pa), "frame {pa} is not managed");
        self.push(mapper, pa);
        trace!("frame {pa} freed");
    }

    /// Inside a usable section, not below [`managed_floor`](Self::managed_floor)
    /// and outside every reserved range.
    #[must_use]
    pub fn is_managed(&self, frame: PhysicalPage<Size4K>) -> bool {
        let range = PhysicalRange::new(frame.base(), frame.end());
        frame.base() >= self.managed_floor()
            && self.sections().iter().any(|s| s.contains_range(range))
            && !self.reserved[..self.reserved_count]
                .iter()
                .any(|r| r.overlaps(range))
    }

    /// First 2 MiB boundary at or past the end of the kernel image.
    #[must_use]
    pub const fn managed_floor(&self) -> PhysicalAddress {
        self.kernel.end().align_up::<Size2M>()
    }

    /// Lowest usable physical address.
    #[must_use]
    pub const fn pa_start(&self) -> PhysicalAddress {
        self.sections[0].start()
    }

    /// End (exclusive) of the highest usable section.
    #[must_use]
    pub const fn pa_end(&self) -> PhysicalAddress {
        self.sections[self.section_count - 1].end()
    }

    /// `true` if one usable section holds all of `[start, end)`.
    #[must_use]
    pub fn pa_range_valid(&self, start: PhysicalAddress, end: PhysicalAddress) -> bool {
        start <= end
            && self
                .sections()
                .iter()
                .any(|s| s.start() <= start && end <= s.end())
    }

    /// Frames still available in the current mode.
    #[must_use]
    pub const fn free_count(&self) -> u64 {
        match self.mode {
            Mode::Bootstrap => self.pool.frames - self.pool_used,
            Mode::Steady { free, .. } => free,
        }
    }

    /// Bytes of usable RAM reported by the memory map.
    #[must_use]
    pub const fn total_usable(&self) -> u64 {
        self.total
    }

    #[must_use]
    pub const fn kernel_image(&self) -> PhysicalRange {
        self.kernel
    }

    #[must_use]
    pub fn sections(&self) -> &[PhysicalRange] {
        &self.sections[..self.section_count]
    }

    /// Frames handed out from the bootstrap pool.
    #[must_use]
    pub const fn bootstrap_used(&self) -> u64 {
        self.pool_used
    }

    fn steady_head(&self) -> u64 {
        match self.mode {
            Mode::Steady { head, .. } => head,
            Mode::Bootstrap => panic!("frames cannot be freed in bootstrap mode"),
        }
    }

    fn set_head(&mut self, new_head: u64, delta: i64) {
        if let Mode::Steady { head, free } = &mut self.mode {
            *head = new_head;
            *free = free.saturating_add_signed(delta);
        }
    }

    fn push<M: PhysMapper>(&mut self, mapper: &mut M, frame: PhysicalPage<Size4K>) {
        let head = self.steady_head();
        // SAFETY: the frame is free; only the link is written.
        unsafe { mapper.with_frame::<u64, _>(frame, |link| *link = head) };
        self.set_head(frame.base().as_u64(), 1);
    }
}

impl FrameAlloc for FrameAllocator {
    fn alloc_4k<M: PhysMapper>(&mut self, mapper: &mut M) -> Option<PhysicalPage<Size4K>> {
        self.alloc(mapper)
    }

    /// Unmanaged frames (MMIO, low memory, the kernel image, reserved
    /// ranges) are dropped.
    fn release_4k<M: PhysMapper>(&mut self, mapper: &mut M, frame: PhysicalPage<Size4K>) {
        if !self.is_managed(frame) {
            trace!("ignoring release of unmanaged frame {frame}");
            return;
        }
        if !self.is_steady() {
            warn!("frame {frame} released in bootstrap mode, dropped");
            return;
        }
        self.push(mapper, frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_info::boot::payload::{elf_symbols, memory_map};
    use kernel_vmem::IdentityMapper;
    use std::alloc::{Layout, alloc_zeroed, dealloc};

    /// Frames of test RAM: one 2 MiB page holding the kernel image, then 64
    /// frames above it.
    const FRAMES: u64 = 512 + 64;

    /// First frame above the 2 MiB page of the kernel image.
    const FLOOR: u64 = 512;

    /// 2 MiB-aligned host memory standing in for physical RAM.
    struct Ram {
        ptr: *mut u8,
        layout: Layout,
    }

    impl Ram {
        fn new() -> Self {
            let layout = Layout::from_size_align(FRAMES as usize * 4096, 2 << 20).unwrap();
            let ptr = unsafe { alloc_zeroed(layout) };
            assert!(!ptr.is_null());
            Self { ptr, layout }
        }

        fn base(&self) -> u64 {
            PhysicalAddress::from_ptr(self.ptr).as_u64()
        }

        fn frame(&self, i: u64) -> PhysicalPage<Size4K> {
            PhysicalPage::from_aligned(PhysicalAddress::new(self.base() + i * 4096))
        }
    }

    impl Drop for Ram {
        fn drop(&mut self) {
            unsafe { dealloc(self.ptr, self.layout) };
        }
    }

    /// Frames 0..8 are the kernel image, the first four of them the
    /// bootstrap pool.
    fn allocator(ram: &Ram) -> FrameAllocator {
        let base = ram.base();
        FrameAllocator::bootstrap(
            &memory_map(&[(base, FRAMES * 4096, 1)]),
            &elf_symbols(&[(0, 0, 0), (1, base, 0x6000), (1, base + 0x6000, 0x2000)]),
            BootstrapPool::new(ram.frame(0), 4),
            PhysicalAddress::new(base + 0x10),
        )
        .unwrap()
    }

    #[test]
    fn bootstrap_records_sections_and_image() {
        let ram = Ram::new();
        let fa = allocator(&ram);
        assert_eq!(fa.sections().len(), 1);
        assert_eq!(fa.total_usable(), FRAMES * 4096);
        assert_eq!(fa.kernel_image().len(), 0x8000);
        assert_eq!(fa.managed_floor(), ram.frame(FLOOR).base());
        assert_eq!(fa.pa_start().as_u64(), ram.base());
        assert_eq!(fa.pa_end().as_u64(), ram.base() + FRAMES * 4096);
        assert_eq!(fa.free_count(), 4);
    }

    #[test]
    fn bootstrap_pool_is_bumped_then_exhausted() {
        let ram = Ram::new();
        let mut fa = allocator(&ram);
        for i in 0..4 {
            assert_eq!(fa.alloc(&mut IdentityMapper), Some(ram.frame(i)));
        }
        assert_eq!(fa.alloc(&mut IdentityMapper), None);
        assert_eq!(fa.bootstrap_used(), 4);
    }

    #[test]
    fn steady_state_lists_only_managed_frames() {
        let ram = Ram::new();
        let mut fa = allocator(&ram);
        fa.reserve(PhysicalRange::with_len(ram.frame(FLOOR + 60).base(), 2 * 4096));
        fa.enter_steady_state(&mut IdentityMapper);

        // The 64 frames above the image's 2 MiB page, minus 2 reserved.
        assert_eq!(fa.free_count(), 62);
        let mut seen = Vec::new();
        while let Some(f) = fa.alloc(&mut IdentityMapper) {
            assert!(fa.is_managed(f));
            seen.push(f);
        }
        assert_eq!(seen.len(), 62);
        assert!(!seen.contains(&ram.frame(FLOOR + 60)));
        assert!(seen.contains(&ram.frame(FLOOR)));
        assert_eq!(fa.free_count(), 0);
    }

    #[test]
    fn frames_below_the_image_page_boundary_are_unmanaged() {
        let ram = Ram::new();
        let mut fa = allocator(&ram);
        fa.enter_steady_state(&mut IdentityMapper);

        assert!(!fa.is_managed(ram.frame(0)));
        assert!(!fa.is_managed(ram.frame(3)));
        // Past the image but inside its 2 MiB page.
        assert!(!fa.is_managed(ram.frame(8)));
        assert!(!fa.is_managed(ram.frame(FLOOR - 1)));
        assert!(fa.is_managed(ram.frame(FLOOR)));
        assert!(fa.is_managed(ram.frame(FRAMES - 1)));
    }

    #[test]
    fn alloc_free_conserves_free_count() {
        let ram = Ram::new();
        let mut fa = allocator(&ram);
        fa.enter_steady_state(&mut IdentityMapper);
        let before = fa.free_count();

        let frames: Vec<_> = (0..10).map(|_| fa.alloc(&mut IdentityMapper).unwrap()).collect();
        assert_eq!(fa.free_count(), before - 10);
        for (i, f) in frames.iter().enumerate() {
            if i % 2 == 0 {
                fa.free_via(&mut IdentityMapper, *f);
            } else {
                unsafe { fa.free(f.as_identity_ptr(), *f) };
            }
        }
        assert_eq!(fa.free_count(), before);

        // LIFO: the last freed frame comes back first.
        assert_eq!(fa.alloc(&mut IdentityMapper), Some(frames[9]));
    }

    #[test]
    fn release_ignores_unmanaged_frames() {
        let ram = Ram::new();
        let mut fa = allocator(&ram);
        fa.enter_steady_state(&mut IdentityMapper);
        let before = fa.free_count();
        fa.release_4k(&mut IdentityMapper, ram.frame(2));
        fa.release_4k(&mut IdentityMapper, ram.frame(100));
        fa.release_4k(
            &mut IdentityMapper,
            PhysicalPage::from_aligned(PhysicalAddress::new(0xfd00_0000)),
        );
        assert_eq!(fa.free_count(), before);
    }

    #[test]
    fn range_validity_is_half_open() {
        let ram = Ram::new();
        let fa = allocator(&ram);
        let b = ram.base();
        let end = b + FRAMES * 4096;
        assert!(fa.pa_range_valid(PhysicalAddress::new(b), PhysicalAddress::new(end)));
        assert!(fa.pa_range_valid(PhysicalAddress::new(b + 0x1000), PhysicalAddress::new(b + 0x3000)));
        assert!(!fa.pa_range_valid(PhysicalAddress::new(b), PhysicalAddress::new(end + 1)));
        assert!(!fa.pa_range_valid(PhysicalAddress::new(b - 1), PhysicalAddress::new(b + 1)));
    }

    #[test]
    fn bootstrap_validation_errors() {
        let ram = Ram::new();
        let b = ram.base();
        let pool = BootstrapPool::new(ram.frame(0), 4);
        let probe = PhysicalAddress::new(b + 0x10);
        let image = elf_symbols(&[(1, b, 0x8000)]);
        let ram_map = memory_map(&[(b, FRAMES * 4096, 1)]);

        let unsorted = memory_map(&[(b + 0x10000, 0x1000, 1), (b, 0x1000, 1)]);
        assert!(matches!(
            FrameAllocator::bootstrap(&unsorted, &image, pool, probe),
            Err(FrameAllocatorError::Unsorted(_))
        ));

        let reserved_only = memory_map(&[(b, FRAMES * 4096, 2)]);
        assert_eq!(
            FrameAllocator::bootstrap(&reserved_only, &image, pool, probe).err(),
            Some(FrameAllocatorError::NoUsableMemory)
        );

        let too_many: Vec<_> = (0..33).map(|i| (b + i * 0x2000, 0x1000, 1)).collect();
        assert_eq!(
            FrameAllocator::bootstrap(&memory_map(&too_many), &image, pool, probe).err(),
            Some(FrameAllocatorError::TooManySections)
        );

        let huge = elf_symbols(&[(1, b, KERNEL_IMAGE_MAX)]);
        assert!(matches!(
            FrameAllocator::bootstrap(&ram_map, &huge, pool, probe),
            Err(FrameAllocatorError::KernelImageSize(_))
        ));

        assert!(matches!(
            FrameAllocator::bootstrap(&ram_map, &image, pool, PhysicalAddress::new(b + 0x9000)),
            Err(FrameAllocatorError::ProbeOutsideImage { .. })
        ));

        let last = b + (FRAMES - 2) * 4096;
        let outside = elf_symbols(&[(1, last, 0x4000)]);
        assert!(matches!(
            FrameAllocator::bootstrap(&ram_map, &outside, pool, PhysicalAddress::new(last)),
            Err(FrameAllocatorError::ImageOutsideRam(_))
        ));

        let far_pool = BootstrapPool::new(ram.frame(20), 4);
        assert!(matches!(
            FrameAllocator::bootstrap(&ram_map, &image, far_pool, probe),
            Err(FrameAllocatorError::PoolOutsideImage(_))
        ));

        let oversized_pool = BootstrapPool::new(ram.frame(0), BOOTSTRAP_FRAME_CAP as u64 + 1);
        assert_eq!(
            FrameAllocator::bootstrap(&ram_map, &image, oversized_pool, probe).err(),
            Some(FrameAllocatorError::PoolTooLarge(BOOTSTRAP_FRAME_CAP as u64 + 1))
        );
        assert_eq!(
            FrameAllocatorError::PoolTooLarge(300).to_string(),
            format!("bootstrap pool of 300 frames exceeds the capacity of {BOOTSTRAP_FRAME_CAP}")
        );

        let mut bad_header = ram_map.clone();
        bad_header[0] = 20;
        assert_eq!(
            FrameAllocator::bootstrap(&bad_header, &image, pool, probe).err(),
            Some(FrameAllocatorError::Boot(BootInfoError::EntrySize(20)))
        );
    }

    #[test]
    #[should_panic(expected = "frames cannot be freed in bootstrap mode")]
    fn free_in_bootstrap_mode_panics() {
        let ram = Ram::new();
        let mut fa = allocator(&ram);
        fa.free_via(&mut IdentityMapper, ram.frame(20));
    }

    #[test]
    #[should_panic(expected = "already in steady state")]
    fn steady_state_is_entered_once() {
        let ram = Ram::new();
        let mut fa = allocator(&ram);
        fa.enter_steady_state(&mut IdentityMapper);
        fa.enter_steady_state(&mut IdentityMapper);
    }
}
