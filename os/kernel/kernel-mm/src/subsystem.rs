use core::ops::Range;
use core::ptr::NonNull;
use kernel_alloc::{ArenaPool, BuddyHeap, FrameAllocator, HeapBacking, HeapError, HeapStats, MmAllocator};
use kernel_info::boot::FramebufferInfo;
use kernel_info::memory::{FRAME_SIZE, HEAP_CLASSES, MemoryLayout};
use kernel_memory_addresses::{
    PageSize, PhysicalAddress, PhysicalPage, PhysicalRange, Size1G, Size2M, Size4K, VirtualAddress, VirtualPage,
};
use kernel_vmem::{
    AddressSpace, DirectAccess, DirectAccessGuard, DirectAccessSlot, FrameAlloc, IdentityMapper,
    Mmu, PaRange, PhysMapper,
};
use log::{debug, info, trace, warn};

use crate::{BootHandoff, MemoryError, Stage};

/// Virtual span of one root table entry.
const ROOT_ENTRY_SPAN: u64 = 512 * Size1G::SIZE;

/// The relocated frame buffer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FrameBuffer {
    /// Address of the first pixel.
    pub va: VirtualAddress,
    pub info: FramebufferInfo,
}

struct KernelSpace {
    space: AddressSpace,
    slot: DirectAccessSlot,
}

/// Everything a steady-state page table edit needs, borrowed at once.
struct SteadyParts<'a, U: Mmu> {
    frames: &'a mut FrameAllocator,
    space: &'a mut AddressSpace,
    da: DirectAccess<'a, U>,
}

impl<U: Mmu> SteadyParts<'_, U> {
    fn unmap(&mut self, page: VirtualPage<Size4K>) -> Result<PhysicalPage<Size4K>, MemoryError> {
        let frame = self.space.unmap(&mut *self.frames, &mut self.da, page)?;
        self.da.mmu().flush(page);
        Ok(frame)
    }
}

impl<U: Mmu> HeapBacking for SteadyParts<'_, U> {
    fn commit(&mut self, va: VirtualAddress, pages: u64) -> Result<(), HeapError> {
        let first = va.page::<Size4K>();
        for i in 0..pages {
            let page = first.add(i);
            let mapped = match self.frames.alloc(&mut self.da) {
                Some(frame) => self
                    .space
                    .map_page(&mut *self.frames, &mut self.da, page, frame)
                    .map_err(|e| {
                        self.frames.free_via(&mut self.da, frame);
                        HeapError::from(e)
                    }),
                None => Err(HeapError::OutOfMemory),
            };
            if let Err(e) = mapped {
                debug!("heap commit at {va} failed after {i} of {pages} pages: {e}");
                for j in 0..i {
                    let page = first.add(j);
                    if let Err(e) = self.unmap(page) {
                        warn!("heap commit rollback left {} in place: {e}", page.base());
                    }
                }
                return Err(e);
            }
        }
        Ok(())
    }

    fn resolve(&self, va: VirtualAddress) -> *mut u8 {
        self.da.resolve(va)
    }
}

/// The 2 MiB pages covering `range`.
fn huge_pages(range: PhysicalRange) -> impl Iterator<Item = PhysicalPage<Size2M>> {
    let range = range.page_aligned::<Size2M>();
    let first = PhysicalPage::<Size2M>::from_aligned(range.start());
    (0..range.len() >> Size2M::SHIFT).map(move |k| first.add(k))
}

/// Discards every release while the bootstrap identity map is torn down.
///
/// The frames behind the 2 MiB leaves belong to whoever holds them now; the
/// tables came from the bootstrap pool.
#[derive(Default)]
struct KeepFrames {
    released: u64,
}

impl FrameAlloc for KeepFrames {
    fn alloc_4k<M: PhysMapper>(&mut self, _: &mut M) -> Option<PhysicalPage<Size4K>> {
        None
    }

    fn release_4k<M: PhysMapper>(&mut self, _: &mut M, _: PhysicalPage<Size4K>) {
        self.released += 1;
    }
}

/// The kernel's memory context.
///
/// Owns the frame allocator, both address spaces, the direct-access slot, the
/// heap and the arena pool. Operations assert the [`Stage`] they need.
pub struct MemorySubsystem<U: Mmu, const N: usize = HEAP_CLASSES> {
    stage: Stage,
    layout: MemoryLayout,
    mmu: U,
    frames: Option<FrameAllocator>,
    bootstrap_space: Option<AddressSpace>,
    kernel: Option<KernelSpace>,
    framebuffer: Option<FramebufferInfo>,
    heap: Option<BuddyHeap<N>>,
    arenas: ArenaPool,
}

impl<U: Mmu, const N: usize> MemorySubsystem<U, N> {
    /// A subsystem in [`Stage::PrePaging`].
    ///
    /// # Errors
    /// If `layout` fails [`MemoryLayout::check`].
    pub fn new(mmu: U, layout: MemoryLayout) -> Result<Self, MemoryError> {
        layout.check()?;
        Ok(Self {
            stage: Stage::PrePaging,
            layout,
            mmu,
            frames: None,
            bootstrap_space: None,
            kernel: None,
            framebuffer: None,
            heap: None,
            arenas: ArenaPool::new(),
        })
    }

    #[must_use]
    pub const fn stage(&self) -> Stage {
        self.stage
    }

    #[must_use]
    pub const fn layout(&self) -> &MemoryLayout {
        &self.layout
    }

    #[must_use]
    pub const fn mmu(&self) -> &U {
        &self.mmu
    }

    /// Reads the boot information, starts the frame allocator and identity
    /// maps every usable section and the frame buffer with 2 MiB pages.
    ///
    /// # Errors
    /// Malformed boot information, or a bootstrap pool too small for the
    /// identity map.
    ///
    /// # Panics
    /// Unless in [`Stage::PrePaging`].
    pub fn bootstrap_1(&mut self, handoff: &BootHandoff<'_>) -> Result<(), MemoryError> {
        self.enter(Stage::PrePaging, Stage::BootstrapPaging);

        let mut frames = FrameAllocator::bootstrap(
            handoff.memory_map,
            handoff.elf_symbols,
            handoff.pool,
            handoff.probe,
        )?;
        if let Some(payload) = handoff.framebuffer {
            let fb = FramebufferInfo::parse(payload)?;
            let len = fb.range().page_aligned::<Size4K>().len();
            if len > self.layout.frame_buffer_capacity() {
                return Err(MemoryError::FrameBufferTooLarge(len));
            }
            frames.reserve(fb.range());
            debug!("frame buffer {}x{} at {}", fb.width, fb.height, fb.paddr);
            self.framebuffer = Some(fb);
        }

        let mut m = IdentityMapper;
        let mut space = AddressSpace::new(&mut frames, &mut m)?;
        let mut last: Option<PhysicalPage<Size2M>> = None;
        let mut huge = 0u64;
        for i in 0..frames.sections().len() {
            for pa in huge_pages(frames.sections()[i]) {
                if last.is_some_and(|l| pa <= l) {
                    continue;
                }
                let va = VirtualPage::from_aligned(VirtualAddress::new(pa.base().as_u64()));
                space.map_huge(&mut frames, &mut m, va, pa)?;
                last = Some(pa);
                huge += 1;
            }
        }
        if let Some(fb) = self.framebuffer {
            for pa in huge_pages(fb.range()) {
                let va = VirtualPage::from_aligned(VirtualAddress::new(pa.base().as_u64()));
                if space.translate(&mut m, va.base()).is_some() {
                    continue;
                }
                space.map_huge(&mut frames, &mut m, va, pa)?;
                huge += 1;
            }
        }

        // SAFETY: the identity map covers the frame buffer and all usable
        // RAM, which holds the kernel image and the boot stack.
        unsafe { self.mmu.load_root(space.root()) };
        info!(
            "identity mapped {huge} 2M pages, {} bootstrap frames used",
            frames.bootstrap_used()
        );

        self.frames = Some(frames);
        self.bootstrap_space = Some(space);
        self.stage = Stage::BootstrapPaging;
        Ok(())
    }

    /// Builds the final address space, switches to it, hands all managed
    /// frames to the free list and tears the identity map down.
    ///
    /// The final space maps the kernel image at its physical address, the
    /// stack between its guards, the frame buffer window and the
    /// direct-access chain.
    ///
    /// # Errors
    /// When frames run out while building the final tables.
    ///
    /// # Panics
    /// Unless in [`Stage::BootstrapPaging`].
    pub fn bootstrap_2(&mut self) -> Result<(), MemoryError> {
        self.enter(Stage::BootstrapPaging, Stage::SteadyState);
        let layout = self.layout;
        let (Some(frames), Some(mut old)) = (self.frames.as_mut(), self.bootstrap_space.take())
        else {
            unreachable!("stage 1 sets up frames and the identity map");
        };
        let mut m = IdentityMapper;

        let mut take = || frames.alloc_bootstrap().ok_or(MemoryError::OutOfFrames);
        let chain = [take()?, take()?, take()?];
        let mut space = AddressSpace::new(&mut *frames, &mut m)?;
        // SAFETY: pool frames lie in the kernel image, which is identity
        // mapped in both address spaces.
        let mut slot = unsafe { DirectAccessSlot::new(layout.direct_access.page(), chain) };
        slot.install(&mut space, &mut m);

        let image = frames.kernel_image().page_aligned::<Size4K>();
        let pages = image.len() >> Size4K::SHIFT;
        let base = PhysicalPage::from_aligned(image.start());
        let va = VirtualPage::from_aligned(VirtualAddress::new(image.start().as_u64()));
        space.map(&mut *frames, &mut m, va, pages, &[PaRange::new(base, pages)])?;

        if let Some(fb) = self.framebuffer {
            let range = fb.range().page_aligned::<Size4K>();
            let pages = range.len() >> Size4K::SHIFT;
            let base = PhysicalPage::from_aligned(range.start());
            space.map(&mut *frames, &mut m, layout.frame_buffer.page(), pages, &[PaRange::new(base, pages)])?;
        }

        frames.enter_steady_state(&mut m);

        let stack = layout.stack_top().page::<Size4K>();
        for i in 0..layout.stack_pages {
            let frame = frames.alloc(&mut m).ok_or(MemoryError::OutOfFrames)?;
            space.map_page(&mut *frames, &mut m, stack.add(i), frame)?;
        }

        // SAFETY: the new space maps the kernel image at its physical address
        // and every frame the subsystem still has to touch is reachable
        // through the direct-access slot.
        unsafe { self.mmu.load_root(space.root()) };

        let mut sink = KeepFrames::default();
        let mut da = DirectAccess::new(&mut slot, &mut self.mmu);
        let mut last: Option<PhysicalPage<Size2M>> = None;
        for &section in frames.sections() {
            for pa in huge_pages(section) {
                if last.is_some_and(|l| pa <= l) {
                    continue;
                }
                let va = VirtualPage::<Size2M>::from_aligned(VirtualAddress::new(pa.base().as_u64()));
                old.unmap(&mut sink, &mut da, va)?;
                last = Some(pa);
            }
        }
        if let Some(fb) = self.framebuffer {
            for pa in huge_pages(fb.range()) {
                let va = VirtualPage::<Size2M>::from_aligned(VirtualAddress::new(pa.base().as_u64()));
                if old.translate(&mut da, va.base()).is_some() {
                    old.unmap(&mut sink, &mut da, va)?;
                }
            }
        }
        trace!("identity map torn down, {} frames left with their owners", sink.released);

        info!(
            "final address space {} active, {} free frames",
            space.root(),
            frames.free_count()
        );
        self.kernel = Some(KernelSpace { space, slot });
        self.stage = Stage::SteadyState;
        Ok(())
    }

    /// Opens the heap window. The heap commits memory on first use.
    ///
    /// # Panics
    /// Unless in [`Stage::SteadyState`].
    pub fn bootstrap_3(&mut self) {
        self.enter(Stage::SteadyState, Stage::HeapReady);
        let base = self.layout.heap;
        let window_end = base.as_u64() - base.as_u64() % ROOT_ENTRY_SPAN + ROOT_ENTRY_SPAN;
        let max_units = (window_end - base.as_u64()) / (BuddyHeap::<N>::UNIT_PAGES * FRAME_SIZE);
        self.heap = Some(BuddyHeap::new(base, max_units));
        info!("heap window at {base}, up to {max_units} units");
        self.stage = Stage::HeapReady;
    }

    /// Maps `n_pages` pages at `va` onto the frames of `pa_list`.
    ///
    /// # Errors
    /// When a page table cannot be allocated.
    ///
    /// # Panics
    /// Before [`Stage::SteadyState`], when `pa_list` is too short, or when a
    /// page is already mapped.
    pub fn page_map(
        &mut self,
        va: VirtualPage<Size4K>,
        n_pages: u64,
        pa_list: &[PaRange],
    ) -> Result<(), MemoryError> {
        let mut p = self.steady("page_map");
        p.space.map(&mut *p.frames, &mut p.da, va, n_pages, pa_list)?;
        Ok(())
    }

    /// Unmaps the page at `va`, returns its frame to the free list and
    /// invalidates the translation.
    ///
    /// Page tables left empty are released too.
    ///
    /// # Errors
    /// [`MapError::NotMapped`](kernel_vmem::MapError::NotMapped) if nothing is
    /// mapped at `va`.
    pub fn page_unmap(&mut self, va: VirtualPage<Size4K>) -> Result<PhysicalPage<Size4K>, MemoryError> {
        self.steady("page_unmap").unmap(va)
    }

    /// Physical address `va` maps to in the active space.
    pub fn translate(&mut self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let mut p = self.steady("translate");
        p.space.translate(&mut p.da, va)
    }

    pub fn frame_alloc(&mut self) -> Option<PhysicalPage<Size4K>> {
        let mut p = self.steady("frame_alloc");
        p.frames.alloc(&mut p.da)
    }

    /// # Panics
    /// If `pa` is not a managed frame.
    pub fn frame_free(&mut self, pa: PhysicalPage<Size4K>) {
        let mut p = self.steady("frame_free");
        p.frames.free_via(&mut p.da, pa);
    }

    #[must_use]
    pub fn pa_start(&self) -> PhysicalAddress {
        self.frames("pa_start").pa_start()
    }

    #[must_use]
    pub fn pa_end(&self) -> PhysicalAddress {
        self.frames("pa_end").pa_end()
    }

    #[must_use]
    pub fn pa_range_valid(&self, start: PhysicalAddress, end: PhysicalAddress) -> bool {
        self.frames("pa_range_valid").pa_range_valid(start, end)
    }

    /// Frames on the free list (bootstrap pool frames before steady state).
    #[must_use]
    pub fn free_frames(&self) -> u64 {
        self.frames("free_frames").free_count()
    }

    #[must_use]
    pub fn frame_allocator(&self) -> &FrameAllocator {
        self.frames("frame_allocator")
    }

    /// Maps `frame` at the direct-access page until the guard drops.
    ///
    /// # Panics
    /// Before [`Stage::SteadyState`].
    pub fn direct_access(&mut self, frame: PhysicalPage<Size4K>) -> DirectAccessGuard<'_, U> {
        self.require(Stage::SteadyState, "direct_access");
        let Some(k) = self.kernel.as_mut() else {
            unreachable!("stage 2 sets up the kernel space");
        };
        k.slot.setup(&mut self.mmu, frame)
    }

    /// # Errors
    /// When the heap must grow and no memory is left.
    ///
    /// # Panics
    /// Before [`Stage::HeapReady`], or on a zero or oversized `len`.
    pub fn heap_alloc(&mut self, len: usize) -> Result<(NonNull<u8>, usize), MemoryError> {
        let (heap, _, mut p) = self.heap_parts("heap_alloc");
        Ok(heap.alloc(len, &mut p)?)
    }

    /// # Errors
    /// When the heap must grow and no memory is left.
    pub fn heap_alloc_minimum(&mut self) -> Result<(NonNull<u8>, usize), MemoryError> {
        let (heap, _, mut p) = self.heap_parts("heap_alloc_minimum");
        Ok(heap.alloc_minimum(&mut p)?)
    }

    /// # Safety
    /// `ptr` must come from [`heap_alloc`](Self::heap_alloc) and must not be
    /// used afterwards.
    pub unsafe fn heap_free(&mut self, ptr: NonNull<u8>) {
        let (heap, _, p) = self.heap_parts("heap_free");
        // SAFETY: guaranteed by the caller.
        unsafe { heap.free(ptr, &p) };
    }

    /// Walks the heap and checks its invariants.
    ///
    /// # Panics
    /// Before [`Stage::HeapReady`], or on a corrupted heap.
    #[must_use]
    pub fn heap_stats(&mut self) -> HeapStats {
        let (heap, _, p) = self.heap_parts("heap_stats");
        heap.validate(&p)
    }

    #[must_use]
    pub fn heap(&self) -> Option<&BuddyHeap<N>> {
        self.heap.as_ref()
    }

    /// # Errors
    /// When the heap cannot provide a block for allocator records.
    pub fn allocator_new(&mut self) -> Result<MmAllocator, MemoryError> {
        let (heap, arenas, mut p) = self.heap_parts("allocator_new");
        Ok(arenas.new_allocator(heap, &mut p)?)
    }

    /// # Errors
    /// When the heap cannot provide a new area.
    pub fn allocate(
        &mut self,
        allocator: &mut MmAllocator,
        size: usize,
        align: usize,
    ) -> Result<NonNull<u8>, MemoryError> {
        let (heap, arenas, mut p) = self.heap_parts("allocate");
        Ok(arenas.allocate(heap, &mut p, allocator, size, align)?)
    }

    /// # Safety
    /// No pointer obtained through `allocator` may be used afterwards.
    pub unsafe fn allocator_free(&mut self, allocator: MmAllocator) {
        let (heap, arenas, p) = self.heap_parts("allocator_free");
        // SAFETY: the subsystem owns a single heap; the rest is on the caller.
        unsafe { arenas.free_allocator(heap, &p, allocator) };
    }

    /// Number of heap blocks `allocator` currently owns.
    #[must_use]
    pub fn allocator_areas(&mut self, allocator: &MmAllocator) -> usize {
        let (_, _, p) = self.heap_parts("allocator_areas");
        ArenaPool::area_count(&p, allocator)
    }

    #[must_use]
    pub const fn arenas(&self) -> &ArenaPool {
        &self.arenas
    }

    /// The frame buffer, once it is mapped at its window.
    #[must_use]
    pub fn frame_buffer(&self) -> Option<FrameBuffer> {
        if self.stage < Stage::SteadyState {
            return None;
        }
        self.framebuffer.map(|info| FrameBuffer {
            va: self.layout.frame_buffer + info.paddr.offset::<Size4K>(),
            info,
        })
    }

    /// Mapped kernel stack pages, between the two guards.
    #[must_use]
    pub fn stack(&self) -> Range<VirtualAddress> {
        self.layout.stack_top()..self.layout.stack_bottom_guard()
    }

    fn enter(&self, from: Stage, to: Stage) {
        assert_eq!(
            self.stage, from,
            "cannot enter {to}: memory subsystem is in {}",
            self.stage
        );
    }

    fn require(&self, stage: Stage, op: &str) {
        assert!(
            self.stage >= stage,
            "{op} needs {stage}, memory subsystem is in {}",
            self.stage
        );
    }

    fn frames(&self, op: &str) -> &FrameAllocator {
        self.require(Stage::BootstrapPaging, op);
        let Some(frames) = self.frames.as_ref() else {
            unreachable!("stage 1 sets up the frame allocator");
        };
        frames
    }

    fn steady(&mut self, op: &str) -> SteadyParts<'_, U> {
        self.require(Stage::SteadyState, op);
        let (Some(frames), Some(k)) = (self.frames.as_mut(), self.kernel.as_mut()) else {
            unreachable!("stage 2 sets up frames and the kernel space");
        };
        SteadyParts {
            frames,
            space: &mut k.space,
            da: DirectAccess::new(&mut k.slot, &mut self.mmu),
        }
    }

    fn heap_parts(&mut self, op: &str) -> (&mut BuddyHeap<N>, &mut ArenaPool, SteadyParts<'_, U>) {
        self.require(Stage::HeapReady, op);
        let (Some(heap), Some(frames), Some(k)) =
            (self.heap.as_mut(), self.frames.as_mut(), self.kernel.as_mut())
        else {
            unreachable!("stage 3 sets up the heap");
        };
        let parts = SteadyParts {
            frames,
            space: &mut k.space,
            da: DirectAccess::new(&mut k.slot, &mut self.mmu),
        };
        (heap, &mut self.arenas, parts)
    }
}
