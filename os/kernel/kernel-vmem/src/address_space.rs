//! # Address Space (x86-64, PML4-rooted)
//!
//! Helpers to build and tear down a **single** virtual address space, the
//! tree of page tables under one PML4 frame.
//!
//! ## Highlights
//!
//! - [`AddressSpace::map_huge`] installs a 2 MiB leaf; used for the early
//!   identity map.
//! - [`AddressSpace::map`] maps a run of 4 KiB pages onto a list of physical
//!   ranges, allocating missing intermediate tables on the way.
//! - [`AddressSpace::unmap`] clears one 4 KiB or 2 MiB leaf, hands its frames
//!   back and reclaims every table that became empty.
//! - [`AddressSpace::translate`] walks the tables in software.
//!
//! ## Design
//!
//! - Intermediate entries are created present and writable; no user or
//!   global bits are set, the kernel owns every mapping.
//! - Tables are reached only through the [`PhysMapper`], so the same code runs
//!   on identity-mapped boot memory and through the direct-access slot.
//! - Up to three tables can be **pinned**. A pinned table is never reclaimed,
//!   even when it becomes empty; the direct-access chain lives there.
//!
//! ## Safety
//!
//! - Mutating active mappings requires TLB maintenance. None of the methods
//!   here flush; the caller does, after the fact, for every page it unmapped.

use crate::level::Level;
use crate::pa_list::{PaCursor, PaRange};
use crate::page_table::PageTable;
use crate::{FrameAlloc, PageTableEntry, PhysMapper};
use kernel_memory_addresses::{
    PageSize, PhysicalAddress, PhysicalPage, Size2M, Size4K, VirtualAddress, VirtualPage,
};
use log::{debug, trace};

/// Errors from building or editing an address space.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MapError {
    /// No frame was available for a page table at the given level.
    #[error("out of frames for a level {0} page table")]
    OutOfMemory(u8),
    #[error("{0} is not mapped")]
    NotMapped(VirtualAddress),
}

/// Page sizes that can be unmapped, with the level holding their leaf.
pub trait LeafSize: PageSize {
    const LEVEL: Level;
}

impl LeafSize for Size4K {
    const LEVEL: Level = Level::L1;
}

impl LeafSize for Size2M {
    const LEVEL: Level = Level::L2;
}

/// The PML4 root page for an [`AddressSpace`].
pub type RootPage = PhysicalPage<Size4K>;

const PIN_SLOTS: usize = 3;

/// Handle to a single, concrete address space.
#[derive(Debug)]
pub struct AddressSpace {
    root: RootPage,
    pinned: [Option<PhysicalPage<Size4K>>; PIN_SLOTS],
}

impl AddressSpace {
    /// Allocates and clears a fresh root.
    ///
    /// # Errors
    /// [`MapError::OutOfMemory`] if no frame is left for the root.
    pub fn new<A: FrameAlloc, M: PhysMapper>(alloc: &mut A, mapper: &mut M) -> Result<Self, MapError> {
        let root = alloc
            .alloc_4k(mapper)
            .ok_or(MapError::OutOfMemory(Level::L4.number()))?;
        mapper.with_table(root, PageTable::zero);
        debug!("new address space, root {root}");
        Ok(Self::from_root(root))
    }

    /// Wraps an existing root table.
    #[inline]
    #[must_use]
    pub const fn from_root(root: RootPage) -> Self {
        Self {
            root,
            pinned: [None; PIN_SLOTS],
        }
    }

    /// Physical page of the PML4.
    #[inline]
    #[must_use]
    pub const fn root(&self) -> RootPage {
        self.root
    }

    /// Excludes `table` from reclamation.
    ///
    /// # Panics
    /// If all pin slots are taken.
    pub fn pin(&mut self, table: PhysicalPage<Size4K>) {
        if self.is_pinned(table) {
            return;
        }
        let Some(slot) = self.pinned.iter_mut().find(|s| s.is_none()) else {
            panic!("no pin slot left for table {table}");
        };
        *slot = Some(table);
    }

    #[must_use]
    pub fn is_pinned(&self, table: PhysicalPage<Size4K>) -> bool {
        self.pinned.contains(&Some(table))
    }

    /// Links an existing level 3 table as the root entry covering `va`.
    ///
    /// # Panics
    /// If that root entry is already in use.
    pub fn attach<M: PhysMapper>(&mut self, mapper: &mut M, va: VirtualAddress, l3: PhysicalPage<Size4K>) {
        let link = PageTableEntry::init(Level::L4, l3);
        mapper.with_table(self.root, |t| {
            assert!(
                t.entry_for(Level::L4, va).is_zero(),
                "root entry for {va} is already in use"
            );
            t.set_for(Level::L4, va, link);
        });
        trace!("attached level 3 table {l3} for {va}");
    }

    /// Maps one 2 MiB page.
    ///
    /// # Errors
    /// [`MapError::OutOfMemory`] if an intermediate table cannot be allocated.
    ///
    /// # Panics
    /// If `va` is already mapped.
    pub fn map_huge<A: FrameAlloc, M: PhysMapper>(
        &mut self,
        alloc: &mut A,
        mapper: &mut M,
        va: VirtualPage<Size2M>,
        pa: PhysicalPage<Size2M>,
    ) -> Result<(), MapError> {
        self.map_leaf(alloc, mapper, va.base(), pa)
    }

    /// Maps one 4 KiB page.
    ///
    /// # Errors
    /// [`MapError::OutOfMemory`] if an intermediate table cannot be allocated.
    pub fn map_page<A: FrameAlloc, M: PhysMapper>(
        &mut self,
        alloc: &mut A,
        mapper: &mut M,
        va: VirtualPage<Size4K>,
        pa: PhysicalPage<Size4K>,
    ) -> Result<(), MapError> {
        self.map_leaf(alloc, mapper, va.base(), pa)
    }

    /// Maps `pages` consecutive 4 KiB pages starting at `va`, taking physical
    /// frames from `pa_list` in order.
    ///
    /// Pages mapped before an allocation failure stay mapped.
    ///
    /// # Errors
    /// [`MapError::OutOfMemory`] if an intermediate table cannot be allocated.
    ///
    /// # Panics
    /// If `pa_list` holds fewer than `pages` frames, or a target page is
    /// already mapped.
    pub fn map<A: FrameAlloc, M: PhysMapper>(
        &mut self,
        alloc: &mut A,
        mapper: &mut M,
        va: VirtualPage<Size4K>,
        pages: u64,
        pa_list: &[PaRange],
    ) -> Result<(), MapError> {
        let mut frames = PaCursor::new(pa_list);
        for i in 0..pages {
            let Some(pa) = frames.next() else {
                panic!("physical range list ends after {i} of {pages} pages");
            };
            self.map_leaf(alloc, mapper, va.add(i).base(), pa)?;
        }
        trace!("mapped {pages} pages at {va}");
        Ok(())
    }

    /// Removes the leaf of size `S` at `va` and returns its frame.
    ///
    /// The frames behind the page go back to `alloc`, then every page table
    /// on the path that is now empty is unlinked and released, bottom-up. The
    /// root and pinned tables are kept.
    ///
    /// # Errors
    /// [`MapError::NotMapped`] if there is no leaf at `va`.
    ///
    /// # Panics
    /// If `va` is covered by a leaf of a different size.
    pub fn unmap<S: LeafSize, A: FrameAlloc, M: PhysMapper>(
        &mut self,
        alloc: &mut A,
        mapper: &mut M,
        va: VirtualPage<S>,
    ) -> Result<PhysicalPage<S>, MapError> {
        let addr = va.base();

        // path[i] is the table at Level::WALK[i].
        let mut path = [self.root; 4];
        let mut len = 1;
        for level in Level::WALK.into_iter().take_while(|l| *l > S::LEVEL) {
            let e = mapper.with_table(path[len - 1], |t| t.entry_for(level, addr));
            if e.is_zero() {
                return Err(MapError::NotMapped(addr));
            }
            let Some(next) = e.next_table() else {
                panic!("{addr} is covered by a level {level} leaf, not a {} page", S::NAME);
            };
            path[len] = next;
            len += 1;
        }

        let leaf_table = path[len - 1];
        let e = mapper.with_table(leaf_table, |t| t.entry_for(S::LEVEL, addr));
        if e.is_zero() {
            return Err(MapError::NotMapped(addr));
        }
        assert_eq!(
            e.huge(),
            S::LEVEL != Level::L1,
            "leaf at {addr} is not a {} page",
            S::NAME
        );
        mapper.with_table(leaf_table, |t| t.set_for(S::LEVEL, addr, PageTableEntry::zero()));

        let first = PhysicalPage::<Size4K>::from_aligned(e.physical_address());
        for i in 0..S::FRAMES {
            alloc.release_4k(mapper, first.add(i));
        }

        for i in (1..len).rev() {
            let table = path[i];
            if self.is_pinned(table) || !mapper.with_table(table, |t| t.is_zero()) {
                break;
            }
            let parent = Level::WALK[i - 1];
            mapper.with_table(path[i - 1], |t| t.set_for(parent, addr, PageTableEntry::zero()));
            alloc.release_4k(mapper, table);
            trace!("released level {} table {table}", Level::WALK[i]);
        }

        Ok(PhysicalPage::from_aligned(e.physical_address()))
    }

    /// Translate a `VirtualAddress` to a `PhysicalAddress` if mapped.
    ///
    /// Handles 1 GiB and 2 MiB leaves by adding the in-page offset.
    pub fn translate<M: PhysMapper>(&self, mapper: &mut M, va: VirtualAddress) -> Option<PhysicalAddress> {
        let mut table = self.root;
        for level in Level::WALK {
            let e = mapper.with_table(table, |t| t.entry_for(level, va));
            if !e.present() {
                return None;
            }
            if level == Level::L1 || e.huge() {
                return Some(e.physical_address() + (va.as_u64() & (level.covers() - 1)));
            }
            table = e.next_table()?;
        }
        None
    }

    fn map_leaf<S: LeafSize, A: FrameAlloc, M: PhysMapper>(
        &mut self,
        alloc: &mut A,
        mapper: &mut M,
        va: VirtualAddress,
        pa: PhysicalPage<S>,
    ) -> Result<(), MapError> {
        let mut table = self.root;
        for level in Level::WALK.into_iter().take_while(|l| *l > S::LEVEL) {
            table = Self::ensure_child(alloc, mapper, table, level, va)?;
        }

        let leaf = PageTableEntry::init(S::LEVEL, pa);
        mapper.with_table(table, |t| {
            assert!(t.entry_for(S::LEVEL, va).is_zero(), "{va} is already mapped");
            t.set_for(S::LEVEL, va, leaf);
        });
        Ok(())
    }

    /// Follows the entry for `va` in `table` (at `level`), creating the next
    /// table if the entry is empty.
    fn ensure_child<A: FrameAlloc, M: PhysMapper>(
        alloc: &mut A,
        mapper: &mut M,
        table: PhysicalPage<Size4K>,
        level: Level,
        va: VirtualAddress,
    ) -> Result<PhysicalPage<Size4K>, MapError> {
        let e = mapper.with_table(table, |t| t.entry_for(level, va));
        if let Some(next) = e.next_table() {
            return Ok(next);
        }
        assert!(e.is_zero(), "level {level} entry for {va} is a large page");

        let child_level = level.number() - 1;
        let child = alloc
            .alloc_4k(mapper)
            .ok_or(MapError::OutOfMemory(child_level))?;
        mapper.with_table(child, PageTable::zero);
        let link = PageTableEntry::init(level, child);
        mapper.with_table(table, |t| t.set_for(level, va, link));
        trace!("level {child_level} table {child} for {va}");
        Ok(child)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::IdentityMapper;
    use crate::testing::TestPhys;

    const HIGH: u64 = 0xFFFF_8000_0000_0000;

    fn vpage(va: u64) -> VirtualPage<Size4K> {
        VirtualPage::from_aligned(VirtualAddress::new(va))
    }

    /// Table at `level` on the walk to `va`.
    fn table_at(space: &AddressSpace, va: u64, level: Level) -> Option<PhysicalPage<Size4K>> {
        let va = VirtualAddress::new(va);
        let mut m = IdentityMapper;
        let mut table = space.root();
        for l in Level::WALK.into_iter().take_while(|l| *l > level) {
            table = m.with_table(table, |t| t.entry_for(l, va)).next_table()?;
        }
        Some(table)
    }

    #[test]
    fn map_creates_tables_and_leaf() {
        let phys = TestPhys::with_frames(64);
        let mut alloc = phys.bump(0);
        let mut m = IdentityMapper;
        let mut space = AddressSpace::new(&mut alloc, &mut m).unwrap();

        let pa = phys.frame(60);
        space
            .map(&mut alloc, &mut m, vpage(HIGH), 1, &[PaRange::single(pa)])
            .expect("map");

        // root, L3, L2, L1
        assert_eq!(alloc.remaining(), 60);
        let root_entry = m.with_table(space.root(), |t| t.get(256));
        assert!(root_entry.present() && root_entry.writable() && !root_entry.huge());

        let l1 = table_at(&space, HIGH, Level::L1).unwrap();
        let leaf = m.with_table(l1, |t| t.get(0));
        assert!(leaf.present());
        assert!(!leaf.huge());
        assert_eq!(leaf.physical_address(), pa.base());

        assert_eq!(
            space.translate(&mut m, VirtualAddress::new(HIGH + 0x123)),
            Some(pa.base() + 0x123)
        );
        assert_eq!(space.translate(&mut m, VirtualAddress::new(HIGH + 0x1000)), None);
    }

    #[test]
    fn map_consumes_scattered_ranges_in_order() {
        let phys = TestPhys::with_frames(64);
        let mut alloc = phys.bump(0);
        let mut m = IdentityMapper;
        let mut space = AddressSpace::new(&mut alloc, &mut m).unwrap();

        let list = [PaRange::single(phys.frame(60)), PaRange::new(phys.frame(50), 2)];
        space.map(&mut alloc, &mut m, vpage(HIGH + 0x1000), 3, &list).unwrap();

        for (i, want) in [60, 50, 51].into_iter().enumerate() {
            let va = VirtualAddress::new(HIGH + 0x1000 * (i as u64 + 1));
            assert_eq!(space.translate(&mut m, va), Some(phys.frame(want).base()));
        }
    }

    #[test]
    #[should_panic(expected = "physical range list ends after 1 of 2 pages")]
    fn map_panics_on_short_range_list() {
        let phys = TestPhys::with_frames(16);
        let mut alloc = phys.bump(0);
        let mut m = IdentityMapper;
        let mut space = AddressSpace::new(&mut alloc, &mut m).unwrap();
        let _ = space.map(&mut alloc, &mut m, vpage(HIGH), 2, &[PaRange::single(phys.frame(15))]);
    }

    #[test]
    fn map_reports_exhaustion_with_level() {
        let phys = TestPhys::with_frames(16);
        let mut alloc = phys.bump(14);
        let mut m = IdentityMapper;
        let mut space = AddressSpace::new(&mut alloc, &mut m).unwrap();
        let r = space.map(&mut alloc, &mut m, vpage(HIGH), 1, &[PaRange::single(phys.frame(0))]);
        assert_eq!(r, Err(MapError::OutOfMemory(2)));
    }

    #[test]
    fn map_huge_sets_ps_bit() {
        let phys = TestPhys::with_frames(16);
        let mut alloc = phys.bump(0);
        let mut m = IdentityMapper;
        let mut space = AddressSpace::new(&mut alloc, &mut m).unwrap();

        let va = VirtualPage::<Size2M>::from_aligned(VirtualAddress::new(0x4000_0000));
        let pa = PhysicalPage::<Size2M>::from_aligned(PhysicalAddress::new(0x0400_0000));
        space.map_huge(&mut alloc, &mut m, va, pa).unwrap();

        let l2 = table_at(&space, 0x4000_0000, Level::L2).unwrap();
        let pde = m.with_table(l2, |t| t.get(0));
        assert!(pde.present() && pde.huge() && pde.writable());
        assert_eq!(pde.physical_address(), pa.base());
        assert_eq!(
            space.translate(&mut m, VirtualAddress::new(0x4012_3456)),
            Some(PhysicalAddress::new(0x0412_3456))
        );
    }

    #[test]
    fn unmap_releases_frame_and_empty_tables() {
        let phys = TestPhys::with_frames(64);
        let mut alloc = phys.bump(0);
        let mut m = IdentityMapper;
        let mut space = AddressSpace::new(&mut alloc, &mut m).unwrap();
        space
            .map(&mut alloc, &mut m, vpage(HIGH), 1, &[PaRange::single(phys.frame(60))])
            .unwrap();
        let l3 = table_at(&space, HIGH, Level::L3).unwrap();
        let l2 = table_at(&space, HIGH, Level::L2).unwrap();
        let l1 = table_at(&space, HIGH, Level::L1).unwrap();

        let frame = space.unmap(&mut alloc, &mut m, vpage(HIGH)).unwrap();
        assert_eq!(frame, phys.frame(60));
        assert_eq!(alloc.released, [phys.frame(60), l1, l2, l3]);
        assert!(m.with_table(space.root(), |t| t.is_zero()));
        assert_eq!(space.translate(&mut m, VirtualAddress::new(HIGH)), None);
        assert_eq!(
            space.unmap(&mut alloc, &mut m, vpage(HIGH)),
            Err(MapError::NotMapped(VirtualAddress::new(HIGH)))
        );
    }

    #[test]
    fn unmap_keeps_tables_still_in_use() {
        let phys = TestPhys::with_frames(64);
        let mut alloc = phys.bump(0);
        let mut m = IdentityMapper;
        let mut space = AddressSpace::new(&mut alloc, &mut m).unwrap();
        space
            .map(&mut alloc, &mut m, vpage(HIGH), 2, &[PaRange::new(phys.frame(60), 2)])
            .unwrap();

        space.unmap(&mut alloc, &mut m, vpage(HIGH)).unwrap();
        assert_eq!(alloc.released, [phys.frame(60)]);
        assert_eq!(
            space.translate(&mut m, VirtualAddress::new(HIGH + 0x1000)),
            Some(phys.frame(61).base())
        );
    }

    #[test]
    fn pinned_tables_survive_reclamation() {
        let phys = TestPhys::with_frames(64);
        let mut alloc = phys.bump(0);
        let mut m = IdentityMapper;
        let mut space = AddressSpace::new(&mut alloc, &mut m).unwrap();
        space
            .map(&mut alloc, &mut m, vpage(HIGH), 1, &[PaRange::single(phys.frame(60))])
            .unwrap();
        let l3 = table_at(&space, HIGH, Level::L3).unwrap();
        let l2 = table_at(&space, HIGH, Level::L2).unwrap();
        let l1 = table_at(&space, HIGH, Level::L1).unwrap();
        space.pin(l2);
        assert!(space.is_pinned(l2));

        space.unmap(&mut alloc, &mut m, vpage(HIGH)).unwrap();
        assert_eq!(alloc.released, [phys.frame(60), l1]);
        assert_eq!(table_at(&space, HIGH, Level::L2), Some(l2));
        assert_eq!(table_at(&space, HIGH, Level::L3), Some(l3));
    }

    #[test]
    fn unmap_huge_releases_every_frame() {
        let phys = TestPhys::with_frames(16);
        let mut alloc = phys.bump(0);
        let mut m = IdentityMapper;
        let mut space = AddressSpace::new(&mut alloc, &mut m).unwrap();
        let va = VirtualPage::<Size2M>::from_aligned(VirtualAddress::new(0x20_0000));
        let pa = PhysicalPage::<Size2M>::from_aligned(PhysicalAddress::new(0x0400_0000));
        space.map_huge(&mut alloc, &mut m, va, pa).unwrap();

        assert_eq!(space.unmap(&mut alloc, &mut m, va), Ok(pa));
        // 512 data frames, then the level 2 and level 3 tables.
        assert_eq!(alloc.released.len(), 514);
        assert_eq!(alloc.released[0].base(), pa.base());
        assert_eq!(alloc.released[511].base().as_u64(), 0x0400_0000 + 511 * 4096);
    }

    #[test]
    #[should_panic(expected = "is covered by a level 2 leaf, not a 4K page")]
    fn unmap_rejects_size_mismatch() {
        let phys = TestPhys::with_frames(16);
        let mut alloc = phys.bump(0);
        let mut m = IdentityMapper;
        let mut space = AddressSpace::new(&mut alloc, &mut m).unwrap();
        let va = VirtualPage::<Size2M>::from_aligned(VirtualAddress::new(0x20_0000));
        let pa = PhysicalPage::<Size2M>::from_aligned(PhysicalAddress::new(0x0400_0000));
        space.map_huge(&mut alloc, &mut m, va, pa).unwrap();
        let _ = space.unmap(&mut alloc, &mut m, vpage(0x20_1000));
    }

    #[test]
    #[should_panic(expected = "is already mapped")]
    fn double_map_panics() {
        let phys = TestPhys::with_frames(16);
        let mut alloc = phys.bump(0);
        let mut m = IdentityMapper;
        let mut space = AddressSpace::new(&mut alloc, &mut m).unwrap();
        let pa = phys.frame(15);
        space.map_page(&mut alloc, &mut m, vpage(HIGH), pa).unwrap();
        let _ = space.map_page(&mut alloc, &mut m, vpage(HIGH), pa);
    }
}
