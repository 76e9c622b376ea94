use kernel_memory_addresses::{PhysicalPage, Size4K};

/// A run of physically contiguous 4 KiB frames.
///
/// A mapping call takes a slice of these and consumes them in order, so a
/// virtually contiguous region can be backed by scattered physical memory.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PaRange {
    pub base: PhysicalPage<Size4K>,
    pub pages: u64,
}

impl PaRange {
    #[must_use]
    pub const fn new(base: PhysicalPage<Size4K>, pages: u64) -> Self {
        Self { base, pages }
    }

    /// A single frame.
    #[must_use]
    pub const fn single(frame: PhysicalPage<Size4K>) -> Self {
        Self::new(frame, 1)
    }

    /// Total pages over a list.
    #[must_use]
    pub fn total(list: &[Self]) -> u64 {
        list.iter().map(|r| r.pages).sum()
    }
}

/// Yields the frames of a [`PaRange`] list in order.
pub(crate) struct PaCursor<'a> {
    list: &'a [PaRange],
    range: usize,
    page: u64,
}

impl<'a> PaCursor<'a> {
    pub(crate) const fn new(list: &'a [PaRange]) -> Self {
        Self {
            list,
            range: 0,
            page: 0,
        }
    }
}

impl Iterator for PaCursor<'_> {
    type Item = PhysicalPage<Size4K>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let r = self.list.get(self.range)?;
            if self.page < r.pages {
                let frame = r.base.add(self.page);
                self.page += 1;
                return Some(frame);
            }
            self.range += 1;
            self.page = 0;
        }
    }
}
