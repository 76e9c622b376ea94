use core::cell::UnsafeCell;
use kernel_alloc::BootstrapPool;
use kernel_info::memory::BOOTSTRAP_FRAME_CAP;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage};

const FRAME: usize = 4096;

/// Statically reserved frames that build the first page tables.
///
/// Lives in the kernel image, so its frames are never managed by the free
/// list and stay identity mapped in the final address space.
#[repr(C, align(4096))]
pub struct BootstrapFrames(UnsafeCell<[[u8; FRAME]; BOOTSTRAP_FRAME_CAP]>);

// SAFETY: the frames are handed out once, as physical pages, by the single
// boot context.
unsafe impl Sync for BootstrapFrames {}

impl BootstrapFrames {
    #[must_use]
    pub const fn new() -> Self {
        Self(UnsafeCell::new([[0; FRAME]; BOOTSTRAP_FRAME_CAP]))
    }

    /// The frames as a pool, assuming the image is loaded at its link address.
    #[must_use]
    pub fn pool(&'static self) -> BootstrapPool {
        let base = PhysicalAddress::from_ptr(self.0.get());
        BootstrapPool::new(PhysicalPage::from_aligned(base), BOOTSTRAP_FRAME_CAP as u64)
    }
}

impl Default for BootstrapFrames {
    fn default() -> Self {
        Self::new()
    }
}

/// Page-table frames for the memory bootstrap.
#[cfg_attr(target_os = "none", unsafe(link_section = ".bss.boot"))]
pub static BOOTSTRAP_FRAMES: BootstrapFrames = BootstrapFrames::new();

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::{align_of, size_of};

    #[test]
    fn pool_spans_the_whole_reservation() {
        assert_eq!(align_of::<BootstrapFrames>(), 4096);
        assert_eq!(size_of::<BootstrapFrames>(), BOOTSTRAP_FRAME_CAP * 4096);

        let pool = BOOTSTRAP_FRAMES.pool();
        assert_eq!(pool.frames, BOOTSTRAP_FRAME_CAP as u64);
        assert_eq!(pool.range().len(), BOOTSTRAP_FRAME_CAP as u64 * 4096);
    }
}
