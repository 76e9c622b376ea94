use crate::PhysMapper;
use kernel_memory_addresses::{PhysicalPage, Size4K};

/// Accesses frames through their physical address.
///
/// Valid while the frames in question are identity mapped: before paging is
/// rebuilt, and for the kernel image afterwards.
#[derive(Debug, Default, Copy, Clone)]
pub struct IdentityMapper;

impl PhysMapper for IdentityMapper {
    unsafe fn with_frame<T, R>(
        &mut self,
        frame: PhysicalPage<Size4K>,
        f: impl FnOnce(&mut T) -> R,
    ) -> R {
        let ptr = frame.as_identity_ptr::<T>();
        debug_assert!(ptr.is_aligned());
        // SAFETY: the caller guarantees the frame is identity mapped, holds a
        // valid `T` and is not otherwise borrowed.
        f(unsafe { &mut *ptr })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestPhys;

    #[test]
    fn identity_access_reaches_the_frame() {
        let phys = TestPhys::with_frames(2);
        let frame = phys.frame(1);
        let mut m = IdentityMapper;
        unsafe { m.with_frame::<u64, _>(frame, |v| *v = 0xdead_beef) };
        let read = unsafe { m.with_frame::<u64, _>(frame, |v| *v) };
        assert_eq!(read, 0xdead_beef);
        assert!(m.with_table(phys.frame(0), |t| t.is_zero()));
    }
}
