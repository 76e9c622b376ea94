use kernel_alloc::{FrameAllocatorError, HeapError};
use kernel_info::boot::BootInfoError;
use kernel_info::memory::LayoutError;
use kernel_vmem::MapError;

/// Everything the memory subsystem can report instead of panicking.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MemoryError {
    #[error(transparent)]
    Boot(#[from] BootInfoError),
    #[error(transparent)]
    Layout(#[from] LayoutError),
    #[error(transparent)]
    Frames(#[from] FrameAllocatorError),
    #[error(transparent)]
    Map(#[from] MapError),
    #[error(transparent)]
    Heap(#[from] HeapError),
    #[error("frame buffer of {0} bytes does not fit its virtual window")]
    FrameBufferTooLarge(u64),
    #[error("out of physical frames")]
    OutOfFrames,
}
