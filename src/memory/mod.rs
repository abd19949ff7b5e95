//! Physical frame pool, paging and (on hardware) the kernel heap.

pub mod pmm;
pub mod vmm;

#[cfg(all(target_arch = "x86", target_os = "none"))]
pub mod heap;

pub use pmm::{Frame, FrameAllocator};
pub use vmm::{GuardedStack, MapError, PageDirectory, PageFaultCode, PageFlags};

/// A usable RAM range reported by the bootloader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    pub base: u32,
    pub len: u32,
}

impl MemoryRegion {
    pub const fn new(base: u32, len: u32) -> Self {
        Self { base, len }
    }
}
