//! Physical frame pool integration tests.
//!
//! Exercises allocation, release and reservation on a pool shaped like the
//! boot pool: RAM from 0, low memory and a kernel image reserved.

use std::collections::BTreeSet;

use vos_kernel::arch::{PhysAddr, PAGE_SIZE};
use vos_kernel::memory::pmm::LOW_MEMORY_END;
use vos_kernel::memory::FrameAllocator;
use vos_kernel::testing::{self, TEST_IMAGE};
use vos_kernel::KernelConfig;

const RAM: u32 = 4 << 20;

fn boot_like_pool() -> FrameAllocator {
    let mut pmm = FrameAllocator::new(PhysAddr(RAM));
    pmm.add_region(PhysAddr(0), RAM);
    pmm.reserve_region(PhysAddr(0), LOW_MEMORY_END);
    pmm.reserve_region(PhysAddr(TEST_IMAGE.base), TEST_IMAGE.len);
    pmm
}

/// Contract: frames handed out are unique, page aligned and outside reserved ranges.
/// Given: A pool over 4 MiB with low memory and a 1 MiB image reserved.
/// When: Every free frame is allocated.
/// Then: No frame repeats, none lies below 2 MiB, and the pool reports zero free.
/// Failure Impact: Two owners of one frame corrupt page tables or kernel stacks.
#[test]
fn test_frames_are_unique_and_outside_reserved_ranges() {
    let mut pmm = boot_like_pool();
    let expected = (RAM - 2 * LOW_MEMORY_END) / PAGE_SIZE;
    assert_eq!(pmm.free_frames(), expected);

    let mut seen = BTreeSet::new();
    let mut frames = Vec::new();
    while let Some(frame) = pmm.allocate() {
        let addr = frame.start_address();
        assert!(addr.is_page_aligned());
        assert!(addr.as_u32() >= TEST_IMAGE.base + TEST_IMAGE.len, "reserved frame {:?}", frame);
        assert!(seen.insert(frame.number()), "frame {:?} handed out twice", frame);
        frames.push(frame);
    }
    assert_eq!(frames.len() as u32, expected);
    assert_eq!(pmm.free_frames(), 0);
    assert!(pmm.allocate().is_none());
}

/// Contract: a released frame is available again.
/// Given: A pool with one frame allocated.
/// When: The frame is released.
/// Then: The free count is restored and the next allocation may return it.
/// Failure Impact: Exiting tasks leak memory until the kernel runs out.
#[test]
fn test_release_returns_frame_to_pool() {
    let mut pmm = boot_like_pool();
    let before = pmm.free_frames();
    let frame = pmm.allocate().expect("frame");
    let number = frame.number();
    assert!(pmm.is_allocated(number));

    pmm.release(frame);
    assert_eq!(pmm.free_frames(), before);
    assert!(!pmm.is_allocated(number));
    assert_eq!(pmm.allocate().expect("frame again").number(), number);
}

/// Contract: contiguous runs are physically adjacent and skip allocated frames.
/// Given: A pool whose first free frame is already taken.
/// When: Four contiguous frames are requested.
/// Then: The run is adjacent and does not include the taken frame.
/// Failure Impact: Kernel stacks spanning non-adjacent frames overwrite foreign memory.
#[test]
fn test_contiguous_allocation_is_adjacent() {
    let mut pmm = boot_like_pool();
    let first = pmm.allocate().expect("frame");

    let run = pmm.allocate_contiguous(4).expect("run");
    assert_eq!(run.len(), 4);
    for pair in run.windows(2) {
        assert_eq!(pair[1].number(), pair[0].number() + 1);
    }
    assert!(run.iter().all(|f| f.number() != first.number()));

    assert!(pmm.allocate_contiguous(0).is_none());
    assert!(pmm.allocate_contiguous(pmm.free_frames() as usize + 1).is_none());
}

/// Contract: boot reserves low memory and the kernel image.
/// Given: A kernel booted on 16 MiB of mock RAM.
/// When: The frame pool is inspected.
/// Then: Every frame below the end of the image is allocated and RAM above it is tracked.
/// Failure Impact: The allocator could hand out the running kernel's own pages.
#[test]
fn test_boot_reserves_low_memory_and_image() {
    let kernel = testing::boot(KernelConfig::default());
    let pmm = kernel.frame_allocator();
    let image_end = (TEST_IMAGE.base + TEST_IMAGE.len) / PAGE_SIZE;
    for number in 0..image_end {
        assert!(pmm.is_allocated(number), "frame {} should be reserved", number);
    }
    assert_eq!(pmm.total_frames(), testing::TEST_RAM / PAGE_SIZE);
    assert!(pmm.free_frames() > 0);
}
