//! Kernel heap.
//!
//! The arena is a static array in `.bss`, so it lies inside the identity
//! window and is reserved together with the kernel image. It must be ready
//! before the frame pool, whose bitmap is heap allocated.

use core::ptr::addr_of_mut;

use linked_list_allocator::LockedHeap;

/// Size of the kernel heap arena.
pub const HEAP_SIZE: usize = 4 * 1024 * 1024;

#[repr(C, align(4096))]
struct Arena([u8; HEAP_SIZE]);

static mut ARENA: Arena = Arena([0; HEAP_SIZE]);

#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

/// Hands the static arena to the allocator. Called once, first thing at boot.
pub fn init() {
    // SAFETY: `ARENA` is only ever touched here, and `init` runs once on the
    // boot CPU before any allocation. The arena is identity mapped and
    // writable for the whole lifetime of the kernel.
    unsafe {
        let start = addr_of_mut!(ARENA).cast::<u8>();
        ALLOCATOR.lock().init(start, HEAP_SIZE);
    }
}

/// Bytes currently handed out by the allocator.
pub fn used() -> usize {
    ALLOCATOR.lock().used()
}
