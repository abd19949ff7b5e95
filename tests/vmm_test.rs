//! Paging integration tests: kernel identity window, per-task directories,
//! guarded stacks and teardown.

use vos_kernel::arch::{PhysAddr, PhysicalMemory, PAGE_SIZE};
use vos_kernel::memory::vmm::{
    PageDirectory, PageFlags, KERNEL_IDENTITY_END, USER_BASE, USER_LIMIT, USER_STACK_TOP,
};
use vos_kernel::memory::{FrameAllocator, MapError};
use vos_kernel::testing::MockMachine;

const RAM: u32 = 8 << 20;

fn setup() -> (MockMachine, FrameAllocator, PageDirectory) {
    let mut machine = MockMachine::new(RAM as usize);
    let mut pmm = FrameAllocator::new(PhysAddr(RAM));
    pmm.add_region(PhysAddr(0x0010_0000), RAM - 0x0010_0000);
    let kernel = PageDirectory::new_kernel(&mut machine, &mut pmm, KERNEL_IDENTITY_END)
        .expect("kernel directory");
    (machine, pmm, kernel)
}

/// Contract: the kernel directory identity-maps the window, supervisor only.
/// Given: A freshly built kernel directory.
/// When: Addresses inside and outside the window are translated.
/// Then: Inside maps to itself without the USER bit; user space is unmapped.
/// Failure Impact: Kernel code faults after CR3 loads, or user code reaches kernel memory.
#[test]
fn test_kernel_identity_window() {
    let (machine, _pmm, kernel) = setup();
    let (pa, flags) = kernel.translate(&machine, 0x0012_3456).expect("identity mapped");
    assert_eq!(pa, PhysAddr(0x0012_3456));
    assert!(flags.contains(PageFlags::WRITABLE));
    assert!(!flags.contains(PageFlags::USER));
    assert!(kernel.translate(&machine, KERNEL_IDENTITY_END - 1).is_some());
    assert!(kernel.translate(&machine, USER_BASE).is_none());
    assert!(!kernel.is_user_accessible(&machine, 0x0012_3000, false));
}

/// Contract: a user directory shares kernel mappings and nothing else.
/// Given: A user directory created from the kernel directory.
/// When: A user page is mapped in it.
/// Then: The kernel window resolves identically, the page is visible only in the user directory.
/// Failure Impact: Traps after a CR3 switch would run on unmapped kernel code.
#[test]
fn test_user_directory_shares_kernel_half() {
    let (mut machine, mut pmm, kernel) = setup();
    let mut user = PageDirectory::new_user(&kernel, &mut machine, &mut pmm).expect("user dir");
    assert_eq!(
        user.translate(&machine, 0x0010_0000).map(|(pa, _)| pa),
        Some(PhysAddr(0x0010_0000))
    );

    user.map_zeroed(&mut machine, &mut pmm, USER_BASE, PageFlags::USER_RW)
        .expect("map");
    assert!(user.is_user_accessible(&machine, USER_BASE + 10, true));
    assert!(kernel.translate(&machine, USER_BASE).is_none());
    assert_eq!(user.owned_pages(), 1);
}

/// Contract: user directories reject kernel addresses and double mappings.
/// Given: A user directory with one mapped page.
/// When: The same page or a kernel address is mapped again.
/// Then: AlreadyMapped and KernelRange are reported without side effects.
/// Failure Impact: A task could alias kernel memory into its address space.
#[test]
fn test_mapping_errors() {
    let (mut machine, mut pmm, kernel) = setup();
    let mut user = PageDirectory::new_user(&kernel, &mut machine, &mut pmm).expect("user dir");
    user.map_zeroed(&mut machine, &mut pmm, USER_BASE, PageFlags::USER_RW)
        .expect("map");
    let free = pmm.free_frames();

    assert_eq!(
        user.map_zeroed(&mut machine, &mut pmm, USER_BASE, PageFlags::USER_RW),
        Err(MapError::AlreadyMapped { virtual_address: USER_BASE })
    );
    assert_eq!(
        user.map_zeroed(&mut machine, &mut pmm, 0x0010_0000, PageFlags::USER_RW),
        Err(MapError::KernelRange { virtual_address: 0x0010_0000 })
    );
    assert_eq!(pmm.free_frames(), free, "failed maps must not leak frames");
}

/// Contract: read-only pages are readable but not writable from ring 3.
/// Given: A page mapped USER_RO.
/// When: Accessibility is checked for read and write.
/// Then: Read is allowed, write is refused.
/// Failure Impact: Tasks could overwrite their own code through syscalls.
#[test]
fn test_read_only_pages() {
    let (mut machine, mut pmm, kernel) = setup();
    let mut user = PageDirectory::new_user(&kernel, &mut machine, &mut pmm).expect("user dir");
    user.map_zeroed(&mut machine, &mut pmm, USER_BASE, PageFlags::USER_RO)
        .expect("map");
    assert!(user.is_user_accessible(&machine, USER_BASE, false));
    assert!(!user.is_user_accessible(&machine, USER_BASE, true));
}

/// Contract: range checks cover every touched page.
/// Given: One mapped page followed by an unmapped one.
/// When: A range straddling the boundary is checked.
/// Then: It is refused, while a range ending exactly at the boundary passes.
/// Failure Impact: Syscalls would copy past the end of a valid buffer.
#[test]
fn test_range_check_straddling_pages() {
    let (mut machine, mut pmm, kernel) = setup();
    let mut user = PageDirectory::new_user(&kernel, &mut machine, &mut pmm).expect("user dir");
    user.map_zeroed(&mut machine, &mut pmm, USER_BASE, PageFlags::USER_RW)
        .expect("map");
    let end = USER_BASE + PAGE_SIZE;
    assert!(user.is_user_range_accessible(&machine, end - 16, 16, true));
    assert!(!user.is_user_range_accessible(&machine, end - 16, 17, true));
    assert!(!user.is_user_range_accessible(&machine, USER_LIMIT - 4, 8, false));
    assert!(user.is_user_range_accessible(&machine, USER_BASE, 0, true));
}

/// Contract: guarded stacks leave one unmapped page below the stack.
/// Given: A four-page stack under USER_STACK_TOP.
/// When: The guard and stack pages are inspected.
/// Then: The stack is writable, the guard is unmapped, recorded, and cannot be mapped.
/// Failure Impact: Stack overflow silently corrupts the heap instead of faulting.
#[test]
fn test_guarded_stack() {
    let (mut machine, mut pmm, kernel) = setup();
    let mut user = PageDirectory::new_user(&kernel, &mut machine, &mut pmm).expect("user dir");
    let stack = user
        .map_guarded_stack(&mut machine, &mut pmm, USER_STACK_TOP, 4)
        .expect("stack");
    assert_eq!(stack.top, USER_STACK_TOP);
    assert_eq!(stack.bottom, USER_STACK_TOP - 4 * PAGE_SIZE);
    assert_eq!(stack.guard, stack.bottom - PAGE_SIZE);

    assert!(user.is_user_range_accessible(&machine, stack.bottom, 4 * PAGE_SIZE, true));
    assert!(user.translate(&machine, stack.guard).is_none());
    assert!(user.is_guard_page(stack.guard + 12));
    assert_eq!(
        user.map_zeroed(&mut machine, &mut pmm, stack.guard, PageFlags::USER_RW),
        Err(MapError::GuardPage { virtual_address: stack.guard })
    );
}

/// Contract: destroying a directory returns every frame it owns.
/// Given: A user directory with pages, tables and a stack.
/// When: It is destroyed.
/// Then: The pool's free count matches the count before the directory existed.
/// Failure Impact: Every exited task leaks frames.
#[test]
fn test_destroy_releases_everything() {
    let (mut machine, mut pmm, kernel) = setup();
    let before = pmm.free_frames();
    let mut user = PageDirectory::new_user(&kernel, &mut machine, &mut pmm).expect("user dir");
    user.map_zeroed(&mut machine, &mut pmm, USER_BASE, PageFlags::USER_RW)
        .expect("map");
    user.map_zeroed(&mut machine, &mut pmm, USER_BASE + 0x0040_0000, PageFlags::USER_RW)
        .expect("map in second table");
    user.map_guarded_stack(&mut machine, &mut pmm, USER_STACK_TOP, 2)
        .expect("stack");
    assert!(pmm.free_frames() < before);

    user.destroy(&mut pmm);
    assert_eq!(pmm.free_frames(), before);
}

/// Contract: unmapping releases owned frames and makes the page inaccessible.
/// Given: A mapped user page containing data.
/// When: It is unmapped, then unmapped again.
/// Then: The frame returns to the pool and the second unmap reports NotMapped.
/// Failure Impact: Heap shrinking would leak frames or leave stale mappings.
#[test]
fn test_unmap() {
    let (mut machine, mut pmm, kernel) = setup();
    let mut user = PageDirectory::new_user(&kernel, &mut machine, &mut pmm).expect("user dir");
    let pa = user
        .map_zeroed(&mut machine, &mut pmm, USER_BASE, PageFlags::USER_RW)
        .expect("map");
    user.write_bytes(&mut machine, USER_BASE, b"data").expect("write");
    assert_eq!(machine.read_u32(pa), u32::from_le_bytes(*b"data"));

    let free = pmm.free_frames();
    user.unmap(&mut machine, &mut pmm, USER_BASE).expect("unmap");
    assert_eq!(pmm.free_frames(), free + 1);
    assert!(user.translate(&machine, USER_BASE).is_none());
    assert_eq!(
        user.unmap(&mut machine, &mut pmm, USER_BASE),
        Err(MapError::NotMapped { virtual_address: USER_BASE })
    );
}

/// Removes frames from `pmm` until only `keep` are free.
fn leave_free(pmm: &mut FrameAllocator, keep: u32) -> Vec<vos_kernel::memory::Frame> {
    let mut taken = Vec::new();
    while pmm.free_frames() > keep {
        taken.push(pmm.allocate().expect("frame"));
    }
    taken
}

/// Contract: a guarded stack is mapped completely or not at all.
/// Given: A fresh user directory and a pool with room for a page table and four pages.
/// When: An eight-page stack is requested.
/// Then: OutOfFrames is returned, every frame comes back, and no page, table or guard is left behind.
/// Failure Impact: Each failed spawn under memory pressure would leak frames and leave half a stack.
#[test]
fn test_guarded_stack_out_of_frames_rolls_back() {
    let (mut machine, mut pmm, kernel) = setup();
    let mut user = PageDirectory::new_user(&kernel, &mut machine, &mut pmm).expect("user dir");
    let tables = user.owned_tables();
    let hoard = leave_free(&mut pmm, 5);

    assert_eq!(
        user.map_guarded_stack(&mut machine, &mut pmm, USER_STACK_TOP, 8),
        Err(MapError::OutOfFrames)
    );
    assert_eq!(pmm.free_frames(), 5);
    assert_eq!(user.owned_pages(), 0);
    assert_eq!(user.owned_tables(), tables);
    assert!(user.translate(&machine, USER_STACK_TOP - PAGE_SIZE).is_none());
    assert!(!user.is_guard_page(USER_STACK_TOP - 9 * PAGE_SIZE));

    pmm.release_all(hoard);
    let stack = user
        .map_guarded_stack(&mut machine, &mut pmm, USER_STACK_TOP, 8)
        .expect("stack once frames are back");
    assert_eq!(stack.bottom, USER_STACK_TOP - 8 * PAGE_SIZE);
}

/// Contract: a range crossing into a new page table rolls back both tables on exhaustion.
/// Given: A range of four pages straddling a 4 MiB boundary and frames for only two tables and two pages.
/// When: The range is mapped.
/// Then: OutOfFrames is returned and the pool, pages and tables are as before.
/// Failure Impact: Heap growth under memory pressure would strand page tables.
#[test]
fn test_zeroed_range_out_of_frames_rolls_back_tables() {
    let (mut machine, mut pmm, kernel) = setup();
    let mut user = PageDirectory::new_user(&kernel, &mut machine, &mut pmm).expect("user dir");
    let tables = user.owned_tables();
    let boundary = USER_BASE + 0x0040_0000;
    let _hoard = leave_free(&mut pmm, 4);

    assert_eq!(
        user.map_zeroed_range(
            &mut machine,
            &mut pmm,
            boundary - 2 * PAGE_SIZE,
            boundary + 2 * PAGE_SIZE,
            PageFlags::USER_RW
        ),
        Err(MapError::OutOfFrames)
    );
    assert_eq!(pmm.free_frames(), 4);
    assert_eq!(user.owned_pages(), 0);
    assert_eq!(user.owned_tables(), tables);
    assert!(user.translate(&machine, boundary - PAGE_SIZE).is_none());
}
