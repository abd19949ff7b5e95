//! Multiboot (v1) header, entry point and boot information.
//!
//! GRUB or `qemu -kernel` loads the image at 1 MiB in protected mode with
//! paging off, `eax` = magic and `ebx` = physical address of the info block.
//! `_start` switches to a `.bss` stack and calls `kernel_main(magic, info)`.

use core::arch::global_asm;

use crate::memory::MemoryRegion;

pub const MULTIBOOT_BOOTLOADER_MAGIC: u32 = 0x2BAD_B002;

/// `flags` bit 0: `mem_lower`/`mem_upper` are valid.
const INFO_MEMORY: u32 = 1 << 0;

const BOOT_STACK_SIZE: usize = 16 * 1024;

global_asm!(
    ".section .multiboot, \"a\"",
    ".align 4",
    ".long 0x1BADB002",
    ".long 0x00000003",
    ".long -(0x1BADB002 + 0x00000003)",
    "",
    ".section .bss",
    ".align 16",
    "vos_boot_stack_bottom:",
    ".skip {stack_size}",
    "vos_boot_stack_top:",
    "",
    ".section .text",
    ".global _start",
    "_start:",
    "    mov esp, offset vos_boot_stack_top",
    "    xor ebp, ebp",
    "    push ebx",
    "    push eax",
    "    call kernel_main",
    "2:",
    "    cli",
    "    hlt",
    "    jmp 2b",
    stack_size = const BOOT_STACK_SIZE,
);

extern "C" {
    static __kernel_start: u8;
    static __kernel_end: u8;
}

/// Physical extent of the loaded image, `.bss` included.
pub fn kernel_image() -> MemoryRegion {
    // SAFETY: only the addresses of the linker symbols are taken.
    let (start, end) = unsafe {
        (
            core::ptr::addr_of!(__kernel_start) as u32,
            core::ptr::addr_of!(__kernel_end) as u32,
        )
    };
    MemoryRegion::new(start, end - start)
}

/// The fields of the multiboot information block this kernel uses.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct MultibootInfo {
    pub flags: u32,
    /// KiB of memory below 1 MiB.
    pub mem_lower: u32,
    /// KiB of memory above 1 MiB.
    pub mem_upper: u32,
}

impl MultibootInfo {
    /// # Safety
    /// `addr` must be the info pointer the bootloader passed in `ebx`.
    pub unsafe fn read(addr: u32) -> Self {
        core::ptr::read_volatile(addr as *const Self)
    }

    /// Usable RAM: conventional memory plus the contiguous block above 1 MiB.
    pub fn memory_regions(&self) -> [MemoryRegion; 2] {
        if self.flags & INFO_MEMORY == 0 {
            return [MemoryRegion::new(0, 0), MemoryRegion::new(0, 0)];
        }
        [
            MemoryRegion::new(0, self.mem_lower.saturating_mul(1024)),
            MemoryRegion::new(0x0010_0000, self.mem_upper.saturating_mul(1024)),
        ]
    }
}
