//! Global Descriptor Table image and 32-bit Task-State Segment.
//!
//! Layout of the GDT array:
//!   [0] null
//!   [1] kernel code  (0x08)
//!   [2] kernel data  (0x10)
//!   [3] user code    (0x1B with RPL 3)
//!   [4] user data    (0x23 with RPL 3)
//!   [5] TSS          (0x28)
//!
//! All code/data segments are flat 4 GiB. The TSS is only used for
//! `esp0`/`ss0` on ring 3 -> ring 0 transitions. Loading happens in
//! `arch::i386`; this module only builds the descriptor values.

use core::mem::size_of;

pub const GDT_ENTRY_COUNT: usize = 6;
const KERNEL_CODE_INDEX: u16 = 1;
const KERNEL_DATA_INDEX: u16 = 2;
const USER_CODE_INDEX: u16 = 3;
const USER_DATA_INDEX: u16 = 4;
const TSS_INDEX: u16 = 5;

const RPL_RING3: u16 = 0x3;

pub const KERNEL_CODE_SELECTOR: u16 = KERNEL_CODE_INDEX << 3;
pub const KERNEL_DATA_SELECTOR: u16 = KERNEL_DATA_INDEX << 3;
pub const USER_CODE_SELECTOR: u16 = (USER_CODE_INDEX << 3) | RPL_RING3;
pub const USER_DATA_SELECTOR: u16 = (USER_DATA_INDEX << 3) | RPL_RING3;
pub const TSS_SELECTOR: u16 = TSS_INDEX << 3;

// Access byte.
const ACCESS_PRESENT: u8 = 1 << 7;
const ACCESS_SEGMENT: u8 = 1 << 4;
const ACCESS_EXECUTABLE: u8 = 1 << 3;
const ACCESS_RW: u8 = 1 << 1;
const ACCESS_RING3: u8 = 0b11 << 5;
const ACCESS_TSS32_AVAILABLE: u8 = 0x9;

// Granularity nibble: G=1 (4 KiB units), D/B=1 (32-bit).
const FLAGS_GRANULAR_32: u8 = 0xC0;

/// 32-bit Task State Segment.
#[repr(C, packed)]
#[derive(Clone, Copy, Default)]
pub struct TaskStateSegment {
    pub prev_task: u32,
    pub esp0: u32,
    pub ss0: u32,
    pub esp1: u32,
    pub ss1: u32,
    pub esp2: u32,
    pub ss2: u32,
    pub cr3: u32,
    pub eip: u32,
    pub eflags: u32,
    pub eax: u32,
    pub ecx: u32,
    pub edx: u32,
    pub ebx: u32,
    pub esp: u32,
    pub ebp: u32,
    pub esi: u32,
    pub edi: u32,
    pub es: u32,
    pub cs: u32,
    pub ss: u32,
    pub ds: u32,
    pub fs: u32,
    pub gs: u32,
    pub ldt: u32,
    pub trap: u16,
    pub iomap_base: u16,
}

const _: () = {
    assert!(size_of::<TaskStateSegment>() == 104);
};

impl TaskStateSegment {
    /// TSS with `ss0` pointing at kernel data and the I/O bitmap disabled.
    pub fn new(esp0: u32) -> Self {
        Self {
            esp0,
            ss0: KERNEL_DATA_SELECTOR as u32,
            iomap_base: size_of::<TaskStateSegment>() as u16,
            ..Self::default()
        }
    }
}

/// Encodes a descriptor from base, 20-bit limit, access byte and flag nibble.
#[inline]
pub const fn build_descriptor(base: u32, limit: u32, access: u8, flags: u8) -> u64 {
    let mut d = 0u64;
    d |= (limit & 0xFFFF) as u64;
    d |= ((base & 0xFFFF) as u64) << 16;
    d |= (((base >> 16) & 0xFF) as u64) << 32;
    d |= (access as u64) << 40;
    d |= (((limit >> 16) & 0x0F) as u64) << 48;
    d |= ((flags & 0xF0) as u64) << 48;
    d |= (((base >> 24) & 0xFF) as u64) << 56;
    d
}

/// Builds the full GDT image for a TSS located at `tss_base`.
pub const fn build_gdt(tss_base: u32) -> [u64; GDT_ENTRY_COUNT] {
    let mut gdt = [0u64; GDT_ENTRY_COUNT];
    gdt[KERNEL_CODE_INDEX as usize] = build_descriptor(
        0,
        0xFFFFF,
        ACCESS_PRESENT | ACCESS_SEGMENT | ACCESS_EXECUTABLE | ACCESS_RW,
        FLAGS_GRANULAR_32,
    );
    gdt[KERNEL_DATA_INDEX as usize] = build_descriptor(
        0,
        0xFFFFF,
        ACCESS_PRESENT | ACCESS_SEGMENT | ACCESS_RW,
        FLAGS_GRANULAR_32,
    );
    gdt[USER_CODE_INDEX as usize] = build_descriptor(
        0,
        0xFFFFF,
        ACCESS_PRESENT | ACCESS_RING3 | ACCESS_SEGMENT | ACCESS_EXECUTABLE | ACCESS_RW,
        FLAGS_GRANULAR_32,
    );
    gdt[USER_DATA_INDEX as usize] = build_descriptor(
        0,
        0xFFFFF,
        ACCESS_PRESENT | ACCESS_RING3 | ACCESS_SEGMENT | ACCESS_RW,
        FLAGS_GRANULAR_32,
    );
    gdt[TSS_INDEX as usize] = build_descriptor(
        tss_base,
        (size_of::<TaskStateSegment>() - 1) as u32,
        ACCESS_PRESENT | ACCESS_TSS32_AVAILABLE,
        0,
    );
    gdt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selectors_match_boot_abi() {
        assert_eq!(KERNEL_CODE_SELECTOR, 0x08);
        assert_eq!(KERNEL_DATA_SELECTOR, 0x10);
        assert_eq!(USER_CODE_SELECTOR, 0x1B);
        assert_eq!(USER_DATA_SELECTOR, 0x23);
    }

    #[test]
    fn flat_kernel_code_descriptor_has_canonical_encoding() {
        let gdt = build_gdt(0);
        assert_eq!(gdt[0], 0);
        assert_eq!(gdt[1], 0x00CF_9A00_0000_FFFF);
        assert_eq!(gdt[2], 0x00CF_9200_0000_FFFF);
        assert_eq!(gdt[3], 0x00CF_FA00_0000_FFFF);
        assert_eq!(gdt[4], 0x00CF_F200_0000_FFFF);
    }
}
