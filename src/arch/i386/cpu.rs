//! Control registers and privileged instructions.

use core::arch::asm;

use crate::arch::frame::EFLAGS_IF;
use crate::arch::gdt::{KERNEL_CODE_SELECTOR, KERNEL_DATA_SELECTOR};

/// CR0.PG
const CR0_PAGING: u32 = 1 << 31;

#[repr(C, packed)]
struct DescriptorPointer {
    limit: u16,
    base: u32,
}

#[inline]
pub fn eflags() -> u32 {
    let value: u32;
    // SAFETY: reading EFLAGS through the stack has no side effects.
    unsafe {
        asm!("pushfd", "pop {}", out(reg) value, options(preserves_flags));
    }
    value
}

#[inline]
pub fn interrupts_enabled() -> bool {
    eflags() & EFLAGS_IF != 0
}

/// # Safety
/// Callers must tolerate interrupt delivery from this point on.
#[inline]
pub unsafe fn sti() {
    asm!("sti", options(nomem, nostack));
}

#[inline]
pub fn cli() {
    // SAFETY: masking interrupts never breaks memory safety.
    unsafe { asm!("cli", options(nomem, nostack)) }
}

/// Enables interrupts and halts until the next one (`sti; hlt` is atomic).
#[inline]
pub fn wait_for_interrupt() {
    // SAFETY: the idle loop is the only caller and expects preemption.
    unsafe { asm!("sti", "hlt", options(nomem, nostack)) }
}

#[inline]
pub fn halt_forever() -> ! {
    loop {
        // SAFETY: halting with interrupts off only stops this CPU.
        unsafe { asm!("cli", "hlt", options(nomem, nostack)) }
    }
}

#[inline]
pub fn read_cr2() -> u32 {
    let value: u32;
    // SAFETY: CR2 is a read-only fault-address register.
    unsafe { asm!("mov {}, cr2", out(reg) value, options(nomem, nostack, preserves_flags)) }
    value
}

#[inline]
pub fn read_cr3() -> u32 {
    let value: u32;
    // SAFETY: reading CR3 has no side effects.
    unsafe { asm!("mov {}, cr3", out(reg) value, options(nomem, nostack, preserves_flags)) }
    value
}

/// Loads CR3 and turns paging on if it is still off.
///
/// # Safety
/// `root` must be a valid page directory that identity-maps the running kernel.
pub unsafe fn load_cr3(root: u32) {
    asm!("mov cr3, {}", in(reg) root, options(nostack, preserves_flags));
    let mut cr0: u32;
    asm!("mov {}, cr0", out(reg) cr0, options(nomem, nostack, preserves_flags));
    if cr0 & CR0_PAGING == 0 {
        cr0 |= CR0_PAGING;
        asm!("mov cr0, {}", in(reg) cr0, options(nostack, preserves_flags));
    }
}

/// # Safety
/// `base` must point at an IDT that outlives its use by the CPU.
pub unsafe fn lidt(base: u32, limit: u16) {
    let ptr = DescriptorPointer { limit, base };
    asm!("lidt [{}]", in(reg) &ptr, options(readonly, nostack, preserves_flags));
}

/// Loads a GDT, reloads every segment register and the task register.
///
/// # Safety
/// `gdt` must hold the layout of `arch::gdt::build_gdt` and stay alive forever.
pub unsafe fn load_gdt(gdt: &'static [u64], tss_selector: u16) {
    let ptr = DescriptorPointer {
        limit: (core::mem::size_of_val(gdt) - 1) as u16,
        base: gdt.as_ptr() as u32,
    };
    asm!(
        "lgdt [{ptr}]",
        "push {code}",
        "lea {tmp}, [2f]",
        "push {tmp}",
        "retf",
        "2:",
        "mov ds, {data:x}",
        "mov es, {data:x}",
        "mov fs, {data:x}",
        "mov gs, {data:x}",
        "mov ss, {data:x}",
        ptr = in(reg) &ptr,
        code = const KERNEL_CODE_SELECTOR as u32,
        data = in(reg) KERNEL_DATA_SELECTOR as u32,
        tmp = out(reg) _,
    );
    asm!("ltr {0:x}", in(reg) tss_selector as u32, options(nostack, preserves_flags));
}
