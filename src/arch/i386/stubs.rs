//! Trap trampolines.
//!
//! Every vector gets a tiny stub that normalises the stack (dummy error code
//! where the CPU pushes none, then the vector number) and jumps to
//! `vos_trap_common`. The common path builds a [`TrapFrame`] in place:
//!
//! ```text
//!   higher   ss, useresp        (ring 3 only, pushed by the CPU)
//!            eflags, cs, eip    (CPU)
//!            err_code, int_no   (stub)
//!            eax .. edi         (pushad)
//!   lower    ds, es, fs, gs     (common path)
//! ```
//!
//! `vos_trap_entry` receives a pointer to that frame and returns the
//! address of the frame to resume, which may sit on another task's kernel
//! stack. The common path switches `esp` there and unwinds it with
//! `iretd`.
//!
//! [`TrapFrame`]: crate::arch::TrapFrame

use core::arch::global_asm;

use crate::arch::gdt::KERNEL_DATA_SELECTOR;
use crate::arch::idt::HandlerTable;

global_asm!(
    ".section .text",
    ".global vos_trap_common",
    "vos_trap_common:",
    "    pushad",
    "    push ds",
    "    push es",
    "    push fs",
    "    push gs",
    "    mov ax, {data}",
    "    mov ds, ax",
    "    mov es, ax",
    "    mov fs, ax",
    "    mov gs, ax",
    "    cld",
    "    push esp",
    "    call vos_trap_entry",
    "    mov esp, eax",
    "    pop gs",
    "    pop fs",
    "    pop es",
    "    pop ds",
    "    popad",
    "    add esp, 8",
    "    iretd",
    data = const KERNEL_DATA_SELECTOR,
);

macro_rules! stub {
    ($name:ident, $vector:expr, error_code) => {
        global_asm!(
            concat!(
                ".section .text\n",
                ".global ", stringify!($name), "\n",
                stringify!($name), ":\n",
                "    push {vector}\n",
                "    jmp vos_trap_common\n",
            ),
            vector = const $vector,
        );
    };
    ($name:ident, $vector:expr) => {
        global_asm!(
            concat!(
                ".section .text\n",
                ".global ", stringify!($name), "\n",
                stringify!($name), ":\n",
                "    push 0\n",
                "    push {vector}\n",
                "    jmp vos_trap_common\n",
            ),
            vector = const $vector,
        );
    };
}

stub!(vos_isr0, 0);
stub!(vos_isr1, 1);
stub!(vos_isr2, 2);
stub!(vos_isr3, 3);
stub!(vos_isr4, 4);
stub!(vos_isr5, 5);
stub!(vos_isr6, 6);
stub!(vos_isr7, 7);
stub!(vos_isr8, 8, error_code);
stub!(vos_isr9, 9);
stub!(vos_isr10, 10, error_code);
stub!(vos_isr11, 11, error_code);
stub!(vos_isr12, 12, error_code);
stub!(vos_isr13, 13, error_code);
stub!(vos_isr14, 14, error_code);
stub!(vos_isr15, 15);
stub!(vos_isr16, 16);
stub!(vos_isr17, 17, error_code);
stub!(vos_isr18, 18);
stub!(vos_isr19, 19);
stub!(vos_isr20, 20);
stub!(vos_isr21, 21, error_code);
stub!(vos_isr22, 22);
stub!(vos_isr23, 23);
stub!(vos_isr24, 24);
stub!(vos_isr25, 25);
stub!(vos_isr26, 26);
stub!(vos_isr27, 27);
stub!(vos_isr28, 28);
stub!(vos_isr29, 29, error_code);
stub!(vos_isr30, 30, error_code);
stub!(vos_isr31, 31);

stub!(vos_irq0, 32);
stub!(vos_irq1, 33);
stub!(vos_irq2, 34);
stub!(vos_irq3, 35);
stub!(vos_irq4, 36);
stub!(vos_irq5, 37);
stub!(vos_irq6, 38);
stub!(vos_irq7, 39);
stub!(vos_irq8, 40);
stub!(vos_irq9, 41);
stub!(vos_irq10, 42);
stub!(vos_irq11, 43);
stub!(vos_irq12, 44);
stub!(vos_irq13, 45);
stub!(vos_irq14, 46);
stub!(vos_irq15, 47);

stub!(vos_isr_syscall, 0x80);
// Vectors without a dedicated stub report themselves as 0xFF.
stub!(vos_isr_default, 0xFF);

extern "C" {
    fn vos_isr0();
    fn vos_isr1();
    fn vos_isr2();
    fn vos_isr3();
    fn vos_isr4();
    fn vos_isr5();
    fn vos_isr6();
    fn vos_isr7();
    fn vos_isr8();
    fn vos_isr9();
    fn vos_isr10();
    fn vos_isr11();
    fn vos_isr12();
    fn vos_isr13();
    fn vos_isr14();
    fn vos_isr15();
    fn vos_isr16();
    fn vos_isr17();
    fn vos_isr18();
    fn vos_isr19();
    fn vos_isr20();
    fn vos_isr21();
    fn vos_isr22();
    fn vos_isr23();
    fn vos_isr24();
    fn vos_isr25();
    fn vos_isr26();
    fn vos_isr27();
    fn vos_isr28();
    fn vos_isr29();
    fn vos_isr30();
    fn vos_isr31();
    fn vos_irq0();
    fn vos_irq1();
    fn vos_irq2();
    fn vos_irq3();
    fn vos_irq4();
    fn vos_irq5();
    fn vos_irq6();
    fn vos_irq7();
    fn vos_irq8();
    fn vos_irq9();
    fn vos_irq10();
    fn vos_irq11();
    fn vos_irq12();
    fn vos_irq13();
    fn vos_irq14();
    fn vos_irq15();
    fn vos_isr_syscall();
    fn vos_isr_default();
}

/// Addresses of the trampolines above, in IDT order.
pub fn handler_table() -> HandlerTable {
    let exceptions: [unsafe extern "C" fn(); 32] = [
        vos_isr0, vos_isr1, vos_isr2, vos_isr3, vos_isr4, vos_isr5, vos_isr6, vos_isr7, vos_isr8,
        vos_isr9, vos_isr10, vos_isr11, vos_isr12, vos_isr13, vos_isr14, vos_isr15, vos_isr16,
        vos_isr17, vos_isr18, vos_isr19, vos_isr20, vos_isr21, vos_isr22, vos_isr23, vos_isr24,
        vos_isr25, vos_isr26, vos_isr27, vos_isr28, vos_isr29, vos_isr30, vos_isr31,
    ];
    let irqs: [unsafe extern "C" fn(); 16] = [
        vos_irq0, vos_irq1, vos_irq2, vos_irq3, vos_irq4, vos_irq5, vos_irq6, vos_irq7, vos_irq8,
        vos_irq9, vos_irq10, vos_irq11, vos_irq12, vos_irq13, vos_irq14, vos_irq15,
    ];
    HandlerTable {
        exceptions: exceptions.map(|f| f as usize as u32),
        irqs: irqs.map(|f| f as usize as u32),
        syscall: vos_isr_syscall as usize as u32,
        default: vos_isr_default as usize as u32,
    }
}
