//! Interrupt Descriptor Table image.
//!
//! The table is built once at boot from a [`HandlerTable`] holding the
//! trampoline addresses. Every vector ends up either on the catch-all stub
//! or on one of the specialized stubs (CPU exceptions, the 16 PIC lines,
//! the `int 0x80` syscall gate). Later changes go through [`Idt::set_gate`].

use core::mem::size_of;

use bit_field::BitField;

use super::gdt::KERNEL_CODE_SELECTOR;

pub const IDT_ENTRIES: usize = 256;

/// Number of CPU exception vectors.
pub const EXCEPTION_COUNT: u32 = 32;

/// First vector of the remapped master PIC.
pub const IRQ_BASE: u32 = 0x20;

/// First vector of the remapped slave PIC.
pub const IRQ_SLAVE_BASE: u32 = IRQ_BASE + 8;

pub const IRQ_LINES: usize = 16;

pub const SYSCALL_VECTOR: u32 = 0x80;

pub const EXCEPTION_DIVIDE_ERROR: u32 = 0;
pub const EXCEPTION_BREAKPOINT: u32 = 3;
pub const EXCEPTION_INVALID_OPCODE: u32 = 6;
pub const EXCEPTION_DOUBLE_FAULT: u32 = 8;
pub const EXCEPTION_GENERAL_PROTECTION: u32 = 13;
pub const EXCEPTION_PAGE_FAULT: u32 = 14;

/// Present, DPL 0, 32-bit interrupt gate.
pub const GATE_KERNEL_INTERRUPT: u8 = 0x8E;

/// Present, DPL 3, 32-bit interrupt gate (reachable via `int` from ring 3).
pub const GATE_USER_INTERRUPT: u8 = 0xEE;

#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IdtEntry {
    offset_low: u16,
    selector: u16,
    zero: u8,
    type_attr: u8,
    offset_high: u16,
}

const _: () = {
    assert!(size_of::<IdtEntry>() == 8);
};

impl IdtEntry {
    pub const fn missing() -> Self {
        Self {
            offset_low: 0,
            selector: 0,
            zero: 0,
            type_attr: 0,
            offset_high: 0,
        }
    }

    pub fn new(handler: u32, selector: u16, type_attr: u8) -> Self {
        Self {
            offset_low: handler.get_bits(0..16) as u16,
            selector,
            zero: 0,
            type_attr,
            offset_high: handler.get_bits(16..32) as u16,
        }
    }

    pub fn handler(&self) -> u32 {
        let mut addr = 0u32;
        addr.set_bits(0..16, self.offset_low as u32);
        addr.set_bits(16..32, self.offset_high as u32);
        addr
    }

    pub fn type_attr(&self) -> u8 {
        self.type_attr
    }

    pub fn selector(&self) -> u16 {
        self.selector
    }

    /// Descriptor privilege level encoded in bits 5..7 of the type byte.
    pub fn dpl(&self) -> u8 {
        self.type_attr.get_bits(5..7)
    }

    pub fn present(&self) -> bool {
        self.type_attr.get_bit(7)
    }
}

/// Trampoline addresses the IDT is populated from.
#[derive(Clone, Copy, Debug)]
pub struct HandlerTable {
    pub exceptions: [u32; EXCEPTION_COUNT as usize],
    pub irqs: [u32; IRQ_LINES],
    pub syscall: u32,
    /// Catch-all for every vector without a specialized stub.
    pub default: u32,
}

#[repr(C, packed)]
pub struct IdtPointer {
    pub limit: u16,
    pub base: u32,
}

#[repr(C, align(8))]
pub struct Idt {
    entries: [IdtEntry; IDT_ENTRIES],
}

impl Idt {
    pub const fn empty() -> Self {
        Self {
            entries: [IdtEntry::missing(); IDT_ENTRIES],
        }
    }

    /// Builds the boot-time table from the trampoline addresses.
    pub fn from_handlers(handlers: &HandlerTable) -> Self {
        let mut idt = Self::empty();
        for vector in 0..IDT_ENTRIES as u32 {
            idt.set_gate(vector, handlers.default, GATE_KERNEL_INTERRUPT);
        }
        for (vector, &addr) in handlers.exceptions.iter().enumerate() {
            idt.set_gate(vector as u32, addr, GATE_KERNEL_INTERRUPT);
        }
        for (line, &addr) in handlers.irqs.iter().enumerate() {
            idt.set_gate(IRQ_BASE + line as u32, addr, GATE_KERNEL_INTERRUPT);
        }
        idt.set_gate(SYSCALL_VECTOR, handlers.syscall, GATE_USER_INTERRUPT);
        idt
    }

    /// Points `vector` at `handler` through the kernel code segment.
    pub fn set_gate(&mut self, vector: u32, handler: u32, type_attr: u8) {
        if let Some(entry) = self.entries.get_mut(vector as usize) {
            *entry = IdtEntry::new(handler, KERNEL_CODE_SELECTOR, type_attr);
        }
    }

    pub fn entry(&self, vector: u32) -> Option<&IdtEntry> {
        self.entries.get(vector as usize)
    }

    pub fn pointer(&self) -> IdtPointer {
        IdtPointer {
            limit: (size_of::<IdtEntry>() * IDT_ENTRIES - 1) as u16,
            base: self.entries.as_ptr() as usize as u32,
        }
    }
}

/// Returns whether the CPU pushes an error code for `vector`.
pub const fn exception_has_error_code(vector: u32) -> bool {
    matches!(vector, 8 | 10 | 11 | 12 | 13 | 14 | 17 | 21 | 29 | 30)
}
