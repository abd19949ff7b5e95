//! The real [`Machine`]: one i386 CPU with legacy PC devices.

pub mod boot;
pub mod cpu;
pub mod port;
pub mod serial;
pub mod stubs;
pub mod vga;

use alloc::boxed::Box;

use super::gdt::{build_gdt, TaskStateSegment, GDT_ENTRY_COUNT, TSS_SELECTOR};
use super::idt::Idt;
use super::{Machine, PhysAddr, PhysicalMemory, PortIo};

use serial::Serial;
use vga::VgaText;

pub struct I386Machine {
    vga: VgaText,
    serial: Serial,
    /// `None` on the panic path, which must not touch descriptor tables.
    tss: Option<&'static mut TaskStateSegment>,
}

impl I386Machine {
    /// Installs the GDT and TSS and brings up both output devices.
    ///
    /// Needs the heap: the descriptor tables are leaked boxes.
    pub fn init() -> Self {
        let serial = Serial::com1();
        serial.init();
        let mut vga = VgaText::new();
        vga.clear();

        let tss: &'static mut TaskStateSegment = Box::leak(Box::new(TaskStateSegment::new(0)));
        let gdt: &'static [u64; GDT_ENTRY_COUNT] =
            Box::leak(Box::new(build_gdt(tss as *const TaskStateSegment as u32)));
        // SAFETY: the GDT was built by `build_gdt` and is leaked, so it lives
        // as long as the CPU uses it. The TSS descriptor points at `tss`.
        unsafe { cpu::load_gdt(gdt, TSS_SELECTOR) };

        Self {
            vga,
            serial,
            tss: Some(tss),
        }
    }

    /// Output-only handle for the panic handler. Leaves GDT, TSS and the
    /// serial configuration as they are.
    pub fn detached() -> Self {
        Self {
            vga: VgaText::new(),
            serial: Serial::com1(),
            tss: None,
        }
    }
}

impl PhysicalMemory for I386Machine {
    fn read(&self, addr: PhysAddr, buf: &mut [u8]) {
        // SAFETY: callers pass frames inside the kernel identity window,
        // which is mapped in every directory.
        unsafe {
            core::ptr::copy_nonoverlapping(addr.as_u32() as *const u8, buf.as_mut_ptr(), buf.len());
        }
    }

    fn write(&mut self, addr: PhysAddr, data: &[u8]) {
        // SAFETY: as in `read`; frames are owned by the caller.
        unsafe {
            core::ptr::copy_nonoverlapping(data.as_ptr(), addr.as_u32() as *mut u8, data.len());
        }
    }

    fn zero(&mut self, addr: PhysAddr, len: usize) {
        // SAFETY: as in `write`.
        unsafe { core::ptr::write_bytes(addr.as_u32() as *mut u8, 0, len) }
    }
}

impl PortIo for I386Machine {
    fn inb(&mut self, port: u16) -> u8 {
        // SAFETY: the kernel owns every legacy port it programs.
        unsafe { port::inb(port) }
    }

    fn outb(&mut self, port: u16, value: u8) {
        // SAFETY: as in `inb`.
        unsafe { port::outb(port, value) }
    }
}

impl Machine for I386Machine {
    fn interrupts_enabled(&self) -> bool {
        cpu::interrupts_enabled()
    }

    fn disable_interrupts(&mut self) {
        cpu::cli();
    }

    fn enable_interrupts(&mut self) {
        // SAFETY: the IDT is loaded before the kernel enables interrupts.
        unsafe { cpu::sti() }
    }

    fn load_page_directory(&mut self, root: PhysAddr) {
        // SAFETY: every directory built by the VMM shares the kernel
        // identity tables, so the running code stays mapped.
        unsafe { cpu::load_cr3(root.as_u32()) }
    }

    fn active_page_directory(&self) -> PhysAddr {
        PhysAddr(cpu::read_cr3())
    }

    fn fault_address(&self) -> u32 {
        cpu::read_cr2()
    }

    fn set_kernel_stack(&mut self, esp0: u32) {
        if let Some(tss) = self.tss.as_deref_mut() {
            tss.esp0 = esp0;
        }
    }

    fn load_idt(&mut self, idt: &Idt) {
        let ptr = idt.pointer();
        // SAFETY: the kernel keeps its IDT boxed for its whole lifetime.
        unsafe { cpu::lidt(ptr.base, ptr.limit) }
    }

    fn console_write(&mut self, bytes: &[u8]) {
        self.vga.write_bytes(bytes);
    }

    fn serial_write(&mut self, bytes: &[u8]) {
        self.serial.write_bytes(bytes);
    }

    fn wait_for_interrupt(&mut self) {
        cpu::wait_for_interrupt();
    }

    fn halt(&mut self) -> ! {
        cpu::halt_forever()
    }
}
