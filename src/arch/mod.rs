//! Architecture layer for i386 protected mode.
//!
//! Everything above this module talks to the CPU through the [`Machine`]
//! trait. The real implementation lives in [`i386`] and is only compiled for
//! the freestanding target; host builds use [`crate::testing::MockMachine`].

pub mod frame;
pub mod gdt;
pub mod idt;
pub mod pic;
pub mod pit;

#[cfg(all(target_arch = "x86", target_os = "none"))]
pub mod i386;

pub use frame::TrapFrame;

/// Size of one page frame / virtual page.
pub const PAGE_SIZE: u32 = 4096;

/// Physical address of a byte in RAM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct PhysAddr(pub u32);

impl PhysAddr {
    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn offset(self, bytes: u32) -> Self {
        Self(self.0 + bytes)
    }

    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.0 & (PAGE_SIZE - 1) == 0
    }
}

#[inline]
pub const fn page_align_down(addr: u32) -> u32 {
    addr & !(PAGE_SIZE - 1)
}

/// Rounds up to the next page boundary, saturating at the last page.
#[inline]
pub const fn page_align_up(addr: u32) -> u32 {
    match addr.checked_add(PAGE_SIZE - 1) {
        Some(v) => v & !(PAGE_SIZE - 1),
        None => !(PAGE_SIZE - 1),
    }
}

/// Byte-granular access to physical memory.
///
/// On hardware every managed frame lies inside the kernel identity window,
/// so this is a plain memory copy. Page tables, kernel stacks and user
/// copies all go through this trait.
pub trait PhysicalMemory {
    fn read(&self, addr: PhysAddr, buf: &mut [u8]);

    fn write(&mut self, addr: PhysAddr, data: &[u8]);

    fn zero(&mut self, addr: PhysAddr, len: usize) {
        const ZEROS: [u8; 256] = [0; 256];
        let mut done = 0usize;
        while done < len {
            let n = (len - done).min(ZEROS.len());
            self.write(addr.offset(done as u32), &ZEROS[..n]);
            done += n;
        }
    }

    fn read_u32(&self, addr: PhysAddr) -> u32 {
        let mut raw = [0u8; 4];
        self.read(addr, &mut raw);
        u32::from_le_bytes(raw)
    }

    fn write_u32(&mut self, addr: PhysAddr, value: u32) {
        self.write(addr, &value.to_le_bytes());
    }
}

/// Legacy I/O port space.
pub trait PortIo {
    fn inb(&mut self, port: u16) -> u8;

    fn outb(&mut self, port: u16, value: u8);

    /// Short settle delay between PIC programming steps (write to POST port 0x80).
    fn io_wait(&mut self) {
        self.outb(0x80, 0);
    }
}

/// CPU services the kernel core needs from the platform.
pub trait Machine: PhysicalMemory + PortIo {
    /// Returns whether EFLAGS.IF is set.
    fn interrupts_enabled(&self) -> bool;

    fn disable_interrupts(&mut self);

    fn enable_interrupts(&mut self);

    /// Loads CR3 with the given page-directory root.
    fn load_page_directory(&mut self, root: PhysAddr);

    /// Returns the page-directory root currently held in CR3.
    fn active_page_directory(&self) -> PhysAddr;

    /// Returns CR2, the linear address of the last page fault.
    fn fault_address(&self) -> u32;

    /// Programs TSS.esp0 used on ring 3 -> ring 0 transitions.
    fn set_kernel_stack(&mut self, esp0: u32);

    /// Loads the interrupt descriptor table.
    fn load_idt(&mut self, idt: &idt::Idt);

    /// Primary console sink (screen collaborator).
    fn console_write(&mut self, bytes: &[u8]);

    /// Serial debug sink.
    fn serial_write(&mut self, bytes: &[u8]);

    /// Enables interrupts and sleeps until the next one arrives (`sti; hlt`).
    fn wait_for_interrupt(&mut self);

    /// Stops the CPU permanently with interrupts disabled.
    fn halt(&mut self) -> !;
}
