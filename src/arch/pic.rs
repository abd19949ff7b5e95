//! Legacy 8259A interrupt controller pair.

use super::idt::{IRQ_BASE, IRQ_SLAVE_BASE};
use super::PortIo;

pub const PIC1_COMMAND: u16 = 0x20;
pub const PIC1_DATA: u16 = 0x21;
pub const PIC2_COMMAND: u16 = 0xA0;
pub const PIC2_DATA: u16 = 0xA1;
pub const PIC_EOI: u8 = 0x20;

const PIC_ICW1_INIT: u8 = 0x10;
const PIC_ICW1_ICW4: u8 = 0x01;
const PIC_ICW4_8086: u8 = 0x01;

/// Slave PIC is wired to master line 2.
pub const CASCADE_LINE: u8 = 2;

/// Boot masks: timer, keyboard and cascade open on the master, slave closed.
pub const INITIAL_MASTER_MASK: u8 = 0xF8;
pub const INITIAL_SLAVE_MASK: u8 = 0xFF;

/// Shadow of the two mask registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainedPics {
    master_mask: u8,
    slave_mask: u8,
}

impl Default for ChainedPics {
    fn default() -> Self {
        Self::new()
    }
}

impl ChainedPics {
    pub const fn new() -> Self {
        Self {
            master_mask: INITIAL_MASTER_MASK,
            slave_mask: INITIAL_SLAVE_MASK,
        }
    }

    /// Remaps master to `IRQ_BASE` and slave to `IRQ_SLAVE_BASE`, then applies masks.
    pub fn init(&mut self, io: &mut impl PortIo) {
        let icw1 = PIC_ICW1_INIT | PIC_ICW1_ICW4;
        io.outb(PIC1_COMMAND, icw1);
        io.io_wait();
        io.outb(PIC2_COMMAND, icw1);
        io.io_wait();

        io.outb(PIC1_DATA, IRQ_BASE as u8);
        io.io_wait();
        io.outb(PIC2_DATA, IRQ_SLAVE_BASE as u8);
        io.io_wait();

        io.outb(PIC1_DATA, 1 << CASCADE_LINE);
        io.io_wait();
        io.outb(PIC2_DATA, CASCADE_LINE);
        io.io_wait();

        io.outb(PIC1_DATA, PIC_ICW4_8086);
        io.io_wait();
        io.outb(PIC2_DATA, PIC_ICW4_8086);
        io.io_wait();

        self.write_masks(io);
    }

    /// Opens one line; slave lines also open the cascade line on the master.
    pub fn unmask(&mut self, io: &mut impl PortIo, line: u8) {
        if line < 8 {
            self.master_mask &= !(1 << line);
        } else if line < 16 {
            self.slave_mask &= !(1 << (line - 8));
            self.master_mask &= !(1 << CASCADE_LINE);
        }
        self.write_masks(io);
    }

    pub fn mask(&mut self, io: &mut impl PortIo, line: u8) {
        if line < 8 {
            self.master_mask |= 1 << line;
        } else if line < 16 {
            self.slave_mask |= 1 << (line - 8);
        }
        self.write_masks(io);
    }

    /// Acknowledges `line`; slave lines need an EOI on both controllers.
    pub fn end_of_interrupt(&self, io: &mut impl PortIo, line: u8) {
        if line >= 8 {
            io.outb(PIC2_COMMAND, PIC_EOI);
        }
        io.outb(PIC1_COMMAND, PIC_EOI);
    }

    pub fn masks(&self) -> (u8, u8) {
        (self.master_mask, self.slave_mask)
    }

    fn write_masks(&self, io: &mut impl PortIo) {
        io.outb(PIC1_DATA, self.master_mask);
        io.outb(PIC2_DATA, self.slave_mask);
    }
}
