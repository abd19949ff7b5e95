//! x86 port I/O.

use core::arch::asm;

/// Reads a byte from `port`.
///
/// # Safety
/// Port I/O can change hardware state.
#[inline]
pub unsafe fn inb(port: u16) -> u8 {
    let value: u8;
    asm!(
        "in al, dx",
        out("al") value,
        in("dx") port,
        options(nomem, nostack, preserves_flags)
    );
    value
}

/// Writes a byte to `port`.
///
/// # Safety
/// Port I/O can change hardware state.
#[inline]
pub unsafe fn outb(port: u16, value: u8) {
    asm!(
        "out dx, al",
        in("dx") port,
        in("al") value,
        options(nomem, nostack, preserves_flags)
    );
}

/// Byte-sized port bound to a fixed address.
#[derive(Debug, Clone, Copy)]
pub struct PortByte {
    port: u16,
}

impl PortByte {
    pub const fn new(port: u16) -> Self {
        Self { port }
    }

    /// # Safety
    /// Port I/O can change hardware state.
    #[inline]
    pub unsafe fn read(&self) -> u8 {
        inb(self.port)
    }

    /// # Safety
    /// Port I/O can change hardware state.
    #[inline]
    pub unsafe fn write(&self, value: u8) {
        outb(self.port, value)
    }
}
