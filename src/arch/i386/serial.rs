//! COM1 debug output.
//!
//! 115200 baud, 8N1, polled. Under QEMU use `-serial stdio` or
//! `-serial file:debug.log`.

use super::port::PortByte;

const COM1_PORT: u16 = 0x3F8;

const DATA: u16 = 0;
const INTERRUPT_ENABLE: u16 = 1;
const FIFO_CONTROL: u16 = 2;
const LINE_CONTROL: u16 = 3;
const MODEM_CONTROL: u16 = 4;
const LINE_STATUS: u16 = 5;

/// Transmitter holding register empty.
const LSR_THRE: u8 = 0x20;

pub struct Serial {
    base: u16,
}

impl Serial {
    pub const fn com1() -> Self {
        Self { base: COM1_PORT }
    }

    fn port(&self, offset: u16) -> PortByte {
        PortByte::new(self.base + offset)
    }

    pub fn init(&self) {
        // SAFETY: COM1 registers; programming the UART has no memory effects.
        unsafe {
            self.port(INTERRUPT_ENABLE).write(0x00);
            self.port(LINE_CONTROL).write(0x80);
            // Divisor 1 -> 115200 baud.
            self.port(DATA).write(0x01);
            self.port(INTERRUPT_ENABLE).write(0x00);
            self.port(LINE_CONTROL).write(0x03);
            self.port(FIFO_CONTROL).write(0xC7);
            self.port(MODEM_CONTROL).write(0x0B);
        }
    }

    pub fn write_byte(&self, byte: u8) {
        // SAFETY: polling LSR and writing THR only touch the UART.
        unsafe {
            while self.port(LINE_STATUS).read() & LSR_THRE == 0 {
                core::hint::spin_loop();
            }
            self.port(DATA).write(byte);
        }
    }

    pub fn write_bytes(&self, bytes: &[u8]) {
        for &b in bytes {
            if b == b'\n' {
                self.write_byte(b'\r');
            }
            self.write_byte(b);
        }
    }
}

/// Log sink for the boot CPU.
pub fn log_sink(line: &str) {
    let serial = Serial::com1();
    serial.write_bytes(line.as_bytes());
    serial.write_bytes(b"\n");
}
