//! 80x25 VGA text console.

use super::port::PortByte;

const VGA_BUFFER: usize = 0x000B_8000;
const VGA_CTRL_REGISTER: u16 = 0x3D4;
const VGA_DATA_REGISTER: u16 = 0x3D5;

pub const COLS: usize = 80;
pub const ROWS: usize = 25;

/// Light grey on black.
const ATTRIBUTE: u8 = 0x07;

pub struct VgaText {
    row: usize,
    col: usize,
}

impl VgaText {
    pub const fn new() -> Self {
        Self { row: 0, col: 0 }
    }

    fn cell(row: usize, col: usize) -> *mut u16 {
        (VGA_BUFFER as *mut u16).wrapping_add(row * COLS + col)
    }

    fn put(row: usize, col: usize, byte: u8) {
        // SAFETY: row < ROWS and col < COLS, so the cell lies inside the
        // identity-mapped text buffer.
        unsafe { Self::cell(row, col).write_volatile(((ATTRIBUTE as u16) << 8) | byte as u16) }
    }

    pub fn clear(&mut self) {
        for row in 0..ROWS {
            for col in 0..COLS {
                Self::put(row, col, b' ');
            }
        }
        self.row = 0;
        self.col = 0;
        self.update_cursor();
    }

    fn scroll(&mut self) {
        for row in 1..ROWS {
            for col in 0..COLS {
                // SAFETY: both cells are inside the text buffer.
                unsafe {
                    let value = Self::cell(row, col).read_volatile();
                    Self::cell(row - 1, col).write_volatile(value);
                }
            }
        }
        for col in 0..COLS {
            Self::put(ROWS - 1, col, b' ');
        }
        self.row = ROWS - 1;
    }

    fn newline(&mut self) {
        self.col = 0;
        self.row += 1;
        if self.row >= ROWS {
            self.scroll();
        }
    }

    fn put_byte(&mut self, byte: u8) {
        match byte {
            b'\n' => self.newline(),
            b'\r' => self.col = 0,
            0x08 => {
                if self.col > 0 {
                    self.col -= 1;
                    Self::put(self.row, self.col, b' ');
                }
            }
            b'\t' => {
                let next = (self.col + 4) & !3;
                while self.col < next.min(COLS) {
                    Self::put(self.row, self.col, b' ');
                    self.col += 1;
                }
                if self.col >= COLS {
                    self.newline();
                }
            }
            byte => {
                let printable = if (0x20..0x7F).contains(&byte) { byte } else { b'?' };
                Self::put(self.row, self.col, printable);
                self.col += 1;
                if self.col >= COLS {
                    self.newline();
                }
            }
        }
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.put_byte(b);
        }
        self.update_cursor();
    }

    fn update_cursor(&self) {
        let pos = (self.row * COLS + self.col) as u16;
        let ctrl = PortByte::new(VGA_CTRL_REGISTER);
        let data = PortByte::new(VGA_DATA_REGISTER);
        // SAFETY: CRTC cursor location registers 0x0E/0x0F.
        unsafe {
            ctrl.write(0x0F);
            data.write((pos & 0xFF) as u8);
            ctrl.write(0x0E);
            data.write((pos >> 8) as u8);
        }
    }
}
