//! Saved CPU context captured by the trap trampolines.

use core::mem::size_of;

use super::gdt::{KERNEL_CODE_SELECTOR, KERNEL_DATA_SELECTOR, USER_CODE_SELECTOR, USER_DATA_SELECTOR};

/// EFLAGS bit 9: interrupt enable.
pub const EFLAGS_IF: u32 = 1 << 9;

/// EFLAGS bit 1: reserved, always set.
pub const EFLAGS_RESERVED: u32 = 1 << 1;

/// EFLAGS for new tasks: IF=1 so the timer keeps preempting, IOPL=0.
pub const DEFAULT_EFLAGS: u32 = EFLAGS_IF | EFLAGS_RESERVED;

/// Bytes of the frame the CPU pops on an `iret` that stays in ring 0.
///
/// `useresp`/`ss` are only pushed and popped on a privilege change.
pub const KERNEL_FRAME_SIZE: usize = size_of::<TrapFrame>() - 2 * size_of::<u32>();

/// Distance from the `pusha`-saved `esp` down to the start of the frame.
///
/// `pusha` records `esp` as it was before the instruction, i.e. the address
/// of `int_no`. Below that sit eight general registers and four segment
/// registers.
pub const PUSHA_ESP_TO_FRAME: u32 = 12 * 4;

/// Register snapshot in the exact order the trampolines push it.
///
/// Layout contract:
/// - `gs..ds` pushed by the stub, `edi..eax` by `pusha`, then the vector and
///   error code, then the CPU-pushed `iret` frame.
/// - `useresp`/`ss` are valid only when `cs` carries RPL 3.
/// - Any change requires synchronized updates in `arch::i386::stubs`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TrapFrame {
    pub gs: u32,
    pub fs: u32,
    pub es: u32,
    pub ds: u32,
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    pub esp: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    pub int_no: u32,
    pub err_code: u32,
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
    pub useresp: u32,
    pub ss: u32,
}

const _: () = {
    assert!(size_of::<TrapFrame>() == 19 * 4);
};

impl TrapFrame {
    /// Initial context of a ring-3 task entering at `entry` with stack `user_esp`.
    pub fn user_entry(entry: u32, user_esp: u32) -> Self {
        let data = USER_DATA_SELECTOR as u32;
        Self {
            gs: data,
            fs: data,
            es: data,
            ds: data,
            eip: entry,
            cs: USER_CODE_SELECTOR as u32,
            eflags: DEFAULT_EFLAGS,
            useresp: user_esp,
            ss: data,
            ..Self::default()
        }
    }

    /// Initial context of a ring-0 task whose kernel stack ends at `stack_top`.
    ///
    /// The frame is laid out so that it occupies the last
    /// [`KERNEL_FRAME_SIZE`] bytes below `stack_top`; the `esp` slot encodes
    /// that position the same way `pusha` would.
    pub fn kernel_entry(entry: u32, stack_top: u32) -> Self {
        let data = KERNEL_DATA_SELECTOR as u32;
        let frame_base = stack_top - KERNEL_FRAME_SIZE as u32;
        Self {
            gs: data,
            fs: data,
            es: data,
            ds: data,
            esp: frame_base + PUSHA_ESP_TO_FRAME,
            eip: entry,
            cs: KERNEL_CODE_SELECTOR as u32,
            eflags: DEFAULT_EFLAGS,
            ..Self::default()
        }
    }

    /// Returns whether the interrupted code ran at CPL 3.
    #[inline]
    pub fn from_user(&self) -> bool {
        self.cs & 0x3 == 0x3
    }

    /// Stack pointer of the interrupted context.
    #[inline]
    pub fn stack_pointer(&self) -> u32 {
        if self.from_user() {
            self.useresp
        } else {
            self.esp
        }
    }

    /// Number of bytes the trampoline restores for this frame.
    #[inline]
    pub fn restore_len(&self) -> usize {
        if self.from_user() {
            size_of::<TrapFrame>()
        } else {
            KERNEL_FRAME_SIZE
        }
    }

    /// Address at which this frame must be placed before the trampoline pops it.
    ///
    /// A ring-3 frame always sits at the top of the task's kernel stack, where
    /// the CPU put it on entry. A ring-0 frame must return to the exact spot it
    /// was captured, which `pusha` recorded in the `esp` slot.
    pub fn resume_slot(&self, kernel_stack_top: u32) -> u32 {
        if self.from_user() {
            kernel_stack_top - size_of::<TrapFrame>() as u32
        } else {
            self.esp - PUSHA_ESP_TO_FRAME
        }
    }

    /// Writes a syscall/return value into EAX.
    #[inline]
    pub fn set_return(&mut self, value: u32) {
        self.eax = value;
    }

    /// Raw bytes of the first `restore_len()` bytes, in memory order.
    pub fn to_bytes(&self) -> [u8; size_of::<TrapFrame>()] {
        let words = [
            self.gs, self.fs, self.es, self.ds, self.edi, self.esi, self.ebp, self.esp, self.ebx,
            self.edx, self.ecx, self.eax, self.int_no, self.err_code, self.eip, self.cs,
            self.eflags, self.useresp, self.ss,
        ];
        let mut out = [0u8; size_of::<TrapFrame>()];
        for (chunk, word) in out.chunks_exact_mut(4).zip(words.iter()) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_frame_resumes_at_stack_top() {
        let frame = TrapFrame::user_entry(0x0200_0000, 0xBFF0_0000);
        assert!(frame.from_user());
        assert_eq!(frame.resume_slot(0x0030_0000), 0x0030_0000 - 76);
        assert_eq!(frame.restore_len(), 76);
    }

    #[test]
    fn kernel_frame_occupies_top_of_stack_without_ring_change_words() {
        let top = 0x0040_0000;
        let frame = TrapFrame::kernel_entry(0x0010_2000, top);
        assert!(!frame.from_user());
        let slot = frame.resume_slot(top);
        assert_eq!(slot as usize + frame.restore_len(), top as usize);
    }

    #[test]
    fn to_bytes_places_eax_at_offset_44() {
        let mut frame = TrapFrame::default();
        frame.eax = 0xAABB_CCDD;
        let raw = frame.to_bytes();
        assert_eq!(&raw[44..48], &0xAABB_CCDDu32.to_le_bytes());
    }
}
