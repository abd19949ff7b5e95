/*
                    PHYSICAL FRAME POOL
    ═══════════════════════════════════════════════════════════════════

    0x00000000 ┌───────────────────────────────────┐
               │ Real-mode area, BIOS, VGA         │  reserved
    0x00100000 ├───────────────────────────────────┤
               │ Kernel image (.text .data .bss)   │  reserved
               ├───────────────────────────────────┤ ◄─ kernel_end
               │                                   │
               │ Managed frames                    │  bitmap-tracked
               │                                   │
    limit      └───────────────────────────────────┘ ◄─ min(RAM end, identity window)

    Bitmap encoding: one bit per frame, word N bit B = frame N*64+B.
      1 = frame ALLOCATED (or not RAM)
      0 = frame FREE

    Every frame starts as allocated. Boot code frees the RAM regions the
    bootloader reported and re-reserves low memory and the kernel image.
*/

use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

use bit_field::BitField;

use crate::arch::{PhysAddr, PAGE_SIZE};

/// Physical memory below 1 MiB is never handed out.
pub const LOW_MEMORY_END: u32 = 0x0010_0000;

/// Owned handle to one physical page frame.
///
/// Not `Clone`/`Copy`: holding a `Frame` is the proof of ownership, and the
/// only way to give it back is [`FrameAllocator::release`], which consumes
/// it. A frame is therefore free or owned by exactly one holder.
#[derive(PartialEq, Eq, PartialOrd, Ord)]
pub struct Frame {
    number: u32,
}

impl Frame {
    /// Frame number (physical address / `PAGE_SIZE`).
    #[inline]
    pub fn number(&self) -> u32 {
        self.number
    }

    #[inline]
    pub fn start_address(&self) -> PhysAddr {
        PhysAddr(self.number * PAGE_SIZE)
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Frame({:#010x})", self.number * PAGE_SIZE)
    }
}

/// Bitmap frame allocator over `[0, limit)`.
pub struct FrameAllocator {
    bitmap: Vec<u64>,
    frames_total: u32,
    frames_free: u32,
    /// Word index where the next search starts.
    next_hint: usize,
}

impl FrameAllocator {
    /// Creates a pool covering `[0, limit)` with every frame marked used.
    pub fn new(limit: PhysAddr) -> Self {
        let frames_total = limit.as_u32() / PAGE_SIZE;
        let words = (frames_total as usize).div_ceil(64);
        // Bits past the last real frame stay set forever.
        let bitmap = vec![u64::MAX; words];
        Self {
            bitmap,
            frames_total,
            frames_free: 0,
            next_hint: 0,
        }
    }

    /// Marks usable RAM as free. Partial frames at the edges are skipped.
    pub fn add_region(&mut self, base: PhysAddr, len: u32) {
        let start = base.as_u32().div_ceil(PAGE_SIZE);
        let end = (base.as_u32() as u64 + len as u64) / PAGE_SIZE as u64;
        let end = end.min(self.frames_total as u64) as u32;
        for number in start..end {
            self.mark_free(number);
        }
    }

    /// Marks a range as permanently used. Partial frames are covered whole.
    pub fn reserve_region(&mut self, base: PhysAddr, len: u32) {
        if len == 0 {
            return;
        }
        let start = base.as_u32() / PAGE_SIZE;
        let end = (base.as_u32() as u64 + len as u64).div_ceil(PAGE_SIZE as u64);
        let end = end.min(self.frames_total as u64) as u32;
        for number in start..end {
            self.mark_used(number);
        }
    }

    /// Allocates one frame, or `None` when the pool is exhausted.
    pub fn allocate(&mut self) -> Option<Frame> {
        let words = self.bitmap.len();
        for step in 0..words {
            let word_index = (self.next_hint + step) % words;
            let word = self.bitmap[word_index];
            if word == u64::MAX {
                continue;
            }
            let bit = (!word).trailing_zeros() as usize;
            let number = (word_index * 64 + bit) as u32;
            if number >= self.frames_total {
                continue;
            }
            self.bitmap[word_index].set_bit(bit, true);
            self.frames_free -= 1;
            self.next_hint = word_index;
            log::trace!("allocated frame {:#x}", number * PAGE_SIZE);
            return Some(Frame { number });
        }
        None
    }

    /// Allocates `count` physically contiguous frames (lowest fit first).
    pub fn allocate_contiguous(&mut self, count: usize) -> Option<Vec<Frame>> {
        if count == 0 || count > self.frames_free as usize {
            return None;
        }
        let mut run_start = 0u32;
        let mut run_len = 0usize;
        for number in 0..self.frames_total {
            if self.is_allocated(number) {
                run_len = 0;
                continue;
            }
            if run_len == 0 {
                run_start = number;
            }
            run_len += 1;
            if run_len == count {
                let frames = (run_start..run_start + count as u32)
                    .map(|n| {
                        self.mark_used(n);
                        Frame { number: n }
                    })
                    .collect();
                return Some(frames);
            }
        }
        None
    }

    /// Returns a frame to the pool.
    pub fn release(&mut self, frame: Frame) {
        if !self.is_allocated(frame.number) {
            log::warn!("release of free frame {:?} ignored", frame);
            return;
        }
        self.mark_free(frame.number);
        let word = frame.number as usize / 64;
        if word < self.next_hint {
            self.next_hint = word;
        }
    }

    pub fn release_all(&mut self, frames: impl IntoIterator<Item = Frame>) {
        for frame in frames {
            self.release(frame);
        }
    }

    pub fn is_allocated(&self, number: u32) -> bool {
        if number >= self.frames_total {
            return true;
        }
        self.bitmap[number as usize / 64].get_bit(number as usize % 64)
    }

    #[inline]
    pub fn free_frames(&self) -> u32 {
        self.frames_free
    }

    #[inline]
    pub fn total_frames(&self) -> u32 {
        self.frames_total
    }

    fn mark_free(&mut self, number: u32) {
        if number >= self.frames_total || !self.is_allocated(number) {
            return;
        }
        self.bitmap[number as usize / 64].set_bit(number as usize % 64, false);
        self.frames_free += 1;
    }

    fn mark_used(&mut self, number: u32) {
        if number >= self.frames_total || self.is_allocated(number) {
            return;
        }
        self.bitmap[number as usize / 64].set_bit(number as usize % 64, true);
        self.frames_free -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(frames: u32) -> FrameAllocator {
        let mut pmm = FrameAllocator::new(PhysAddr(frames * PAGE_SIZE));
        pmm.add_region(PhysAddr(0), frames * PAGE_SIZE);
        pmm
    }

    #[test]
    fn new_pool_starts_fully_used() {
        let pmm = FrameAllocator::new(PhysAddr(64 * PAGE_SIZE));
        assert_eq!(pmm.free_frames(), 0);
        assert_eq!(pmm.total_frames(), 64);
    }

    #[test]
    fn partial_region_edges_are_not_freed() {
        let mut pmm = FrameAllocator::new(PhysAddr(16 * PAGE_SIZE));
        pmm.add_region(PhysAddr(0x800), 3 * PAGE_SIZE);
        // 0x800..0x3800 only fully covers frames 1 and 2.
        assert_eq!(pmm.free_frames(), 2);
    }

    #[test]
    fn bits_past_limit_are_never_handed_out() {
        let mut pmm = pool(70);
        let mut seen = 0;
        while let Some(frame) = pmm.allocate() {
            assert!(frame.number() < 70);
            seen += 1;
        }
        assert_eq!(seen, 70);
    }

    #[test]
    fn contiguous_allocation_skips_holes() {
        let mut pmm = pool(16);
        pmm.reserve_region(PhysAddr(2 * PAGE_SIZE), PAGE_SIZE);
        let run = pmm.allocate_contiguous(4).expect("run of four");
        let numbers: Vec<u32> = run.iter().map(Frame::number).collect();
        assert_eq!(numbers, [3, 4, 5, 6]);
    }
}
