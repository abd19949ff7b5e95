//! 8253/8254 programmable interval timer, channel 0.

use super::PortIo;

pub const PIT_COMMAND: u16 = 0x43;
pub const PIT_CHANNEL0: u16 = 0x40;
const PIT_MODE_RATE_GENERATOR: u8 = 0x36;
pub const PIT_INPUT_HZ: u32 = 1_193_182;

/// Largest tick delay a single sleep request may produce.
pub const MAX_SLEEP_TICKS: u32 = 0x7FFF_FFFF;

/// Computes the channel-0 divisor for `hz`, clamped to `1..=65535`.
///
/// Returns 0 for `hz == 0` so callers can decide how to handle invalid input.
pub const fn divisor_for_hz(hz: u32) -> u16 {
    if hz == 0 {
        return 0;
    }

    let divisor = PIT_INPUT_HZ / hz;
    if divisor == 0 {
        1
    } else if divisor > u16::MAX as u32 {
        u16::MAX
    } else {
        divisor as u16
    }
}

/// Frequency the PIT really produces for a given divisor.
pub const fn effective_hz(divisor: u16) -> u32 {
    if divisor == 0 {
        return 0;
    }
    PIT_INPUT_HZ / divisor as u32
}

/// Programs channel 0 as a rate generator and returns the effective frequency.
pub fn program(io: &mut impl PortIo, hz: u32) -> u32 {
    let divisor = divisor_for_hz(hz);
    if divisor == 0 {
        return 0;
    }

    io.outb(PIT_COMMAND, PIT_MODE_RATE_GENERATOR);
    io.outb(PIT_CHANNEL0, (divisor & 0xFF) as u8);
    io.outb(PIT_CHANNEL0, (divisor >> 8) as u8);
    effective_hz(divisor)
}

/// Converts milliseconds to ticks, rounding up and capping at [`MAX_SLEEP_TICKS`].
pub fn ms_to_ticks(ms: u32, hz: u32) -> u32 {
    if ms == 0 || hz == 0 {
        return 0;
    }
    let ticks = (ms as u64 * hz as u64).div_ceil(1000);
    ticks.min(MAX_SLEEP_TICKS as u64) as u32
}

/// Converts a tick count into whole milliseconds without intermediate overflow.
pub fn ticks_to_ms(ticks: u64, hz: u32) -> u64 {
    if hz == 0 {
        return 0;
    }
    let hz = hz as u64;
    let seconds = ticks / hz;
    let rem = ticks % hz;
    seconds * 1000 + (rem * 1000) / hz
}

/// Monotonic tick counter driven by IRQ 0.
#[derive(Debug, Clone, Copy, Default)]
pub struct Timer {
    hz: u32,
    ticks: u64,
}

impl Timer {
    pub const fn new() -> Self {
        Self { hz: 0, ticks: 0 }
    }

    /// Programs the hardware and records the effective frequency.
    pub fn start(&mut self, io: &mut impl PortIo, requested_hz: u32) -> u32 {
        self.hz = program(io, requested_hz);
        self.ticks = 0;
        self.hz
    }

    #[inline]
    pub fn tick(&mut self) -> u64 {
        self.ticks += 1;
        self.ticks
    }

    #[inline]
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    #[inline]
    pub fn hz(&self) -> u32 {
        self.hz
    }

    pub fn uptime_ms(&self) -> u64 {
        ticks_to_ms(self.ticks, self.hz)
    }

    pub fn ms_to_ticks(&self, ms: u32) -> u32 {
        ms_to_ticks(ms, self.hz)
    }
}
