//! Interrupt routing: the IRQ handler registry, exception diagnostics and
//! the single trap dispatcher.

pub mod dispatch;
pub mod exceptions;

use alloc::boxed::Box;
use core::fmt;

use crate::arch::idt::IRQ_LINES;
use crate::arch::TrapFrame;

/// PIT channel 0.
pub const TIMER_LINE: u8 = 0;
/// PS/2 keyboard.
pub const KEYBOARD_LINE: u8 = 1;

/// Callback run by the dispatcher when its line fires.
///
/// Handlers only observe the frame. End-of-interrupt is sent by the core
/// after the handler returns, and only the dispatcher may switch tasks.
pub trait IrqHandler: Send {
    fn handle(&mut self, line: u8, frame: &TrapFrame);
}

impl<F> IrqHandler for F
where
    F: FnMut(u8, &TrapFrame) + Send,
{
    fn handle(&mut self, line: u8, frame: &TrapFrame) {
        self(line, frame)
    }
}

/// One registry slot.
pub enum IrqSlot {
    Empty,
    Handler(Box<dyn IrqHandler>),
}

impl fmt::Debug for IrqSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("Empty"),
            Self::Handler(_) => f.write_str("Handler"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqError {
    /// Line number outside 0..16.
    InvalidLine(u8),
}

impl fmt::Display for IrqError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidLine(line) => write!(f, "IRQ line {} does not exist", line),
        }
    }
}

/// Handler table and per-line invocation counters for IRQ 0..15.
#[derive(Debug)]
pub struct IrqRegistry {
    slots: [IrqSlot; IRQ_LINES],
    counts: [u64; IRQ_LINES],
}

impl Default for IrqRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl IrqRegistry {
    pub fn new() -> Self {
        Self {
            slots: core::array::from_fn(|_| IrqSlot::Empty),
            counts: [0; IRQ_LINES],
        }
    }

    /// Installs `handler` on `line`, replacing any previous one.
    ///
    /// The timer line is accepted too; its handler runs before the
    /// scheduler sees the tick.
    pub fn register(&mut self, line: u8, handler: Box<dyn IrqHandler>) -> Result<(), IrqError> {
        let slot = self
            .slots
            .get_mut(line as usize)
            .ok_or(IrqError::InvalidLine(line))?;
        if matches!(slot, IrqSlot::Handler(_)) {
            log::warn!("IRQ {} handler replaced", line);
        }
        *slot = IrqSlot::Handler(handler);
        Ok(())
    }

    pub fn unregister(&mut self, line: u8) {
        if let Some(slot) = self.slots.get_mut(line as usize) {
            *slot = IrqSlot::Empty;
        }
    }

    pub fn is_registered(&self, line: u8) -> bool {
        matches!(self.slots.get(line as usize), Some(IrqSlot::Handler(_)))
    }

    /// Counts the interrupt and runs the handler, if any.
    ///
    /// Returns whether a handler ran.
    pub fn fire(&mut self, line: u8, frame: &TrapFrame) -> bool {
        let index = line as usize;
        let Some(count) = self.counts.get_mut(index) else {
            return false;
        };
        *count += 1;
        match &mut self.slots[index] {
            IrqSlot::Handler(handler) => {
                handler.handle(line, frame);
                true
            }
            IrqSlot::Empty => false,
        }
    }

    /// Invocation count of one line (0 for lines that do not exist).
    pub fn count(&self, line: u8) -> u64 {
        self.counts.get(line as usize).copied().unwrap_or(0)
    }

    pub fn counts(&self) -> [u64; IRQ_LINES] {
        self.counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;
    use core::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn empty_line_is_counted_without_handler() {
        let mut registry = IrqRegistry::new();
        assert!(!registry.fire(5, &TrapFrame::default()));
        assert_eq!(registry.count(5), 1);
    }

    #[test]
    fn registered_closure_sees_line() {
        let mut registry = IrqRegistry::new();
        let seen = Arc::new(AtomicU32::new(0));
        let sink = seen.clone();
        registry
            .register(KEYBOARD_LINE, Box::new(move |line: u8, _: &TrapFrame| {
                sink.store(line as u32 + 100, Ordering::Relaxed);
            }))
            .unwrap();
        assert!(registry.fire(KEYBOARD_LINE, &TrapFrame::default()));
        assert_eq!(seen.load(Ordering::Relaxed), 101);
    }

    #[test]
    fn only_lines_past_fifteen_are_rejected() {
        let mut registry = IrqRegistry::new();
        let noop = |_: u8, _: &TrapFrame| {};
        assert_eq!(registry.register(16, Box::new(noop)), Err(IrqError::InvalidLine(16)));
        assert_eq!(registry.register(TIMER_LINE, Box::new(noop)), Ok(()));
        assert!(registry.is_registered(TIMER_LINE));
        assert_eq!(registry.count(200), 0);
    }
}
