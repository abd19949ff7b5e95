//! Synchronization primitives for the single-CPU kernel.

pub mod irq;

pub use irq::without_interrupts;
