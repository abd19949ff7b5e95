//! Interrupt-flag critical sections.
//!
//! On one CPU the only exclusion primitive is "interrupts off". A section
//! records whether IF was set, clears it, and restores the previous state on
//! exit, so sections nest without re-enabling interrupts early.

use crate::arch::Machine;

/// Runs `f` with interrupts disabled, restoring the previous IF state afterwards.
pub fn without_interrupts<M, R>(machine: &mut M, f: impl FnOnce(&mut M) -> R) -> R
where
    M: Machine + ?Sized,
{
    let interrupts_were_enabled = machine.interrupts_enabled();
    machine.disable_interrupts();

    let result = f(machine);

    if interrupts_were_enabled {
        machine.enable_interrupts();
    }
    result
}
