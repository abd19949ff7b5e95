//! Kernel-fatal paths.
//!
//! Both end in [`Machine::halt`]: there is no recovery once kernel state is
//! known to be inconsistent.

use core::fmt::{self, Write};
use core::panic::PanicInfo;

use crate::arch::Machine;
use crate::logging::DiagnosticWriter;

/// Reports an invariant violation on console and serial, then halts.
pub fn fatal<M: Machine + ?Sized>(machine: &mut M, reason: fmt::Arguments<'_>) -> ! {
    machine.disable_interrupts();
    log::error!("kernel fatal: {}", reason);
    {
        let mut out = DiagnosticWriter::new(&mut *machine);
        let _ = writeln!(out, "\n!!! KERNEL PANIC !!!");
        let _ = writeln!(out, "{}", reason);
    }
    machine.halt()
}

/// Body of the bare-metal `#[panic_handler]`.
pub fn report_panic<M: Machine + ?Sized>(machine: &mut M, info: &PanicInfo<'_>) -> ! {
    machine.disable_interrupts();
    {
        let mut out = DiagnosticWriter::new(&mut *machine);
        let _ = writeln!(out, "\n!!! KERNEL PANIC !!!");
        if let Some(location) = info.location() {
            let _ = writeln!(out, "Location: {}:{}", location.file(), location.line());
        }
        let _ = writeln!(out, "Message: {}", info.message());
    }
    machine.halt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockMachine;

    #[test]
    #[should_panic(expected = "kernel halted")]
    fn fatal_halts_the_machine() {
        let mut machine = MockMachine::new(1 << 20);
        fatal(&mut machine, format_args!("null trap frame"));
    }

    #[test]
    fn fatal_writes_reason_to_both_sinks() {
        let mut machine = MockMachine::new(1 << 20);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            fatal(&mut machine, format_args!("bad frame {}", 7));
        }));
        assert!(result.is_err());
        assert!(machine.console_text().contains("bad frame 7"));
        assert!(machine.serial_text().contains("KERNEL PANIC"));
    }
}
