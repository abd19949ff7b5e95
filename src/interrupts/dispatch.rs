//! The single trap entry point.
//!
//! Every vector reaches [`Kernel::dispatch`]:
//! - `0..32`: CPU exceptions, fatal in kernel mode, task-fatal in user mode
//! - `0x20..0x30`: PIC lines, counted, handled, acknowledged; line 0 drives
//!   the scheduler
//! - `0x80`: the syscall gate
//!
//! Anything else is logged and ignored. Whatever frame a handler returns is
//! passed through pending-work delivery before it reaches the trampoline.

use alloc::vec::Vec;

use crate::arch::idt::{EXCEPTION_COUNT, EXCEPTION_PAGE_FAULT, IRQ_BASE, IRQ_LINES, SYSCALL_VECTOR};
use crate::arch::{Machine, TrapFrame};
use crate::interrupts::exceptions::{backtrace, exception_name, exit_code_for, kernel_fault, write_exception_report};
use crate::interrupts::TIMER_LINE;
use crate::kernel::Kernel;
use crate::logging::DiagnosticWriter;
use crate::syscall::usercopy;

impl<M: Machine> Kernel<M> {
    /// Trampoline entry. A missing frame is an invariant violation.
    pub fn enter(&mut self, frame: Option<TrapFrame>) -> TrapFrame {
        match frame {
            Some(frame) => self.dispatch(frame),
            None => crate::panic::fatal(&mut self.machine, format_args!("null trap frame")),
        }
    }

    /// Routes one trap and returns the frame to resume.
    pub fn dispatch(&mut self, frame: TrapFrame) -> TrapFrame {
        // Execution has left every retired stack by now.
        self.reclaim_retired_stacks();

        let vector = frame.int_no;
        let irq_end = IRQ_BASE + IRQ_LINES as u32;
        let next = if vector < EXCEPTION_COUNT {
            self.handle_exception(frame)
        } else if vector == SYSCALL_VECTOR {
            self.handle_syscall(frame)
        } else if (IRQ_BASE..irq_end).contains(&vector) {
            self.handle_irq(frame, (vector - IRQ_BASE) as u8)
        } else {
            log::warn!("spurious vector {:#x} at eip={:#x}", vector, frame.eip);
            frame
        };
        self.deliver_signals(next)
    }

    fn handle_irq(&mut self, frame: TrapFrame, line: u8) -> TrapFrame {
        self.irqs.fire(line, &frame);
        self.pics.end_of_interrupt(&mut self.machine, line);
        if line == TIMER_LINE {
            self.on_timer_tick(frame)
        } else {
            frame
        }
    }

    fn handle_exception(&mut self, frame: TrapFrame) -> TrapFrame {
        let vector = frame.int_no;
        let fault_address = if vector == EXCEPTION_PAGE_FAULT {
            self.machine.fault_address()
        } else {
            0
        };
        let pid = self.tasks.current_pid();

        if !frame.from_user() {
            kernel_fault(&mut self.machine, &frame, Some(pid), self.config.backtrace_depth);
        }

        let frames = self.user_backtrace(frame.ebp);
        let guard_hit = vector == EXCEPTION_PAGE_FAULT
            && self
                .tasks
                .current()
                .and_then(|t| t.space.as_ref())
                .is_some_and(|space| space.dir.is_guard_page(fault_address));
        log::error!(
            "pid {}: {} at eip={:#x}, terminating",
            pid,
            exception_name(vector),
            frame.eip
        );
        {
            let mut out = DiagnosticWriter::new(&mut self.machine);
            let _ = write_exception_report(&mut out, &frame, fault_address, Some(pid), &frames);
            if guard_hit {
                let _ = core::fmt::Write::write_str(&mut out, "  stack overflow into guard page\n");
            }
        }
        self.exit_current(exit_code_for(vector))
    }

    /// Frame-pointer chain of the current user task, read through its page tables.
    fn user_backtrace(&self, ebp: u32) -> Vec<u32> {
        let Some(space) = self.tasks.current().and_then(|t| t.space.as_ref()) else {
            return Vec::new();
        };
        let machine = &self.machine;
        backtrace(ebp, self.config.backtrace_depth, |addr| {
            usercopy::read_user_u32(&space.dir, machine, addr).ok()
        })
    }
}
