//! Pending-work delivery on the return path.
//!
//! A kill requested for a task that is not executing is parked in
//! `Task::pending_kill`. Right before a frame goes back to the trampoline,
//! the task about to resume is checked; if it carries a pending kill it is
//! terminated instead and the next task's frame is substituted. The check
//! repeats until the task about to resume has nothing pending.

use crate::arch::{Machine, TrapFrame};
use crate::kernel::Kernel;

impl<M: Machine> Kernel<M> {
    /// Applies deferred kills to the task about to resume.
    ///
    /// Iterative, never re-enters itself; each round retires one task, so the
    /// loop ends at the latest on the idle task, which cannot be killed.
    pub(crate) fn deliver_signals(&mut self, mut frame: TrapFrame) -> TrapFrame {
        while let Some(code) = self.tasks.current_mut().and_then(|t| t.pending_kill.take()) {
            log::info!("delivering kill({}) to pid {}", code, self.tasks.current_pid());
            frame = self.exit_current(code);
        }
        frame
    }

    /// Whether `pid` has a kill waiting for its next resume.
    pub fn has_pending_kill(&self, pid: crate::scheduler::Pid) -> bool {
        self.tasks
            .by_pid(pid)
            .is_some_and(|t| t.pending_kill.is_some())
    }
}
