//! Kernel-side syscall dispatcher (`int 0x80` path).
//!
//! ABI, as captured by the trampoline:
//! - `EAX` -> syscall number, and the result on return
//! - `EBX`, `ECX`, `EDX`, `ESI`, `EDI` -> arguments 0..4
//!
//! Results are written back to `EAX` as the value itself or `-errno`.
//! Calls that block or exit hand the frame to the scheduler and return
//! whatever frame it selects; their result is stored in the caller's saved
//! context and observed when it is resumed.

use crate::arch::{Machine, TrapFrame};
use crate::kernel::Kernel;

use super::{encode_result, Errno, SyscallId, SyscallResult};

/// Syscall number and arguments decoded from a trap frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyscallArgs {
    pub number: u32,
    pub args: [u32; 5],
}

impl SyscallArgs {
    pub fn from_frame(frame: &TrapFrame) -> Self {
        Self {
            number: frame.eax,
            args: [frame.ebx, frame.ecx, frame.edx, frame.esi, frame.edi],
        }
    }
}

impl<M: Machine> Kernel<M> {
    /// Services one syscall and returns the frame to resume.
    pub(crate) fn handle_syscall(&mut self, mut frame: TrapFrame) -> TrapFrame {
        let call = SyscallArgs::from_frame(&frame);
        let [a0, a1, a2, a3, _] = call.args;

        let Some(id) = SyscallId::from_raw(call.number) else {
            log::debug!(
                "pid {}: unknown syscall {}",
                self.tasks.current_pid(),
                call.number
            );
            frame.set_return(encode_result(Err(Errno::ENOSYS)));
            return frame;
        };

        let result: SyscallResult = match id {
            // Calls that may switch tasks produce the next frame themselves.
            SyscallId::Exit => return self.exit_current(a0 as i32),
            SyscallId::Yield => return self.yield_current(frame),
            SyscallId::Sleep => return self.sleep_current(frame, a0),
            SyscallId::Wait => return self.wait_current(frame, a0),

            SyscallId::Write => self.sys_write(a0, a1, a2),
            SyscallId::Kill => self.sys_kill(a0, a1),
            SyscallId::Sbrk => self.sys_sbrk(a0),
            SyscallId::ReadFile => self.sys_readfile(a0, a1, a2, a3),
            SyscallId::Open => self.sys_open(a0, a1),
            SyscallId::Read => self.sys_read(a0, a1, a2),
            SyscallId::Close => self.sys_close(a0),
            SyscallId::Lseek => self.sys_lseek(a0, a1, a2),
            SyscallId::Fstat => self.sys_fstat(a0, a1),
            SyscallId::Stat => self.sys_stat(a0, a1),
            SyscallId::Mkdir => self.sys_mkdir(a0),
            SyscallId::Readdir => self.sys_readdir(a0, a1),
            SyscallId::Chdir => self.sys_chdir(a0),
            SyscallId::Getcwd => self.sys_getcwd(a0, a1),
            SyscallId::Ioctl => self.sys_ioctl(a0, a1, a2),
            SyscallId::Unlink => self.sys_unlink(a0),
            SyscallId::Rename => self.sys_rename(a0, a1),
            SyscallId::Rmdir => self.sys_rmdir(a0),
            SyscallId::Truncate => self.sys_truncate(a0, a1),
            SyscallId::Ftruncate => self.sys_ftruncate(a0, a1),
            SyscallId::Fsync => self.sys_fsync(a0),
            SyscallId::Dup => self.sys_dup(a0),
            SyscallId::Dup2 => self.sys_dup2(a0, a1),
            SyscallId::Pipe => self.sys_pipe(a0),
            SyscallId::GetPid => Ok(self.tasks.current_pid()),
            SyscallId::Spawn => self.sys_spawn(a0, a1, a2),
            SyscallId::UptimeMs => self.sys_uptime_ms(),
            SyscallId::RtcGet => self.sys_rtc_get(a0),
            SyscallId::RtcSet => self.sys_rtc_set(a0),
            SyscallId::TaskCount => Ok(self.tasks.task_count() as u32),
            SyscallId::TaskInfo => self.sys_task_info(a0, a1),
        };

        if let Err(errno) = result {
            log::debug!("pid {}: {:?} failed: {}", self.tasks.current_pid(), id, errno);
        }
        frame.set_return(encode_result(result));
        frame
    }
}
