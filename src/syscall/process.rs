//! Process, heap, clock and introspection syscalls.

use alloc::string::String;
use alloc::vec::Vec;

use crate::arch::Machine;
use crate::kernel::Kernel;
use crate::scheduler::TaskInfo;
use crate::services::DateTime;

use super::usercopy::{self, caller_directory};
use super::{Errno, SyscallResult, SBRK_FAILED};

impl<M: Machine> Kernel<M> {
    /// Moves the heap break. Failure yields `SBRK_FAILED`, never an errno.
    pub(crate) fn sys_sbrk(&mut self, increment: u32) -> SyscallResult {
        let Some(space) = self.tasks.current_mut().and_then(|t| t.space.as_mut()) else {
            return Ok(SBRK_FAILED);
        };
        match space.sbrk(&mut self.machine, &mut self.pmm, increment as i32) {
            Ok(previous) => Ok(previous),
            Err(errno) => {
                log::debug!("sbrk({}) refused: {}", increment as i32, errno);
                Ok(SBRK_FAILED)
            }
        }
    }

    pub(crate) fn sys_kill(&mut self, pid: u32, code: u32) -> SyscallResult {
        self.kill(pid, code as i32).map(|()| 0)
    }

    /// `spawn(path, argv, argc)`. With `argc == 0` the path becomes `argv[0]`.
    pub(crate) fn sys_spawn(&mut self, path: u32, argv: u32, argc: u32) -> SyscallResult {
        if argc as usize > self.config.max_spawn_args {
            return Err(Errno::E2BIG);
        }
        let path = self.user_path(path)?;
        let args = self.user_argv(argv, argc)?;
        let args = if args.is_empty() {
            alloc::vec![path.clone()]
        } else {
            args
        };
        self.spawn_path(&path, &args).map_err(Errno::from)
    }

    fn user_argv(&self, argv: u32, argc: u32) -> Result<Vec<String>, Errno> {
        let dir = caller_directory(&self.tasks)?;
        let max = self.config.max_user_string;
        let mut args = Vec::with_capacity(argc as usize);
        for i in 0..argc {
            let slot = argv.checked_add(i * 4).ok_or(Errno::EFAULT)?;
            let ptr = usercopy::read_user_u32(dir, &self.machine, slot)?;
            args.push(usercopy::copy_string_from_user(dir, &self.machine, ptr, max)?);
        }
        Ok(args)
    }

    /// Milliseconds since boot, truncated to 32 bits.
    pub(crate) fn sys_uptime_ms(&self) -> SyscallResult {
        Ok(self.uptime_ms() as u32)
    }

    pub(crate) fn sys_rtc_get(&mut self, out: u32) -> SyscallResult {
        let now = self.services.rtc.now();
        self.copy_out(out, &now.to_wire())?;
        Ok(0)
    }

    pub(crate) fn sys_rtc_set(&mut self, input: u32) -> SyscallResult {
        let raw = self.copy_in(input, DateTime::WIRE_SIZE)?;
        let mut wire = [0u8; DateTime::WIRE_SIZE];
        wire.copy_from_slice(&raw);
        let time = DateTime::from_wire(&wire);
        if !time.is_valid() {
            return Err(Errno::EINVAL);
        }
        self.services.rtc.set(&time).map(|()| 0)
    }

    pub(crate) fn sys_task_info(&mut self, index: u32, out: u32) -> SyscallResult {
        let info = self
            .tasks
            .nth(index as usize)
            .map(TaskInfo::from)
            .ok_or(Errno::EINVAL)?;
        self.copy_out(out, &info.to_wire())?;
        Ok(0)
    }
}
