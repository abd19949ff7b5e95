//! Task records, kernel stacks and user address spaces.

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

use crate::arch::{page_align_up, PhysicalMemory, TrapFrame, PAGE_SIZE};
use crate::memory::vmm::{GuardedStack, PageDirectory, PageFlags, USER_LIMIT};
use crate::memory::{Frame, FrameAllocator};
use crate::syscall::fs::FdTable;
use crate::syscall::Errno;

/// Process id. Assigned monotonically starting at 1, never reused, never 0.
pub type Pid = u32;

/// Pid of the idle task created from the boot context.
pub const IDLE_PID: Pid = 1;

/// Longest task name kept (the wire format reserves one byte for NUL).
pub const TASK_NAME_LEN: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Kernel,
    User,
}

/// Lifecycle state of a task.
///
/// "Running" is not a state of its own: the current task is a `Runnable`
/// task the scheduler selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Eligible for selection.
    Runnable,

    /// Blocked until the tick counter reaches `wake_tick`.
    Sleeping { wake_tick: u64 },

    /// Blocked until task `target` becomes a zombie.
    Waiting { target: Pid },

    /// Exited. Kept until a waiter collects `exit_code`; never leaves this state.
    Zombie { exit_code: i32 },
}

impl TaskState {
    /// Numeric code used by `vos_task_info_t`.
    pub fn code(&self) -> u32 {
        match self {
            Self::Runnable => 0,
            Self::Sleeping { .. } => 1,
            Self::Waiting { .. } => 2,
            Self::Zombie { .. } => 3,
        }
    }

    pub fn is_runnable(&self) -> bool {
        matches!(self, Self::Runnable)
    }

    pub fn is_zombie(&self) -> bool {
        matches!(self, Self::Zombie { .. })
    }

    /// Whether the state machine has an edge from `self` to `next`.
    pub fn can_become(&self, next: &TaskState) -> bool {
        match (self, next) {
            (Self::Zombie { .. }, _) => false,
            (_, Self::Zombie { .. }) => true,
            (Self::Runnable, _) => true,
            (Self::Sleeping { .. }, Self::Runnable) => true,
            (Self::Waiting { .. }, Self::Runnable) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Runnable => write!(f, "runnable"),
            Self::Sleeping { wake_tick } => write!(f, "sleeping until tick {}", wake_tick),
            Self::Waiting { target } => write!(f, "waiting for pid {}", target),
            Self::Zombie { exit_code } => write!(f, "zombie ({})", exit_code),
        }
    }
}

/// Physically contiguous ring-0 stack owned by one task.
#[derive(Debug)]
pub struct KernelStack {
    frames: Vec<Frame>,
}

impl KernelStack {
    pub fn allocate(pmm: &mut FrameAllocator, pages: usize) -> Option<Self> {
        let frames = pmm.allocate_contiguous(pages)?;
        Some(Self { frames })
    }

    pub fn bottom(&self) -> u32 {
        self.frames
            .first()
            .map(|f| f.start_address().as_u32())
            .unwrap_or(0)
    }

    /// Initial stack pointer; also the TSS `esp0` value for this task.
    pub fn top(&self) -> u32 {
        self.bottom() + self.frames.len() as u32 * PAGE_SIZE
    }

    pub fn release(self, pmm: &mut FrameAllocator) {
        pmm.release_all(self.frames);
    }
}

/// A user task's address space plus its heap break.
#[derive(Debug)]
pub struct UserSpace {
    pub dir: PageDirectory,
    heap_start: u32,
    heap_break: u32,
    stack: Option<GuardedStack>,
}

impl UserSpace {
    pub fn new(dir: PageDirectory, heap_break: u32, stack: Option<GuardedStack>) -> Self {
        Self {
            dir,
            heap_start: heap_break,
            heap_break,
            stack,
        }
    }

    #[inline]
    pub fn heap_break(&self) -> u32 {
        self.heap_break
    }

    #[inline]
    pub fn heap_start(&self) -> u32 {
        self.heap_start
    }

    pub fn stack(&self) -> Option<GuardedStack> {
        self.stack
    }

    /// Highest address the break may reach: the stack guard page, when known.
    pub fn heap_limit(&self) -> u32 {
        self.stack.map(|s| s.guard).unwrap_or(USER_LIMIT)
    }

    /// Moves the break by `increment` bytes and returns the previous break.
    ///
    /// Growing maps zeroed pages; shrinking releases pages lying wholly above
    /// the new break. On failure nothing changes.
    pub fn sbrk(
        &mut self,
        mem: &mut (impl PhysicalMemory + ?Sized),
        pmm: &mut FrameAllocator,
        increment: i32,
    ) -> Result<u32, Errno> {
        let old = self.heap_break;
        if increment == 0 {
            return Ok(old);
        }
        let new = if increment > 0 {
            old.checked_add(increment as u32).ok_or(Errno::ENOMEM)?
        } else {
            old.checked_sub(increment.unsigned_abs()).ok_or(Errno::EINVAL)?
        };
        if new < self.heap_start {
            return Err(Errno::EINVAL);
        }
        if new > self.heap_limit() {
            return Err(Errno::ENOMEM);
        }

        let old_end = page_align_up(old);
        let new_end = page_align_up(new);
        if new_end > old_end {
            if let Err(err) = self.dir.map_zeroed_range(mem, pmm, old_end, new_end, PageFlags::USER_RW) {
                log::debug!("sbrk({}) failed: {}", increment, err);
                return Err(err.into());
            }
        } else {
            let mut va = new_end;
            while va < old_end {
                if let Err(err) = self.dir.unmap(mem, pmm, va) {
                    log::warn!("sbrk shrink: {}", err);
                }
                va += PAGE_SIZE;
            }
        }
        self.heap_break = new;
        Ok(old)
    }

    pub fn destroy(self, pmm: &mut FrameAllocator) {
        self.dir.destroy(pmm);
    }
}

/// One schedulable unit of execution.
#[derive(Debug)]
pub struct Task {
    /// Process id, unique for the lifetime of the kernel.
    pub pid: Pid,

    pub kind: TaskKind,

    /// Short display name, at most [`TASK_NAME_LEN`] bytes.
    pub name: String,

    pub state: TaskState,

    /// Timer ticks observed while this task was current.
    pub cpu_ticks: u64,

    /// Saved register state. `None` exactly while the task is current or dead.
    pub context: Option<TrapFrame>,

    /// Instruction and stack pointer at the last capture, for introspection.
    pub last_eip: u32,
    pub last_esp: u32,

    /// Address space; `None` for kernel tasks.
    pub space: Option<UserSpace>,

    /// Ring-0 stack; `None` for the idle task, which keeps the boot stack.
    pub kernel_stack: Option<KernelStack>,

    pub fds: FdTable,

    /// Absolute working directory used to resolve relative paths.
    pub cwd: String,

    /// Exit code of a kill requested while this task was not resuming.
    pub pending_kill: Option<i32>,

    /// Task that spawned this one, if any.
    pub parent: Option<Pid>,

    /// Set when a wakeup made this task runnable; it is preferred at the next decision.
    pub boosted: bool,
}

impl Task {
    pub fn new(kind: TaskKind, name: &str, context: Option<TrapFrame>) -> Self {
        let (last_eip, last_esp) = context
            .as_ref()
            .map(|f| (f.eip, f.stack_pointer()))
            .unwrap_or((0, 0));
        Self {
            pid: 0,
            kind,
            name: truncate_name(name),
            state: TaskState::Runnable,
            cpu_ticks: 0,
            context,
            last_eip,
            last_esp,
            space: None,
            kernel_stack: None,
            fds: FdTable::with_console(),
            cwd: String::from("/"),
            pending_kill: None,
            parent: None,
            boosted: false,
        }
    }

    #[inline]
    pub fn is_user(&self) -> bool {
        self.kind == TaskKind::User
    }

    pub fn kernel_stack_top(&self) -> Option<u32> {
        self.kernel_stack.as_ref().map(KernelStack::top)
    }

    /// Applies a state change if the state machine allows it.
    ///
    /// Returns `false` (and leaves the state alone) for an illegal edge.
    pub fn transition(&mut self, next: TaskState) -> bool {
        if !self.state.can_become(&next) {
            log::error!("pid {}: illegal transition {} -> {}", self.pid, self.state, next);
            return false;
        }
        self.state = next;
        true
    }

    /// Stores the register state captured at a trap.
    pub fn save_context(&mut self, frame: TrapFrame) {
        self.last_eip = frame.eip;
        self.last_esp = frame.stack_pointer();
        self.context = Some(frame);
    }

    /// Sets the value the saved context will observe in EAX when resumed.
    pub fn set_resume_value(&mut self, value: u32) {
        if let Some(frame) = self.context.as_mut() {
            frame.set_return(value);
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self.state {
            TaskState::Zombie { exit_code } => Some(exit_code),
            _ => None,
        }
    }
}

fn truncate_name(name: &str) -> String {
    let mut end = name.len().min(TASK_NAME_LEN);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    String::from(&name[..end])
}

/// Snapshot of one task, as reported by introspection calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInfo {
    pub pid: Pid,
    pub user: bool,
    pub state: TaskState,
    pub cpu_ticks: u64,
    pub eip: u32,
    pub esp: u32,
    pub name: String,
}

impl TaskInfo {
    /// Size of `vos_task_info_t`.
    pub const WIRE_SIZE: usize = 52;

    pub fn exit_code(&self) -> i32 {
        match self.state {
            TaskState::Zombie { exit_code } => exit_code,
            _ => 0,
        }
    }

    pub fn to_wire(&self) -> [u8; Self::WIRE_SIZE] {
        let (wake_tick, wait_pid) = match self.state {
            TaskState::Sleeping { wake_tick } => (wake_tick as u32, 0),
            TaskState::Waiting { target } => (0, target),
            _ => (0, 0),
        };
        let words = [
            self.pid,
            self.user as u32,
            self.state.code(),
            self.cpu_ticks as u32,
            self.eip,
            self.esp,
            self.exit_code() as u32,
            wake_tick,
            wait_pid,
        ];
        let mut out = [0u8; Self::WIRE_SIZE];
        for (chunk, word) in out.chunks_exact_mut(4).zip(words.iter()) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        let name = self.name.as_bytes();
        let n = name.len().min(TASK_NAME_LEN);
        out[36..36 + n].copy_from_slice(&name[..n]);
        out
    }
}

impl From<&Task> for TaskInfo {
    fn from(task: &Task) -> Self {
        Self {
            pid: task.pid,
            user: task.is_user(),
            state: task.state,
            cpu_ticks: task.cpu_ticks,
            eip: task.last_eip,
            esp: task.last_esp,
            name: task.name.clone(),
        }
    }
}

/// Number of tasks in each state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateCounts {
    pub runnable: usize,
    pub sleeping: usize,
    pub waiting: usize,
    pub zombie: usize,
}
