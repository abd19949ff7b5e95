//! Task lifecycle on top of [`Kernel`]: spawn, preemption, blocking calls,
//! exit, kill and reaping.
//!
//! Every operation that changes which task runs next takes the interrupted
//! frame by value and returns the frame to resume. A task's saved context is
//! `Some` exactly while it is not executing; the running task's registers
//! live in the frame that flows through these calls.

use alloc::string::String;
use alloc::vec::Vec;

use crate::arch::{Machine, TrapFrame};
use crate::kernel::Kernel;
use crate::memory::vmm::{PageDirectory, USER_STACK_TOP};
use crate::scheduler::{
    KernelStack, Pid, SpawnError, Task, TaskKind, TaskState, UserSpace, IDLE_PID, IDLE_SLOT,
};
use crate::services::UserMapper;
use crate::sync::without_interrupts;
use crate::syscall::{encode_result, Errno};

impl<M: Machine> Kernel<M> {
    // ---------------------------------------------------------------------
    // Spawning
    // ---------------------------------------------------------------------

    /// Creates a user task from an already populated address space.
    ///
    /// On failure `dir` is destroyed, so the caller never keeps a half-owned
    /// directory around.
    pub fn spawn_user(
        &mut self,
        name: &str,
        entry: u32,
        user_sp: u32,
        dir: PageDirectory,
        heap_break: u32,
    ) -> Result<Pid, SpawnError> {
        let space = UserSpace::new(dir, heap_break, None);
        self.install_user_task(name, entry, user_sp, space, None)
    }

    /// Creates a ring-0 task running `entry` on its own kernel stack.
    pub fn spawn_kernel(&mut self, name: &str, entry: u32) -> Result<Pid, SpawnError> {
        let slot = self.tasks.free_slot().ok_or(SpawnError::TableFull)?;
        let stack = KernelStack::allocate(&mut self.pmm, self.config.kernel_stack_pages)
            .ok_or(SpawnError::OutOfMemory)?;
        let context = TrapFrame::kernel_entry(entry, stack.top());
        let mut task = Task::new(TaskKind::Kernel, name, Some(context));
        task.kernel_stack = Some(stack);
        task.parent = Some(self.tasks.current_pid());

        let pid = without_interrupts(&mut self.machine, |_| self.tasks.insert_at(slot, task));
        log::info!("spawned kernel task {} '{}' entry={:#x}", pid, name, entry);
        Ok(pid)
    }

    /// Loads the executable at `path` into a fresh address space and starts it.
    ///
    /// `argv` is laid out on the new task's stack; the caller becomes the
    /// parent. Any failure releases everything built so far.
    pub fn spawn_path(&mut self, path: &str, argv: &[String]) -> Result<Pid, SpawnError> {
        if self.tasks.free_slot().is_none() {
            return Err(SpawnError::TableFull);
        }
        let mut dir = self.create_user_directory()?;
        let stack = match dir.map_guarded_stack(
            &mut self.machine,
            &mut self.pmm,
            USER_STACK_TOP,
            self.config.user_stack_pages as u32,
        ) {
            Ok(stack) => stack,
            Err(err) => {
                dir.destroy(&mut self.pmm);
                return Err(err.into());
            }
        };

        let loaded = {
            let mut mapper = UserMapper::new(&mut dir, &mut self.machine, &mut self.pmm, stack.top);
            self.services
                .loader
                .load(self.services.vfs.as_mut(), path, argv, &mut mapper)
        };
        let image = match loaded {
            Ok(image) => image,
            Err(errno) => {
                log::debug!("spawn '{}' failed: {}", path, errno);
                dir.destroy(&mut self.pmm);
                return Err(SpawnError::Load(errno));
            }
        };

        let name = path.rsplit('/').next().unwrap_or(path);
        let space = UserSpace::new(dir, image.heap_break, Some(stack));
        let parent = Some(self.tasks.current_pid());
        self.install_user_task(name, image.entry, image.stack_pointer, space, parent)
    }

    fn install_user_task(
        &mut self,
        name: &str,
        entry: u32,
        user_sp: u32,
        space: UserSpace,
        parent: Option<Pid>,
    ) -> Result<Pid, SpawnError> {
        let Some(slot) = self.tasks.free_slot() else {
            space.destroy(&mut self.pmm);
            return Err(SpawnError::TableFull);
        };
        let Some(stack) = KernelStack::allocate(&mut self.pmm, self.config.kernel_stack_pages) else {
            space.destroy(&mut self.pmm);
            return Err(SpawnError::OutOfMemory);
        };

        let mut task = Task::new(TaskKind::User, name, Some(TrapFrame::user_entry(entry, user_sp)));
        task.space = Some(space);
        task.kernel_stack = Some(stack);
        task.parent = parent;

        let pid = without_interrupts(&mut self.machine, |_| self.tasks.insert_at(slot, task));
        log::info!(
            "spawned user task {} '{}' entry={:#x} sp={:#x}",
            pid,
            name,
            entry,
            user_sp
        );
        Ok(pid)
    }

    // ---------------------------------------------------------------------
    // Switching
    // ---------------------------------------------------------------------

    /// Saves `saved` into the current task (if given) and resumes the task
    /// the round-robin policy picks.
    ///
    /// `None` means the current task has no context worth keeping because it
    /// just became a zombie.
    pub(crate) fn schedule(&mut self, saved: Option<TrapFrame>) -> TrapFrame {
        let prev = self.tasks.current_slot();
        if let (Some(frame), Some(task)) = (saved, self.tasks.current_mut()) {
            if !task.state.is_zombie() {
                task.save_context(frame);
            }
        }

        let next = self.tasks.pick_next();
        if next != prev {
            log::debug!(
                "switch pid {} -> pid {}",
                self.tasks.current_pid(),
                self.tasks.get(next).map(|t| t.pid).unwrap_or(0)
            );
        }
        let frame = self.switch_to(next);

        if let Some(slot) = self.reap_after_switch.take() {
            if slot != self.tasks.current_slot() {
                self.reap(slot);
            } else {
                self.reap_after_switch = Some(slot);
            }
        }
        frame
    }

    /// Makes `slot` current: address space, TSS stack and saved context.
    fn switch_to(&mut self, slot: usize) -> TrapFrame {
        self.tasks.set_current(slot);
        let Some(task) = self.tasks.get_mut(slot) else {
            crate::panic::fatal(&mut self.machine, format_args!("scheduled empty slot {}", slot));
        };

        let root = task
            .space
            .as_ref()
            .map(|space| space.dir.root())
            .unwrap_or_else(|| self.kernel_dir.root());
        let esp0 = task.kernel_stack_top();
        let context = task.context.take();
        let pid = task.pid;

        without_interrupts(&mut self.machine, |m| {
            if m.active_page_directory() != root {
                m.load_page_directory(root);
            }
            if let Some(top) = esp0 {
                m.set_kernel_stack(top);
            }
        });

        match context {
            Some(frame) => frame,
            None => crate::panic::fatal(
                &mut self.machine,
                format_args!("pid {} selected without a saved context", pid),
            ),
        }
    }

    /// Timer preemption entry point, called for every IRQ 0.
    pub(crate) fn on_timer_tick(&mut self, frame: TrapFrame) -> TrapFrame {
        let now = self.timer.tick();
        if self.tasks.tick(now) {
            self.schedule(Some(frame))
        } else {
            frame
        }
    }

    pub(crate) fn yield_current(&mut self, mut frame: TrapFrame) -> TrapFrame {
        frame.set_return(0);
        self.schedule(Some(frame))
    }

    /// Blocks the current task for at least `ms` milliseconds.
    ///
    /// Zero returns immediately without a switch.
    pub(crate) fn sleep_current(&mut self, mut frame: TrapFrame, ms: u32) -> TrapFrame {
        frame.set_return(0);
        let ticks = self.timer.ms_to_ticks(ms);
        if ticks == 0 {
            return frame;
        }
        let wake_tick = self.timer.ticks() + ticks as u64;
        if let Some(task) = self.tasks.current_mut() {
            if task.pid == IDLE_PID {
                return frame;
            }
            task.transition(TaskState::Sleeping { wake_tick });
            log::debug!("pid {} sleeps until tick {}", task.pid, wake_tick);
        }
        self.schedule(Some(frame))
    }

    /// Collects the exit code of `target`, blocking until it exits.
    pub(crate) fn wait_current(&mut self, mut frame: TrapFrame, target: Pid) -> TrapFrame {
        let me = self.tasks.current_pid();
        if let Some(slot) = self.tasks.slot_of(target).filter(|_| target != me) {
            if let Some(code) = self.tasks.get(slot).and_then(Task::exit_code) {
                self.reap(slot);
                frame.set_return(code as u32);
                return frame;
            }
        } else if target != me && self.tasks.pid_was_assigned(target) {
            frame.set_return(encode_result(Err(Errno::ECHILD)));
            return frame;
        }

        // Blocks forever for our own pid or a pid never handed out.
        if let Some(task) = self.tasks.current_mut() {
            if task.pid == IDLE_PID {
                frame.set_return(encode_result(Err(Errno::EINVAL)));
                return frame;
            }
            task.transition(TaskState::Waiting { target });
            log::debug!("pid {} waits for pid {}", task.pid, target);
        }
        self.schedule(Some(frame))
    }

    // ---------------------------------------------------------------------
    // Exit and kill
    // ---------------------------------------------------------------------

    /// Turns the task in `slot` into a zombie and releases what it owns.
    ///
    /// The first task waiting on it receives `code` and reaps it; any other
    /// waiter gets ECHILD.
    pub(crate) fn terminate(&mut self, slot: usize, code: i32) {
        if slot == IDLE_SLOT {
            crate::panic::fatal(&mut self.machine, format_args!("idle task terminated"));
        }
        let Some(task) = self.tasks.get_mut(slot) else {
            return;
        };
        if !task.transition(TaskState::Zombie { exit_code: code }) {
            return;
        }
        let pid = task.pid;
        let space = task.space.take();
        let fds = task.fds.drain();
        task.pending_kill = None;
        log::info!("pid {} exited with code {}", pid, code);

        for handle in fds {
            if let Err(errno) = self.services.vfs.close(handle) {
                log::warn!("pid {}: closing handle {} failed: {}", pid, handle, errno);
            }
        }

        if let Some(space) = space {
            let root = space.dir.root();
            let kernel_root = self.kernel_dir.root();
            without_interrupts(&mut self.machine, |m| {
                if m.active_page_directory() == root {
                    m.load_page_directory(kernel_root);
                }
            });
            space.destroy(&mut self.pmm);
        }

        let waiters = self.tasks.waiters_of(pid);
        for (i, &waiter) in waiters.iter().enumerate() {
            let value = if i == 0 {
                code as u32
            } else {
                encode_result(Err(Errno::ECHILD))
            };
            if let Some(w) = self.tasks.get_mut(waiter) {
                w.set_resume_value(value);
            }
            self.tasks.wake(waiter);
        }

        if !waiters.is_empty() {
            if slot == self.tasks.current_slot() {
                self.reap_after_switch = Some(slot);
            } else {
                self.reap(slot);
            }
        }
    }

    /// Terminates the current task and resumes another one.
    pub(crate) fn exit_current(&mut self, code: i32) -> TrapFrame {
        let slot = self.tasks.current_slot();
        self.terminate(slot, code);
        self.schedule(None)
    }

    /// Requests termination of `pid` with `code`.
    ///
    /// The kill takes effect the next time the target is about to resume.
    /// A blocked target is made runnable so that happens promptly, which
    /// also drops its wait relationship.
    pub fn kill(&mut self, pid: Pid, code: i32) -> Result<(), Errno> {
        let slot = self.tasks.slot_of(pid).ok_or(Errno::ESRCH)?;
        let Some(task) = self.tasks.get_mut(slot) else {
            return Err(Errno::ESRCH);
        };
        if task.state.is_zombie() {
            return Err(Errno::ESRCH);
        }
        if !task.is_user() {
            return Err(Errno::EPERM);
        }
        task.pending_kill = Some(code);
        let blocked = !task.state.is_runnable();
        if blocked {
            self.tasks.wake(slot);
        }
        log::debug!("pid {} marked for kill with code {}", pid, code);
        Ok(())
    }

    /// Frees a zombie's slot. Its kernel stack is released at the next trap.
    fn reap(&mut self, slot: usize) {
        let Some(mut task) = self.tasks.remove(slot) else {
            return;
        };
        if let Some(stack) = task.kernel_stack.take() {
            self.retired_stacks.push(stack);
        }
        log::debug!("reaped pid {}", task.pid);
    }

    /// Pids of every task in slot order, for diagnostics.
    pub fn pids(&self) -> Vec<Pid> {
        self.tasks.iter().map(|t| t.pid).collect()
    }

    pub fn task_state(&self, pid: Pid) -> Option<TaskState> {
        self.tasks.by_pid(pid).map(|t| t.state)
    }
}
