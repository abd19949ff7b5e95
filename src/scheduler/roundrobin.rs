//! Task table and round-robin selection.
//!
//! The table has a fixed number of slots. Slot 0 always holds the idle task,
//! which never blocks or exits, so selection always finds a runnable task.
//! Selection starts after the current slot and walks the table in slot
//! order. The idle task is chosen only when nothing else can run. Tasks woken
//! by a timer or a child exit are marked `boosted` and win the next decision,
//! so a wakeup is observed at most one tick after it happens.

use alloc::vec::Vec;

use super::task::{Pid, StateCounts, Task, TaskState, IDLE_PID};

/// Slot of the idle task.
pub const IDLE_SLOT: usize = 0;

#[derive(Debug)]
pub struct TaskTable {
    slots: Vec<Option<Task>>,

    /// Slot of the task that is executing. Always occupied.
    current: usize,

    /// Next pid to hand out; every pid below it has been assigned once.
    next_pid: Pid,

    /// Ticks per time slice.
    quantum: u32,

    /// Ticks consumed by the current task since it was selected.
    slice_used: u32,

    /// A wakeup happened on the last tick; the next tick is a scheduling boundary.
    wake_pending: bool,
}

impl TaskTable {
    /// Creates the table with `idle` installed as pid 1 in slot 0.
    pub fn new(capacity: usize, quantum: u32, mut idle: Task) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity.max(1), || None);
        idle.pid = IDLE_PID;
        idle.context = None;
        slots[IDLE_SLOT] = Some(idle);
        Self {
            slots,
            current: IDLE_SLOT,
            next_pid: IDLE_PID + 1,
            quantum: quantum.max(1),
            slice_used: 0,
            wake_pending: false,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn free_slot(&self) -> Option<usize> {
        self.slots.iter().position(Option::is_none)
    }

    /// Installs `task` in `slot` with a fresh pid.
    ///
    /// `slot` must come from [`Self::free_slot`].
    pub fn insert_at(&mut self, slot: usize, mut task: Task) -> Pid {
        let pid = self.next_pid;
        self.next_pid += 1;
        task.pid = pid;
        self.slots[slot] = Some(task);
        pid
    }

    /// Whether `pid` was handed out at some point (it may be gone by now).
    pub fn pid_was_assigned(&self, pid: Pid) -> bool {
        pid != 0 && pid < self.next_pid
    }

    #[inline]
    pub fn current_slot(&self) -> usize {
        self.current
    }

    pub fn current(&self) -> Option<&Task> {
        self.slots.get(self.current).and_then(Option::as_ref)
    }

    pub fn current_mut(&mut self) -> Option<&mut Task> {
        self.slots.get_mut(self.current).and_then(Option::as_mut)
    }

    pub fn current_pid(&self) -> Pid {
        self.current().map(|t| t.pid).unwrap_or(0)
    }

    pub fn get(&self, slot: usize) -> Option<&Task> {
        self.slots.get(slot).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, slot: usize) -> Option<&mut Task> {
        self.slots.get_mut(slot).and_then(Option::as_mut)
    }

    pub fn slot_of(&self, pid: Pid) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.as_ref().is_some_and(|t| t.pid == pid))
    }

    pub fn by_pid(&self, pid: Pid) -> Option<&Task> {
        self.slot_of(pid).and_then(|slot| self.get(slot))
    }

    /// Removes a task from the table. The current slot cannot be removed.
    pub fn remove(&mut self, slot: usize) -> Option<Task> {
        if slot == self.current || slot == IDLE_SLOT {
            return None;
        }
        self.slots.get_mut(slot).and_then(Option::take)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Task> {
        self.slots.iter().filter_map(Option::as_ref)
    }

    /// Slots of tasks blocked in `wait` on `pid`, in slot order.
    pub fn waiters_of(&self, pid: Pid) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(slot, t)| match t {
                Some(t) if t.state == (TaskState::Waiting { target: pid }) => Some(slot),
                _ => None,
            })
            .collect()
    }

    pub fn task_count(&self) -> usize {
        self.iter().count()
    }

    /// The `index`-th occupied slot, counting in slot order.
    pub fn nth(&self, index: usize) -> Option<&Task> {
        self.iter().nth(index)
    }

    pub fn state_counts(&self) -> StateCounts {
        let mut counts = StateCounts::default();
        for task in self.iter() {
            match task.state {
                TaskState::Runnable => counts.runnable += 1,
                TaskState::Sleeping { .. } => counts.sleeping += 1,
                TaskState::Waiting { .. } => counts.waiting += 1,
                TaskState::Zombie { .. } => counts.zombie += 1,
            }
        }
        counts
    }

    /// Marks a blocked task runnable and gives it preference at the next decision.
    pub fn wake(&mut self, slot: usize) -> bool {
        let Some(task) = self.get_mut(slot) else {
            return false;
        };
        if !task.transition(TaskState::Runnable) {
            return false;
        }
        task.boosted = true;
        self.wake_pending = true;
        true
    }

    /// Accounts one timer tick at time `now`.
    ///
    /// Charges the current task, wakes sleepers whose wake tick has been
    /// reached and returns whether this tick is a scheduling boundary.
    pub fn tick(&mut self, now: u64) -> bool {
        // A wakeup from the previous tick forces a decision on this one.
        let mut boundary = core::mem::take(&mut self.wake_pending);

        if let Some(task) = self.current_mut() {
            task.cpu_ticks += 1;
        }

        let due: Vec<usize> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(slot, t)| match t {
                Some(t) if matches!(t.state, TaskState::Sleeping { wake_tick } if wake_tick <= now) => {
                    Some(slot)
                }
                _ => None,
            })
            .collect();
        for slot in due {
            self.wake(slot);
            log::debug!("woke slot {} at tick {}", slot, now);
        }
        // Woken tasks become eligible for the next decision only.
        self.wake_pending = self.slots.iter().flatten().any(|t| t.boosted);

        self.slice_used += 1;
        if self.slice_used >= self.quantum || self.current == IDLE_SLOT {
            boundary = true;
        }
        boundary
    }

    /// Chooses the task to run next.
    ///
    /// Boosted tasks first, then any runnable task, both in slot order after
    /// the current one. The current task is considered last, the idle task
    /// only when nothing else is runnable.
    pub fn pick_next(&self) -> usize {
        let n = self.slots.len();
        let candidates = || (1..=n).map(move |step| (self.current + step) % n);
        let runnable = |slot: usize| {
            slot != IDLE_SLOT && self.get(slot).is_some_and(|t| t.state.is_runnable())
        };

        if let Some(slot) = candidates().find(|&s| runnable(s) && self.get(s).is_some_and(|t| t.boosted)) {
            return slot;
        }
        candidates().find(|&s| runnable(s)).unwrap_or(IDLE_SLOT)
    }

    /// Makes `slot` current and starts a new time slice.
    pub fn set_current(&mut self, slot: usize) {
        self.current = slot;
        self.slice_used = 0;
        if let Some(task) = self.get_mut(slot) {
            task.boosted = false;
        }
    }
}
