//! Boot-time kernel configuration.

use core::fmt;

use log::LevelFilter;

pub const DEFAULT_TIMER_HZ: u32 = 1000;
pub const DEFAULT_QUANTUM_TICKS: u32 = 10;
pub const DEFAULT_MAX_TASKS: usize = 32;
pub const DEFAULT_KERNEL_STACK_PAGES: usize = 4;
pub const DEFAULT_USER_STACK_PAGES: usize = 64;
pub const DEFAULT_MAX_USER_STRING: usize = 256;
pub const DEFAULT_MAX_SPAWN_ARGS: usize = 32;
pub const DEFAULT_BACKTRACE_DEPTH: usize = 16;

/// Tunables fixed for the lifetime of a [`crate::Kernel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelConfig {
    /// Requested PIT interrupt frequency.
    pub timer_hz: u32,
    /// Timer ticks per round-robin time slice.
    pub quantum_ticks: u32,
    /// Task table capacity, idle task included.
    pub max_tasks: usize,
    /// Contiguous frames backing each task's kernel stack.
    pub kernel_stack_pages: usize,
    /// Pages mapped for a guarded user stack.
    pub user_stack_pages: usize,
    /// Upper bound for user strings, terminating NUL included.
    pub max_user_string: usize,
    /// Upper bound for argv entries accepted by spawn-by-path.
    pub max_spawn_args: usize,
    /// Frames walked by diagnostic backtraces.
    pub backtrace_depth: usize,
    pub log_level: LevelFilter,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            timer_hz: DEFAULT_TIMER_HZ,
            quantum_ticks: DEFAULT_QUANTUM_TICKS,
            max_tasks: DEFAULT_MAX_TASKS,
            kernel_stack_pages: DEFAULT_KERNEL_STACK_PAGES,
            user_stack_pages: DEFAULT_USER_STACK_PAGES,
            max_user_string: DEFAULT_MAX_USER_STRING,
            max_spawn_args: DEFAULT_MAX_SPAWN_ARGS,
            backtrace_depth: DEFAULT_BACKTRACE_DEPTH,
            log_level: LevelFilter::Info,
        }
    }
}

impl KernelConfig {
    pub fn with_timer_hz(mut self, hz: u32) -> Self {
        self.timer_hz = hz;
        self
    }

    pub fn with_quantum_ticks(mut self, ticks: u32) -> Self {
        self.quantum_ticks = ticks;
        self
    }

    pub fn with_max_tasks(mut self, max_tasks: usize) -> Self {
        self.max_tasks = max_tasks;
        self
    }

    pub fn with_kernel_stack_pages(mut self, pages: usize) -> Self {
        self.kernel_stack_pages = pages;
        self
    }

    pub fn with_user_stack_pages(mut self, pages: usize) -> Self {
        self.user_stack_pages = pages;
        self
    }

    pub fn with_log_level(mut self, level: LevelFilter) -> Self {
        self.log_level = level;
        self
    }

    /// Rejects combinations the scheduler and memory manager cannot honor.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timer_hz == 0 {
            return Err(ConfigError::ZeroTimerFrequency);
        }
        if self.quantum_ticks == 0 {
            return Err(ConfigError::ZeroQuantum);
        }
        if self.max_tasks < 2 {
            return Err(ConfigError::TaskTableTooSmall(self.max_tasks));
        }
        if self.kernel_stack_pages == 0 || self.user_stack_pages == 0 {
            return Err(ConfigError::ZeroStackSize);
        }
        if self.max_user_string < 2 {
            return Err(ConfigError::StringLimitTooSmall(self.max_user_string));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    ZeroTimerFrequency,
    ZeroQuantum,
    /// The idle task needs one slot and at least one more is required for work.
    TaskTableTooSmall(usize),
    ZeroStackSize,
    StringLimitTooSmall(usize),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ZeroTimerFrequency => write!(f, "timer frequency must be non-zero"),
            Self::ZeroQuantum => write!(f, "scheduler quantum must be at least one tick"),
            Self::TaskTableTooSmall(n) => write!(f, "task table capacity {} is below 2", n),
            Self::ZeroStackSize => write!(f, "stack sizes must be at least one page"),
            Self::StringLimitTooSmall(n) => write!(f, "user string limit {} is below 2", n),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert_eq!(KernelConfig::default().validate(), Ok(()));
    }

    #[test]
    fn zero_quantum_is_rejected() {
        let cfg = KernelConfig::default().with_quantum_ticks(0);
        assert_eq!(cfg.validate(), Err(ConfigError::ZeroQuantum));
    }

    #[test]
    fn single_slot_table_is_rejected() {
        let cfg = KernelConfig::default().with_max_tasks(1);
        assert_eq!(cfg.validate(), Err(ConfigError::TaskTableTooSmall(1)));
    }
}
