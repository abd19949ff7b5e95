//! Task table, round-robin policy and the task lifecycle.

pub mod lifecycle;
pub mod roundrobin;
pub mod task;

use core::fmt;

pub use roundrobin::{TaskTable, IDLE_SLOT};
pub use task::{
    KernelStack, Pid, StateCounts, Task, TaskInfo, TaskKind, TaskState, UserSpace, IDLE_PID,
};

use crate::memory::MapError;
use crate::syscall::Errno;

/// Reasons a task could not be created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnError {
    /// Every slot of the task table is occupied.
    TableFull,

    /// No frames left for the kernel stack.
    OutOfMemory,

    /// Building the address space failed.
    Map(MapError),

    /// The program loader rejected the image.
    Load(Errno),
}

impl fmt::Display for SpawnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TableFull => write!(f, "task table is full"),
            Self::OutOfMemory => write!(f, "out of memory for kernel stack"),
            Self::Map(err) => write!(f, "address space setup failed: {}", err),
            Self::Load(errno) => write!(f, "program load failed: {}", errno),
        }
    }
}

impl From<MapError> for SpawnError {
    fn from(err: MapError) -> Self {
        Self::Map(err)
    }
}

impl From<SpawnError> for Errno {
    fn from(err: SpawnError) -> Self {
        match err {
            SpawnError::TableFull => Errno::EAGAIN,
            SpawnError::OutOfMemory => Errno::ENOMEM,
            SpawnError::Map(map) => map.into(),
            SpawnError::Load(errno) => errno,
        }
    }
}

impl From<MapError> for Errno {
    fn from(err: MapError) -> Self {
        match err {
            MapError::OutOfFrames => Errno::ENOMEM,
            MapError::AlreadyMapped { .. } => Errno::EEXIST,
            _ => Errno::EFAULT,
        }
    }
}
