//! VOS kernel core library.
//!
//! Hosts the interrupt dispatcher, frame allocator, paging manager, task
//! scheduler, syscall dispatcher and pending-work delivery of the i386
//! kernel. The bare-metal binary (`src/main.rs`) links this library and
//! provides the boot glue; integration tests drive the same code through
//! [`testing::MockMachine`].

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod arch;
pub mod config;
pub mod interrupts;
pub mod kernel;
pub mod logging;
pub mod memory;
pub mod panic;
pub mod scheduler;
pub mod services;
pub mod signal;
pub mod sync;
pub mod syscall;
pub mod testing;

pub use config::KernelConfig;
pub use kernel::Kernel;
