//! Syscall gate (`int 0x80`).
//!
//! The dispatcher decodes the number and arguments from the trap frame in
//! `dispatch`. Number and error types live in `types`, checked user-memory
//! transfers in `usercopy`, and the handlers themselves in `fs` and
//! `process`.

pub mod dispatch;
pub mod fs;
pub mod process;
pub mod types;
pub mod usercopy;

pub use dispatch::SyscallArgs;
pub use types::{decode_result, encode_result, Errno, SyscallId, SyscallResult, SBRK_FAILED};
