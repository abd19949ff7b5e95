use core::fmt;

/// Stable syscall numbers exposed to user mode (`int 0x80`, number in EAX).
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyscallId {
    /// Write bytes to a descriptor.
    Write = 0,
    /// Terminate the calling task.
    Exit = 1,
    /// Give up the rest of the time slice.
    Yield = 2,
    /// Block for a number of milliseconds.
    Sleep = 3,
    /// Block until a task exits and collect its exit code.
    Wait = 4,
    /// Request asynchronous termination of a task.
    Kill = 5,
    /// Grow or shrink the heap break.
    Sbrk = 6,
    /// Read a whole-path file range into a buffer.
    ReadFile = 7,
    Open = 8,
    Read = 9,
    Close = 10,
    Lseek = 11,
    Fstat = 12,
    Stat = 13,
    Mkdir = 14,
    Readdir = 15,
    Chdir = 16,
    Getcwd = 17,
    Ioctl = 18,
    Unlink = 19,
    Rename = 20,
    Rmdir = 21,
    Truncate = 22,
    Ftruncate = 23,
    Fsync = 24,
    Dup = 25,
    Dup2 = 26,
    Pipe = 27,
    GetPid = 28,
    /// Load an executable by path and start it as a child.
    Spawn = 29,
    UptimeMs = 30,
    RtcGet = 31,
    RtcSet = 32,
    TaskCount = 33,
    TaskInfo = 34,
}

impl SyscallId {
    pub fn from_raw(raw: u32) -> Option<Self> {
        use SyscallId::*;
        const TABLE: [SyscallId; 35] = [
            Write, Exit, Yield, Sleep, Wait, Kill, Sbrk, ReadFile, Open, Read, Close, Lseek,
            Fstat, Stat, Mkdir, Readdir, Chdir, Getcwd, Ioctl, Unlink, Rename, Rmdir, Truncate,
            Ftruncate, Fsync, Dup, Dup2, Pipe, GetPid, Spawn, UptimeMs, RtcGet, RtcSet,
            TaskCount, TaskInfo,
        ];
        TABLE.get(raw as usize).copied()
    }
}

/// Kernel error numbers returned to user mode as `-errno`.
#[repr(i32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Errno {
    EPERM = 1,
    ENOENT = 2,
    ESRCH = 3,
    EINTR = 4,
    EIO = 5,
    E2BIG = 7,
    ENOEXEC = 8,
    EBADF = 9,
    ECHILD = 10,
    EAGAIN = 11,
    ENOMEM = 12,
    EACCES = 13,
    EFAULT = 14,
    EEXIST = 17,
    ENOTDIR = 20,
    EISDIR = 21,
    EINVAL = 22,
    EMFILE = 24,
    ENOTTY = 25,
    ESPIPE = 29,
    EROFS = 30,
    EPIPE = 32,
    ERANGE = 34,
    ENOSYS = 88,
    ENAMETOOLONG = 91,
}

impl Errno {
    const ALL: [Errno; 25] = [
        Errno::EPERM,
        Errno::ENOENT,
        Errno::ESRCH,
        Errno::EINTR,
        Errno::EIO,
        Errno::E2BIG,
        Errno::ENOEXEC,
        Errno::EBADF,
        Errno::ECHILD,
        Errno::EAGAIN,
        Errno::ENOMEM,
        Errno::EACCES,
        Errno::EFAULT,
        Errno::EEXIST,
        Errno::ENOTDIR,
        Errno::EISDIR,
        Errno::EINVAL,
        Errno::EMFILE,
        Errno::ENOTTY,
        Errno::ESPIPE,
        Errno::EROFS,
        Errno::EPIPE,
        Errno::ERANGE,
        Errno::ENOSYS,
        Errno::ENAMETOOLONG,
    ];

    #[inline]
    pub const fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.iter().copied().find(|e| e.code() == code)
    }

    pub const fn description(self) -> &'static str {
        match self {
            Errno::EPERM => "operation not permitted",
            Errno::ENOENT => "no such file or directory",
            Errno::ESRCH => "no such task",
            Errno::EINTR => "interrupted",
            Errno::EIO => "I/O error",
            Errno::E2BIG => "argument list too long",
            Errno::ENOEXEC => "exec format error",
            Errno::EBADF => "bad file descriptor",
            Errno::ECHILD => "no such child",
            Errno::EAGAIN => "try again",
            Errno::ENOMEM => "out of memory",
            Errno::EACCES => "permission denied",
            Errno::EFAULT => "bad address",
            Errno::EEXIST => "file exists",
            Errno::ENOTDIR => "not a directory",
            Errno::EISDIR => "is a directory",
            Errno::EINVAL => "invalid argument",
            Errno::EMFILE => "too many open files",
            Errno::ENOTTY => "not a terminal",
            Errno::ESPIPE => "illegal seek",
            Errno::EROFS => "read-only file system",
            Errno::EPIPE => "broken pipe",
            Errno::ERANGE => "result out of range",
            Errno::ENOSYS => "function not implemented",
            Errno::ENAMETOOLONG => "name too long",
        }
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.description(), self.code())
    }
}

pub type SyscallResult = Result<u32, Errno>;

/// Value `sbrk` returns on failure, `(void*)-1`.
pub const SBRK_FAILED: u32 = u32::MAX;

/// Encodes a result into EAX: the value itself, or `-errno` as two's complement.
#[inline]
pub fn encode_result(result: SyscallResult) -> u32 {
    match result {
        Ok(value) => value,
        Err(errno) => (-errno.code()) as u32,
    }
}

/// Reverses [`encode_result`]. Values in `-4095..=-1` that name a known errno decode as errors.
pub fn decode_result(raw: u32) -> SyscallResult {
    let signed = raw as i32;
    if (-4095..0).contains(&signed) {
        if let Some(errno) = Errno::from_code(-signed) {
            return Err(errno);
        }
    }
    Ok(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbering_matches_user_header() {
        assert_eq!(SyscallId::from_raw(0), Some(SyscallId::Write));
        assert_eq!(SyscallId::from_raw(7), Some(SyscallId::ReadFile));
        assert_eq!(SyscallId::from_raw(27), Some(SyscallId::Pipe));
        assert_eq!(SyscallId::from_raw(34), Some(SyscallId::TaskInfo));
        assert_eq!(SyscallId::from_raw(35), None);
        for raw in 0..35u32 {
            assert_eq!(SyscallId::from_raw(raw).map(|id| id as u32), Some(raw));
        }
    }

    #[test]
    fn errors_encode_as_negative() {
        assert_eq!(encode_result(Err(Errno::EFAULT)), (-14i32) as u32);
        assert_eq!(decode_result((-14i32) as u32), Err(Errno::EFAULT));
        assert_eq!(decode_result(7), Ok(7));
    }
}
