//! File-descriptor table, path resolution and the fd-oriented syscalls.
//!
//! Descriptors are per task. Entries either point at the console or hold a
//! VFS handle; the VFS keeps the reference counts behind `dup`/`close`.

use alloc::string::String;
use alloc::vec::Vec;

use crate::arch::Machine;
use crate::kernel::Kernel;
use crate::services::{FileStat, OpenFlags, VfsHandle, Whence};

use super::usercopy::{self, caller_directory};
use super::{Errno, SyscallResult};

/// Descriptor slots per task.
pub const MAX_FDS: usize = 64;

/// Longest absolute path accepted after resolution, NUL excluded.
pub const VOS_PATH_MAX: usize = 256;

pub const TCGETS: u32 = 0x5401;
pub const TCSETS: u32 = 0x5402;
pub const TCSETSW: u32 = 0x5403;
pub const TCSETSF: u32 = 0x5404;
pub const TIOCGWINSZ: u32 = 0x5413;

/// Mode reported by `fstat` on console descriptors (character device, rw).
const CONSOLE_MODE: u16 = 0o020_666;

/// Largest kernel bounce buffer used by a single read.
const MAX_IO: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdEntry {
    Console,
    Handle(VfsHandle),
}

#[derive(Debug, Clone)]
pub struct FdTable {
    slots: [Option<FdEntry>; MAX_FDS],
}

impl Default for FdTable {
    fn default() -> Self {
        Self {
            slots: [None; MAX_FDS],
        }
    }
}

impl FdTable {
    /// Table with fds 0, 1 and 2 bound to the console.
    pub fn with_console() -> Self {
        let mut table = Self::default();
        for slot in table.slots.iter_mut().take(3) {
            *slot = Some(FdEntry::Console);
        }
        table
    }

    pub fn get(&self, fd: u32) -> Option<FdEntry> {
        self.slots.get(fd as usize).copied().flatten()
    }

    /// Puts `entry` in the lowest free slot.
    pub fn install(&mut self, entry: FdEntry) -> Result<u32, Errno> {
        let fd = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(Errno::EMFILE)?;
        self.slots[fd] = Some(entry);
        Ok(fd as u32)
    }

    /// Puts `entry` at `fd` and returns what was there.
    pub fn install_at(&mut self, fd: u32, entry: FdEntry) -> Result<Option<FdEntry>, Errno> {
        let slot = self.slots.get_mut(fd as usize).ok_or(Errno::EBADF)?;
        Ok(slot.replace(entry))
    }

    pub fn take(&mut self, fd: u32) -> Option<FdEntry> {
        self.slots.get_mut(fd as usize).and_then(Option::take)
    }

    /// Empties the table and returns every VFS handle it held.
    pub fn drain(&mut self) -> Vec<VfsHandle> {
        self.slots
            .iter_mut()
            .filter_map(Option::take)
            .filter_map(|entry| match entry {
                FdEntry::Handle(h) => Some(h),
                FdEntry::Console => None,
            })
            .collect()
    }

    pub fn open_count(&self) -> usize {
        self.slots.iter().flatten().count()
    }
}

/// Resolves `path` against `cwd`, folding `.` and `..` segments.
pub fn resolve_path(cwd: &str, path: &str) -> Result<String, Errno> {
    if path.is_empty() {
        return Err(Errno::ENOENT);
    }
    if path.len() > VOS_PATH_MAX {
        return Err(Errno::ENAMETOOLONG);
    }
    let mut parts: Vec<&str> = Vec::new();
    let base = if path.starts_with('/') { "" } else { cwd };
    for segment in base.split('/').chain(path.split('/')) {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            name => parts.push(name),
        }
    }
    let mut out = String::from("/");
    out.push_str(&parts.join("/"));
    if out.len() > VOS_PATH_MAX {
        return Err(Errno::ENAMETOOLONG);
    }
    Ok(out)
}

impl<M: Machine> Kernel<M> {
    fn fd_entry(&self, fd: u32) -> Result<FdEntry, Errno> {
        self.tasks
            .current()
            .and_then(|t| t.fds.get(fd))
            .ok_or(Errno::EBADF)
    }

    fn fd_handle(&self, fd: u32) -> Result<VfsHandle, Errno> {
        match self.fd_entry(fd)? {
            FdEntry::Handle(h) => Ok(h),
            FdEntry::Console => Err(Errno::EINVAL),
        }
    }

    fn install_fd(&mut self, entry: FdEntry) -> Result<u32, Errno> {
        self.tasks
            .current_mut()
            .ok_or(Errno::ESRCH)?
            .fds
            .install(entry)
    }

    /// Copies a path argument and resolves it against the caller's cwd.
    pub(crate) fn user_path(&self, va: u32) -> Result<String, Errno> {
        let dir = caller_directory(&self.tasks)?;
        let raw = usercopy::copy_string_from_user(dir, &self.machine, va, self.config.max_user_string)?;
        let cwd = self.tasks.current().map(|t| t.cwd.as_str()).unwrap_or("/");
        resolve_path(cwd, &raw)
    }

    pub(crate) fn copy_in(&self, va: u32, len: usize) -> Result<Vec<u8>, Errno> {
        let dir = caller_directory(&self.tasks)?;
        usercopy::read_user_bytes(dir, &self.machine, va, len)
    }

    pub(crate) fn copy_out(&mut self, va: u32, data: &[u8]) -> Result<(), Errno> {
        let dir = caller_directory(&self.tasks)?;
        usercopy::copy_to_user(dir, &mut self.machine, va, data)
    }

    fn check_out(&self, va: u32, len: usize) -> Result<(), Errno> {
        let dir = caller_directory(&self.tasks)?;
        usercopy::check_writable(dir, &self.machine, va, len)
    }

    fn check_in(&self, va: u32, len: usize) -> Result<(), Errno> {
        let dir = caller_directory(&self.tasks)?;
        usercopy::check_readable(dir, &self.machine, va, len)
    }

    /// Writes the whole buffer in `MAX_IO` pieces.
    ///
    /// The full range is checked up front. A short or failed write on a
    /// later piece ends the call with the bytes accepted so far.
    pub(crate) fn sys_write(&mut self, fd: u32, buf: u32, len: u32) -> SyscallResult {
        let entry = self.fd_entry(fd)?;
        if len == 0 {
            return Ok(0);
        }
        self.check_in(buf, len as usize)?;

        let mut done = 0u32;
        while done < len {
            let n = (len - done).min(MAX_IO as u32);
            let data = self.copy_in(buf + done, n as usize)?;
            let written = match entry {
                FdEntry::Console => {
                    self.machine.console_write(&data);
                    n
                }
                FdEntry::Handle(h) => match self.services.vfs.write(h, &data) {
                    Ok(w) => w as u32,
                    Err(errno) if done == 0 => return Err(errno),
                    Err(_) => break,
                },
            };
            done += written;
            if written < n {
                break;
            }
        }
        Ok(done)
    }

    pub(crate) fn sys_read(&mut self, fd: u32, buf: u32, len: u32) -> SyscallResult {
        let entry = self.fd_entry(fd)?;
        if len == 0 {
            return Ok(0);
        }
        let len = (len as usize).min(MAX_IO);
        self.check_out(buf, len)?;
        let mut data = alloc::vec![0u8; len];
        let n = match entry {
            FdEntry::Console => match self.services.input.read(&mut data) {
                0 => return Err(Errno::EAGAIN),
                n => n,
            },
            FdEntry::Handle(h) => self.services.vfs.read(h, &mut data)?,
        };
        self.copy_out(buf, &data[..n.min(len)])?;
        Ok(n as u32)
    }

    /// `readfile(path, buf, len, offset)`: one-shot read of a file range.
    pub(crate) fn sys_readfile(&mut self, path: u32, buf: u32, len: u32, offset: u32) -> SyscallResult {
        if len == 0 {
            return Err(Errno::EINVAL);
        }
        let path = self.user_path(path)?;
        let len = (len as usize).min(MAX_IO);
        self.check_out(buf, len)?;
        let mut data = alloc::vec![0u8; len];
        let n = self.services.vfs.read_file(&path, offset, &mut data)?;
        self.copy_out(buf, &data[..n.min(len)])?;
        Ok(n as u32)
    }

    pub(crate) fn sys_open(&mut self, path: u32, flags: u32) -> SyscallResult {
        let path = self.user_path(path)?;
        let flags = OpenFlags::from_bits_truncate(flags);
        let handle = self.services.vfs.open(&path, flags)?;
        match self.install_fd(FdEntry::Handle(handle)) {
            Ok(fd) => Ok(fd),
            Err(errno) => {
                let _ = self.services.vfs.close(handle);
                Err(errno)
            }
        }
    }

    pub(crate) fn sys_close(&mut self, fd: u32) -> SyscallResult {
        let entry = self
            .tasks
            .current_mut()
            .and_then(|t| t.fds.take(fd))
            .ok_or(Errno::EBADF)?;
        match entry {
            FdEntry::Console => Ok(0),
            FdEntry::Handle(h) => self.services.vfs.close(h).map(|()| 0),
        }
    }

    pub(crate) fn sys_lseek(&mut self, fd: u32, offset: u32, whence: u32) -> SyscallResult {
        let whence = Whence::from_raw(whence).ok_or(Errno::EINVAL)?;
        match self.fd_entry(fd)? {
            FdEntry::Console => Err(Errno::ESPIPE),
            FdEntry::Handle(h) => self.services.vfs.lseek(h, offset as i32, whence),
        }
    }

    pub(crate) fn sys_fstat(&mut self, fd: u32, out: u32) -> SyscallResult {
        let stat = match self.fd_entry(fd)? {
            FdEntry::Console => FileStat {
                mode: CONSOLE_MODE,
                ..FileStat::default()
            },
            FdEntry::Handle(h) => self.services.vfs.fstat(h)?,
        };
        self.copy_out(out, &stat.to_wire())?;
        Ok(0)
    }

    pub(crate) fn sys_stat(&mut self, path: u32, out: u32) -> SyscallResult {
        let path = self.user_path(path)?;
        self.check_out(out, FileStat::WIRE_SIZE)?;
        let stat = self.services.vfs.stat(&path)?;
        self.copy_out(out, &stat.to_wire())?;
        Ok(0)
    }

    pub(crate) fn sys_mkdir(&mut self, path: u32) -> SyscallResult {
        let path = self.user_path(path)?;
        self.services.vfs.mkdir(&path).map(|()| 0)
    }

    /// Returns 1 with an entry copied out, 0 at the end of the directory.
    pub(crate) fn sys_readdir(&mut self, fd: u32, out: u32) -> SyscallResult {
        let handle = match self.fd_entry(fd)? {
            FdEntry::Console => return Err(Errno::ENOTDIR),
            FdEntry::Handle(h) => h,
        };
        self.check_out(out, crate::services::DirEntry::WIRE_SIZE)?;
        match self.services.vfs.readdir(handle)? {
            Some(entry) => {
                self.copy_out(out, &entry.to_wire())?;
                Ok(1)
            }
            None => Ok(0),
        }
    }

    pub(crate) fn sys_chdir(&mut self, path: u32) -> SyscallResult {
        let path = self.user_path(path)?;
        let stat = self.services.vfs.stat(&path)?;
        if !stat.is_dir {
            return Err(Errno::ENOTDIR);
        }
        let task = self.tasks.current_mut().ok_or(Errno::ESRCH)?;
        task.cwd = path;
        Ok(0)
    }

    pub(crate) fn sys_getcwd(&mut self, buf: u32, len: u32) -> SyscallResult {
        let mut cwd = self
            .tasks
            .current()
            .map(|t| t.cwd.clone())
            .unwrap_or_else(|| String::from("/"));
        cwd.push('\0');
        if (len as usize) < cwd.len() {
            return Err(Errno::ERANGE);
        }
        self.copy_out(buf, cwd.as_bytes())?;
        Ok(0)
    }

    pub(crate) fn sys_ioctl(&mut self, fd: u32, request: u32, argp: u32) -> SyscallResult {
        match self.fd_entry(fd)? {
            FdEntry::Handle(_) => Err(Errno::ENOTTY),
            FdEntry::Console => match request {
                TIOCGWINSZ => {
                    let (rows, cols) = self.services.input.window_size();
                    let mut ws = [0u8; 8];
                    ws[0..2].copy_from_slice(&rows.to_le_bytes());
                    ws[2..4].copy_from_slice(&cols.to_le_bytes());
                    self.copy_out(argp, &ws)?;
                    Ok(0)
                }
                TCGETS | TCSETS | TCSETSW | TCSETSF => Ok(0),
                _ => Err(Errno::EINVAL),
            },
        }
    }

    pub(crate) fn sys_unlink(&mut self, path: u32) -> SyscallResult {
        let path = self.user_path(path)?;
        self.services.vfs.unlink(&path).map(|()| 0)
    }

    pub(crate) fn sys_rename(&mut self, from: u32, to: u32) -> SyscallResult {
        let from = self.user_path(from)?;
        let to = self.user_path(to)?;
        self.services.vfs.rename(&from, &to).map(|()| 0)
    }

    pub(crate) fn sys_rmdir(&mut self, path: u32) -> SyscallResult {
        let path = self.user_path(path)?;
        self.services.vfs.rmdir(&path).map(|()| 0)
    }

    pub(crate) fn sys_truncate(&mut self, path: u32, len: u32) -> SyscallResult {
        let path = self.user_path(path)?;
        self.services.vfs.truncate(&path, len).map(|()| 0)
    }

    pub(crate) fn sys_ftruncate(&mut self, fd: u32, len: u32) -> SyscallResult {
        let handle = self.fd_handle(fd)?;
        self.services.vfs.ftruncate(handle, len).map(|()| 0)
    }

    pub(crate) fn sys_fsync(&mut self, fd: u32) -> SyscallResult {
        match self.fd_entry(fd)? {
            FdEntry::Console => Ok(0),
            FdEntry::Handle(h) => self.services.vfs.fsync(h).map(|()| 0),
        }
    }

    pub(crate) fn sys_dup(&mut self, fd: u32) -> SyscallResult {
        let entry = self.fd_entry(fd)?;
        if let FdEntry::Handle(h) = entry {
            self.services.vfs.duplicate(h)?;
        }
        match self.install_fd(entry) {
            Ok(new_fd) => Ok(new_fd),
            Err(errno) => {
                if let FdEntry::Handle(h) = entry {
                    let _ = self.services.vfs.close(h);
                }
                Err(errno)
            }
        }
    }

    pub(crate) fn sys_dup2(&mut self, fd: u32, new_fd: u32) -> SyscallResult {
        let entry = self.fd_entry(fd)?;
        if new_fd as usize >= MAX_FDS {
            return Err(Errno::EBADF);
        }
        if fd == new_fd {
            return Ok(new_fd);
        }
        if let FdEntry::Handle(h) = entry {
            self.services.vfs.duplicate(h)?;
        }
        let previous = self
            .tasks
            .current_mut()
            .ok_or(Errno::ESRCH)?
            .fds
            .install_at(new_fd, entry)?;
        if let Some(FdEntry::Handle(old)) = previous {
            let _ = self.services.vfs.close(old);
        }
        Ok(new_fd)
    }

    /// `pipe(fds)`: writes the read end then the write end as two u32 values.
    pub(crate) fn sys_pipe(&mut self, out: u32) -> SyscallResult {
        self.check_out(out, 8)?;
        let (read_end, write_end) = self.services.vfs.pipe()?;
        let read_fd = match self.install_fd(FdEntry::Handle(read_end)) {
            Ok(fd) => fd,
            Err(errno) => {
                let _ = self.services.vfs.close(read_end);
                let _ = self.services.vfs.close(write_end);
                return Err(errno);
            }
        };
        let write_fd = match self.install_fd(FdEntry::Handle(write_end)) {
            Ok(fd) => fd,
            Err(errno) => {
                if let Some(task) = self.tasks.current_mut() {
                    task.fds.take(read_fd);
                }
                let _ = self.services.vfs.close(read_end);
                let _ = self.services.vfs.close(write_end);
                return Err(errno);
            }
        };
        let mut raw = [0u8; 8];
        raw[..4].copy_from_slice(&read_fd.to_le_bytes());
        raw[4..].copy_from_slice(&write_fd.to_le_bytes());
        self.copy_out(out, &raw)?;
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn console_is_preinstalled() {
        let table = FdTable::with_console();
        assert_eq!(table.get(0), Some(FdEntry::Console));
        assert_eq!(table.get(2), Some(FdEntry::Console));
        assert_eq!(table.get(3), None);
        assert_eq!(table.open_count(), 3);
    }

    #[test]
    fn install_takes_lowest_free_slot() {
        let mut table = FdTable::with_console();
        table.take(1);
        assert_eq!(table.install(FdEntry::Handle(9)), Ok(1));
        assert_eq!(table.install(FdEntry::Handle(10)), Ok(3));
    }

    #[test]
    fn full_table_reports_emfile() {
        let mut table = FdTable::default();
        for i in 0..MAX_FDS as u32 {
            table.install(FdEntry::Handle(i)).unwrap();
        }
        assert_eq!(table.install(FdEntry::Console), Err(Errno::EMFILE));
    }

    #[test]
    fn drain_returns_only_vfs_handles() {
        let mut table = FdTable::with_console();
        table.install(FdEntry::Handle(4)).unwrap();
        table.install(FdEntry::Handle(5)).unwrap();
        assert_eq!(table.drain(), [4, 5]);
        assert_eq!(table.open_count(), 0);
    }

    #[test]
    fn paths_resolve_against_cwd() {
        assert_eq!(resolve_path("/home", "notes.txt").unwrap(), "/home/notes.txt");
        assert_eq!(resolve_path("/home/user", "../etc/./rc").unwrap(), "/home/etc/rc");
        assert_eq!(resolve_path("/", "/../..").unwrap(), "/");
        assert_eq!(resolve_path("/a", "/b//c/").unwrap(), "/b/c");
        assert_eq!(resolve_path("/", ""), Err(Errno::ENOENT));
    }

    #[test]
    fn overlong_paths_are_rejected() {
        let long = "x".repeat(VOS_PATH_MAX + 1);
        assert_eq!(resolve_path("/", &long), Err(Errno::ENAMETOOLONG));
    }
}
