//! Collaborator boundary.
//!
//! The filesystem, the program loader, the real-time clock and keyboard
//! input live outside the core. The syscall layer only marshals arguments
//! into these traits and copies results back to user memory.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;

use bitflags::bitflags;

use crate::arch::{PhysicalMemory, PAGE_SIZE};
use crate::memory::vmm::{self, PageDirectory, PageFlags};
use crate::memory::{FrameAllocator, MapError};
use crate::syscall::Errno;

/// Opaque handle issued by the VFS for an open file, directory or pipe end.
pub type VfsHandle = u32;

bitflags! {
    /// `open` flags, numerically identical to newlib's `<sys/_default_fcntl.h>`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const WRONLY    = 0x0001;
        const RDWR      = 0x0002;
        const APPEND    = 0x0008;
        const CREAT     = 0x0200;
        const TRUNC     = 0x0400;
        const EXCL      = 0x0800;
        const DIRECTORY = 0x0020_0000;
    }
}

impl OpenFlags {
    pub const ACCMODE: u32 = 3;

    pub fn wants_write(self) -> bool {
        self.bits() & Self::ACCMODE != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Set,
    Cur,
    End,
}

impl Whence {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Set),
            1 => Some(Self::Cur),
            2 => Some(Self::End),
            _ => None,
        }
    }
}

/// File metadata as reported by the VFS.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileStat {
    pub is_dir: bool,
    pub is_symlink: bool,
    /// POSIX permission bits.
    pub mode: u16,
    pub size: u32,
    /// FAT-style packed time and date of the last write.
    pub wtime: u16,
    pub wdate: u16,
}

impl FileStat {
    /// Size of `vos_stat_t`.
    pub const WIRE_SIZE: usize = 12;

    pub fn to_wire(&self) -> [u8; Self::WIRE_SIZE] {
        let mut out = [0u8; Self::WIRE_SIZE];
        out[0] = self.is_dir as u8;
        out[1] = self.is_symlink as u8;
        out[2..4].copy_from_slice(&self.mode.to_le_bytes());
        out[4..8].copy_from_slice(&self.size.to_le_bytes());
        out[8..10].copy_from_slice(&self.wtime.to_le_bytes());
        out[10..12].copy_from_slice(&self.wdate.to_le_bytes());
        out
    }
}

/// One directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub stat: FileStat,
}

impl DirEntry {
    pub const NAME_LEN: usize = 64;
    /// Size of `vos_dirent_t`.
    pub const WIRE_SIZE: usize = Self::NAME_LEN + FileStat::WIRE_SIZE;

    /// Name truncated to 63 bytes plus NUL, followed by the stat fields.
    pub fn to_wire(&self) -> [u8; Self::WIRE_SIZE] {
        let mut out = [0u8; Self::WIRE_SIZE];
        let name = self.name.as_bytes();
        let n = name.len().min(Self::NAME_LEN - 1);
        out[..n].copy_from_slice(&name[..n]);
        out[Self::NAME_LEN..].copy_from_slice(&self.stat.to_wire());
        out
    }
}

/// Calendar time kept by the RTC.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DateTime {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

impl DateTime {
    /// Meaningful bytes of `vos_rtc_datetime_t` (the C struct pads to 8).
    pub const WIRE_SIZE: usize = 7;

    pub fn to_wire(&self) -> [u8; Self::WIRE_SIZE] {
        let [y0, y1] = self.year.to_le_bytes();
        [y0, y1, self.month, self.day, self.hour, self.minute, self.second]
    }

    pub fn from_wire(raw: &[u8; Self::WIRE_SIZE]) -> Self {
        Self {
            year: u16::from_le_bytes([raw[0], raw[1]]),
            month: raw[2],
            day: raw[3],
            hour: raw[4],
            minute: raw[5],
            second: raw[6],
        }
    }

    pub fn is_valid(&self) -> bool {
        (1..=12).contains(&self.month)
            && (1..=31).contains(&self.day)
            && self.hour < 24
            && self.minute < 60
            && self.second < 60
    }
}

/// Filesystem collaborator. Paths are always absolute and normalised.
pub trait Vfs {
    fn open(&mut self, path: &str, flags: OpenFlags) -> Result<VfsHandle, Errno>;

    fn read(&mut self, handle: VfsHandle, buf: &mut [u8]) -> Result<usize, Errno>;

    fn write(&mut self, handle: VfsHandle, data: &[u8]) -> Result<usize, Errno>;

    /// Drops one reference to `handle`.
    fn close(&mut self, handle: VfsHandle) -> Result<(), Errno>;

    /// Adds one reference to `handle` (dup, dup2, inherited descriptors).
    fn duplicate(&mut self, handle: VfsHandle) -> Result<(), Errno>;

    fn lseek(&mut self, handle: VfsHandle, offset: i32, whence: Whence) -> Result<u32, Errno>;

    fn fstat(&mut self, handle: VfsHandle) -> Result<FileStat, Errno>;

    fn stat(&mut self, path: &str) -> Result<FileStat, Errno>;

    fn mkdir(&mut self, path: &str) -> Result<(), Errno>;

    /// Next entry of an open directory, `None` at the end.
    fn readdir(&mut self, handle: VfsHandle) -> Result<Option<DirEntry>, Errno>;

    fn unlink(&mut self, path: &str) -> Result<(), Errno>;

    fn rename(&mut self, from: &str, to: &str) -> Result<(), Errno>;

    fn rmdir(&mut self, path: &str) -> Result<(), Errno>;

    fn truncate(&mut self, path: &str, len: u32) -> Result<(), Errno>;

    fn ftruncate(&mut self, handle: VfsHandle, len: u32) -> Result<(), Errno>;

    fn fsync(&mut self, handle: VfsHandle) -> Result<(), Errno>;

    /// Returns `(read_end, write_end)`.
    fn pipe(&mut self) -> Result<(VfsHandle, VfsHandle), Errno>;

    /// Reads up to `buf.len()` bytes of `path` starting at `offset`.
    fn read_file(&mut self, path: &str, offset: u32, buf: &mut [u8]) -> Result<usize, Errno>;
}

/// Entry state produced by a [`ProgramLoader`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadedImage {
    pub entry: u32,
    pub stack_pointer: u32,
    /// First byte after the highest loaded segment; the initial heap break.
    pub heap_break: u32,
}

/// Builds a user address space from an executable.
pub trait ProgramLoader {
    /// Maps the image at `path` into `space` and lays out `argv` on its stack.
    fn load(
        &mut self,
        vfs: &mut dyn Vfs,
        path: &str,
        argv: &[String],
        space: &mut UserMapper<'_>,
    ) -> Result<LoadedImage, Errno>;
}

pub trait Rtc {
    fn now(&mut self) -> DateTime;

    fn set(&mut self, time: &DateTime) -> Result<(), Errno>;
}

/// Non-blocking keyboard input for console descriptors.
pub trait ConsoleInput {
    /// Copies pending bytes into `buf`; returns 0 when nothing is buffered.
    fn read(&mut self, buf: &mut [u8]) -> usize;

    /// `(rows, columns)` of the text console.
    fn window_size(&self) -> (u16, u16) {
        (25, 80)
    }
}

/// Paging interface handed to the loader while a new address space is built.
pub struct UserMapper<'a> {
    dir: &'a mut PageDirectory,
    mem: &'a mut dyn PhysicalMemory,
    pmm: &'a mut FrameAllocator,
    stack_top: u32,
}

impl<'a> UserMapper<'a> {
    pub fn new(
        dir: &'a mut PageDirectory,
        mem: &'a mut dyn PhysicalMemory,
        pmm: &'a mut FrameAllocator,
        stack_top: u32,
    ) -> Self {
        Self {
            dir,
            mem,
            pmm,
            stack_top,
        }
    }

    /// Initial stack pointer of the guarded user stack.
    pub fn stack_top(&self) -> u32 {
        self.stack_top
    }

    /// Maps zeroed pages over `[va, va + len)`, skipping pages already mapped.
    pub fn map_region(&mut self, va: u32, len: u32, writable: bool) -> Result<(), MapError> {
        if len == 0 {
            return Ok(());
        }
        let end = va
            .checked_add(len)
            .ok_or(MapError::NotUserRange { virtual_address: va })?;
        let flags = if writable { PageFlags::USER_RW } else { PageFlags::USER_RO };
        self.dir.prepare_range(&mut *self.mem, self.pmm, va, len, flags)?;
        let mut page = crate::arch::page_align_down(va);
        while page < end {
            if self.dir.translate(&*self.mem, page).is_none() {
                self.dir.map_zeroed(&mut *self.mem, self.pmm, page, flags)?;
            }
            page += PAGE_SIZE;
        }
        Ok(())
    }

    /// Copies `data` into already mapped pages.
    pub fn write(&mut self, va: u32, data: &[u8]) -> Result<(), MapError> {
        self.dir.write_bytes(&mut *self.mem, va, data)
    }

    /// Pushes `argv` onto the stack below `sp` and returns the new stack pointer.
    ///
    /// Layout from the returned pointer upwards: `argc`, `argv[0..argc]`,
    /// NULL, an empty `envp` (NULL), then the strings. The pointer is 16-byte
    /// aligned.
    pub fn push_arguments(&mut self, sp: u32, argv: &[String]) -> Result<u32, MapError> {
        let overflow = MapError::GuardPage { virtual_address: sp };
        let mut sp = sp;
        let mut pointers = Vec::with_capacity(argv.len());
        for arg in argv.iter().rev() {
            let len = arg.len() as u32 + 1;
            sp = sp.checked_sub(len).ok_or(overflow)?;
            self.write(sp, arg.as_bytes())?;
            self.write(sp + len - 1, &[0])?;
            pointers.push(sp);
        }
        pointers.reverse();

        let words = 1 + argv.len() as u32 + 1 + 1;
        sp = sp.checked_sub(words * 4).ok_or(overflow)? & !0xF;
        if !vmm::is_user_address(sp) {
            return Err(overflow);
        }

        let mut cursor = sp;
        self.write(cursor, &(argv.len() as u32).to_le_bytes())?;
        cursor += 4;
        for ptr in &pointers {
            self.write(cursor, &ptr.to_le_bytes())?;
            cursor += 4;
        }
        // argv terminator, then envp terminator.
        self.write(cursor, &[0; 8])?;
        Ok(sp)
    }
}

/// Collaborators wired into the kernel at boot.
pub struct Services {
    pub vfs: Box<dyn Vfs + Send>,
    pub loader: Box<dyn ProgramLoader + Send>,
    pub rtc: Box<dyn Rtc + Send>,
    pub input: Box<dyn ConsoleInput + Send>,
}

impl Default for Services {
    fn default() -> Self {
        Self {
            vfs: Box::new(Detached),
            loader: Box::new(Detached),
            rtc: Box::new(Detached),
            input: Box::new(Detached),
        }
    }
}

impl Services {
    pub fn with_vfs(mut self, vfs: impl Vfs + Send + 'static) -> Self {
        self.vfs = Box::new(vfs);
        self
    }

    pub fn with_loader(mut self, loader: impl ProgramLoader + Send + 'static) -> Self {
        self.loader = Box::new(loader);
        self
    }

    pub fn with_rtc(mut self, rtc: impl Rtc + Send + 'static) -> Self {
        self.rtc = Box::new(rtc);
        self
    }

    pub fn with_input(mut self, input: impl ConsoleInput + Send + 'static) -> Self {
        self.input = Box::new(input);
        self
    }
}

/// Placeholder for a collaborator that has not been attached.
#[derive(Debug, Clone, Copy, Default)]
pub struct Detached;

impl Vfs for Detached {
    fn open(&mut self, _: &str, _: OpenFlags) -> Result<VfsHandle, Errno> {
        Err(Errno::ENOENT)
    }
    fn read(&mut self, _: VfsHandle, _: &mut [u8]) -> Result<usize, Errno> {
        Err(Errno::EBADF)
    }
    fn write(&mut self, _: VfsHandle, _: &[u8]) -> Result<usize, Errno> {
        Err(Errno::EBADF)
    }
    fn close(&mut self, _: VfsHandle) -> Result<(), Errno> {
        Err(Errno::EBADF)
    }
    fn duplicate(&mut self, _: VfsHandle) -> Result<(), Errno> {
        Err(Errno::EBADF)
    }
    fn lseek(&mut self, _: VfsHandle, _: i32, _: Whence) -> Result<u32, Errno> {
        Err(Errno::EBADF)
    }
    fn fstat(&mut self, _: VfsHandle) -> Result<FileStat, Errno> {
        Err(Errno::EBADF)
    }
    fn stat(&mut self, _: &str) -> Result<FileStat, Errno> {
        Err(Errno::ENOENT)
    }
    fn mkdir(&mut self, _: &str) -> Result<(), Errno> {
        Err(Errno::EROFS)
    }
    fn readdir(&mut self, _: VfsHandle) -> Result<Option<DirEntry>, Errno> {
        Err(Errno::EBADF)
    }
    fn unlink(&mut self, _: &str) -> Result<(), Errno> {
        Err(Errno::ENOENT)
    }
    fn rename(&mut self, _: &str, _: &str) -> Result<(), Errno> {
        Err(Errno::ENOENT)
    }
    fn rmdir(&mut self, _: &str) -> Result<(), Errno> {
        Err(Errno::ENOENT)
    }
    fn truncate(&mut self, _: &str, _: u32) -> Result<(), Errno> {
        Err(Errno::ENOENT)
    }
    fn ftruncate(&mut self, _: VfsHandle, _: u32) -> Result<(), Errno> {
        Err(Errno::EBADF)
    }
    fn fsync(&mut self, _: VfsHandle) -> Result<(), Errno> {
        Err(Errno::EBADF)
    }
    fn pipe(&mut self) -> Result<(VfsHandle, VfsHandle), Errno> {
        Err(Errno::ENOSYS)
    }
    fn read_file(&mut self, _: &str, _: u32, _: &mut [u8]) -> Result<usize, Errno> {
        Err(Errno::ENOENT)
    }
}

impl ProgramLoader for Detached {
    fn load(
        &mut self,
        _: &mut dyn Vfs,
        _: &str,
        _: &[String],
        _: &mut UserMapper<'_>,
    ) -> Result<LoadedImage, Errno> {
        Err(Errno::ENOEXEC)
    }
}

impl Rtc for Detached {
    fn now(&mut self) -> DateTime {
        DateTime::default()
    }

    fn set(&mut self, _: &DateTime) -> Result<(), Errno> {
        Err(Errno::EPERM)
    }
}

impl ConsoleInput for Detached {
    fn read(&mut self, _: &mut [u8]) -> usize {
        0
    }
}
