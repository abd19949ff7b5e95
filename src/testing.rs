//! Host-side test support.
//!
//! [`MockMachine`] stands in for the CPU: a RAM arena behind
//! [`PhysicalMemory`], a log of port writes, CR3/CR2/TSS state and captured
//! console and serial output. `halt()` panics with `"kernel halted"` so
//! tests can assert on fatal paths with `#[should_panic]`.
//!
//! [`MemVfs`], [`FlatLoader`], [`ScriptedInput`] and [`FixedRtc`] are small
//! collaborators wired in by [`boot`]. The remaining helpers build trap
//! frames the way the trampolines would.
//!
//! Usage from an integration test:
//!
//! ```ignore
//! let mut kernel = testing::boot(KernelConfig::default());
//! let pid = testing::spawn_test_task(&mut kernel, "a");
//! let frame = kernel.dispatch(testing::timer_irq(&testing::idle_frame()));
//! ```

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

use crate::arch::gdt::USER_CODE_SELECTOR;
use crate::arch::idt::{HandlerTable, Idt, EXCEPTION_COUNT, IRQ_BASE, IRQ_LINES, SYSCALL_VECTOR};
use crate::arch::{page_align_up, Machine, PhysAddr, PhysicalMemory, PortIo, TrapFrame};
use crate::config::KernelConfig;
use crate::kernel::{BootInfo, Kernel};
use crate::memory::vmm::{PageDirectory, PageFlags, USER_BASE, USER_STACK_TOP};
use crate::memory::{Frame, MemoryRegion};
use crate::scheduler::Pid;
use crate::services::{
    ConsoleInput, DateTime, DirEntry, FileStat, LoadedImage, OpenFlags, ProgramLoader, Rtc,
    Services, UserMapper, Vfs, VfsHandle, Whence,
};
use crate::syscall::{decode_result, usercopy, Errno, SyscallId, SyscallResult};

/// RAM given to kernels built by [`boot`].
pub const TEST_RAM: u32 = 16 << 20;

/// Physical range [`boot`] reserves as the "kernel image".
pub const TEST_IMAGE: MemoryRegion = MemoryRegion::new(0x0010_0000, 0x0010_0000);

/// Data page mapped by [`spawn_test_task`] for syscall buffers.
pub const TEST_DATA: u32 = USER_BASE + 0x1000;

// ---------------------------------------------------------------------------
// MockMachine
// ---------------------------------------------------------------------------

pub struct MockMachine {
    ram: Vec<u8>,
    interrupts: bool,
    cr3: PhysAddr,
    /// Every value loaded into CR3, in order.
    pub cr3_history: Vec<PhysAddr>,
    /// Value `fault_address()` reports.
    pub cr2: u32,
    pub esp0: u32,
    pub port_writes: Vec<(u16, u8)>,
    pub idt_loads: usize,
    pub waits: usize,
    console: Vec<u8>,
    serial: Vec<u8>,
}

impl MockMachine {
    pub fn new(ram_bytes: usize) -> Self {
        Self {
            ram: vec![0; ram_bytes],
            interrupts: false,
            cr3: PhysAddr(0),
            cr3_history: Vec::new(),
            cr2: 0,
            esp0: 0,
            port_writes: Vec::new(),
            idt_loads: 0,
            waits: 0,
            console: Vec::new(),
            serial: Vec::new(),
        }
    }

    pub fn console_text(&self) -> String {
        String::from_utf8_lossy(&self.console).into_owned()
    }

    pub fn serial_text(&self) -> String {
        String::from_utf8_lossy(&self.serial).into_owned()
    }

    pub fn clear_output(&mut self) {
        self.console.clear();
        self.serial.clear();
    }

    /// Port writes to `port`, oldest first.
    pub fn writes_to(&self, port: u16) -> Vec<u8> {
        self.port_writes
            .iter()
            .filter(|(p, _)| *p == port)
            .map(|&(_, v)| v)
            .collect()
    }
}

impl PhysicalMemory for MockMachine {
    /// Bytes outside the arena read as zero.
    fn read(&self, addr: PhysAddr, buf: &mut [u8]) {
        let start = addr.as_u32() as usize;
        for (i, byte) in buf.iter_mut().enumerate() {
            *byte = self.ram.get(start + i).copied().unwrap_or(0);
        }
    }

    fn write(&mut self, addr: PhysAddr, data: &[u8]) {
        let start = addr.as_u32() as usize;
        let end = start + data.len();
        assert!(end <= self.ram.len(), "physical write {:#x}..{:#x} outside RAM", start, end);
        self.ram[start..end].copy_from_slice(data);
    }
}

impl PortIo for MockMachine {
    fn inb(&mut self, _port: u16) -> u8 {
        0
    }

    fn outb(&mut self, port: u16, value: u8) {
        self.port_writes.push((port, value));
    }
}

impl Machine for MockMachine {
    fn interrupts_enabled(&self) -> bool {
        self.interrupts
    }

    fn disable_interrupts(&mut self) {
        self.interrupts = false;
    }

    fn enable_interrupts(&mut self) {
        self.interrupts = true;
    }

    fn load_page_directory(&mut self, root: PhysAddr) {
        self.cr3 = root;
        self.cr3_history.push(root);
    }

    fn active_page_directory(&self) -> PhysAddr {
        self.cr3
    }

    fn fault_address(&self) -> u32 {
        self.cr2
    }

    fn set_kernel_stack(&mut self, esp0: u32) {
        self.esp0 = esp0;
    }

    fn load_idt(&mut self, _idt: &Idt) {
        self.idt_loads += 1;
    }

    fn console_write(&mut self, bytes: &[u8]) {
        self.console.extend_from_slice(bytes);
    }

    fn serial_write(&mut self, bytes: &[u8]) {
        self.serial.extend_from_slice(bytes);
    }

    fn wait_for_interrupt(&mut self) {
        self.interrupts = true;
        self.waits += 1;
    }

    fn halt(&mut self) -> ! {
        self.interrupts = false;
        panic!("kernel halted");
    }
}

// ---------------------------------------------------------------------------
// MemVfs
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum Node {
    File(Vec<u8>),
    Dir,
}

#[derive(Debug)]
enum OpenKind {
    File { path: String, pos: u32, append: bool },
    Dir { path: String, cursor: usize },
    PipeRead(u32),
    PipeWrite(u32),
}

#[derive(Debug)]
struct OpenFile {
    kind: OpenKind,
    refs: u32,
}

/// In-memory filesystem with files, directories and pipes.
#[derive(Debug, Default)]
pub struct MemVfs {
    nodes: BTreeMap<String, Node>,
    open: BTreeMap<VfsHandle, OpenFile>,
    pipes: BTreeMap<u32, Vec<u8>>,
    next_handle: VfsHandle,
    next_pipe: u32,
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(i) => &path[..i],
    }
}

impl MemVfs {
    pub fn new() -> Self {
        let mut vfs = Self {
            next_handle: 3,
            ..Self::default()
        };
        vfs.nodes.insert(String::from("/"), Node::Dir);
        vfs
    }

    /// Adds a file, creating missing parent directories.
    pub fn with_file(mut self, path: &str, data: &[u8]) -> Self {
        let mut parent = parent_of(path);
        while parent != "/" {
            self.nodes.entry(String::from(parent)).or_insert(Node::Dir);
            parent = parent_of(parent);
        }
        self.nodes.insert(String::from(path), Node::File(data.to_vec()));
        self
    }

    pub fn with_dir(mut self, path: &str) -> Self {
        self.nodes.insert(String::from(path), Node::Dir);
        self
    }

    /// Number of live handles.
    pub fn open_handles(&self) -> usize {
        self.open.len()
    }

    pub fn contents(&self, path: &str) -> Option<&[u8]> {
        match self.nodes.get(path) {
            Some(Node::File(data)) => Some(data),
            _ => None,
        }
    }

    fn issue(&mut self, kind: OpenKind) -> VfsHandle {
        let handle = self.next_handle;
        self.next_handle += 1;
        self.open.insert(handle, OpenFile { kind, refs: 1 });
        handle
    }

    fn stat_of(&self, path: &str) -> Result<FileStat, Errno> {
        match self.nodes.get(path).ok_or(Errno::ENOENT)? {
            Node::Dir => Ok(FileStat {
                is_dir: true,
                mode: 0o040_755,
                ..FileStat::default()
            }),
            Node::File(data) => Ok(FileStat {
                mode: 0o100_644,
                size: data.len() as u32,
                ..FileStat::default()
            }),
        }
    }

    fn children(&self, dir: &str) -> Vec<String> {
        self.nodes
            .keys()
            .filter(|p| p.as_str() != "/" && parent_of(p) == dir)
            .cloned()
            .collect()
    }

    fn require_parent_dir(&self, path: &str) -> Result<(), Errno> {
        match self.nodes.get(parent_of(path)) {
            Some(Node::Dir) => Ok(()),
            Some(Node::File(_)) => Err(Errno::ENOTDIR),
            None => Err(Errno::ENOENT),
        }
    }
}

impl Vfs for MemVfs {
    fn open(&mut self, path: &str, flags: OpenFlags) -> Result<VfsHandle, Errno> {
        match self.nodes.get_mut(path) {
            Some(Node::Dir) => {
                if flags.wants_write() {
                    return Err(Errno::EISDIR);
                }
                Ok(self.issue(OpenKind::Dir {
                    path: String::from(path),
                    cursor: 0,
                }))
            }
            Some(Node::File(data)) => {
                if flags.contains(OpenFlags::CREAT | OpenFlags::EXCL) {
                    return Err(Errno::EEXIST);
                }
                if flags.contains(OpenFlags::DIRECTORY) {
                    return Err(Errno::ENOTDIR);
                }
                if flags.contains(OpenFlags::TRUNC) && flags.wants_write() {
                    data.clear();
                }
                Ok(self.issue(OpenKind::File {
                    path: String::from(path),
                    pos: 0,
                    append: flags.contains(OpenFlags::APPEND),
                }))
            }
            None if flags.contains(OpenFlags::CREAT) => {
                self.require_parent_dir(path)?;
                self.nodes.insert(String::from(path), Node::File(Vec::new()));
                Ok(self.issue(OpenKind::File {
                    path: String::from(path),
                    pos: 0,
                    append: flags.contains(OpenFlags::APPEND),
                }))
            }
            None => Err(Errno::ENOENT),
        }
    }

    fn read(&mut self, handle: VfsHandle, buf: &mut [u8]) -> Result<usize, Errno> {
        let file = self.open.get_mut(&handle).ok_or(Errno::EBADF)?;
        match &mut file.kind {
            OpenKind::File { path, pos, .. } => {
                let Some(Node::File(data)) = self.nodes.get(path.as_str()) else {
                    return Err(Errno::ENOENT);
                };
                let start = (*pos as usize).min(data.len());
                let n = buf.len().min(data.len() - start);
                buf[..n].copy_from_slice(&data[start..start + n]);
                *pos += n as u32;
                Ok(n)
            }
            OpenKind::Dir { .. } => Err(Errno::EISDIR),
            OpenKind::PipeRead(id) => {
                let queue = self.pipes.get_mut(id).ok_or(Errno::EPIPE)?;
                let n = buf.len().min(queue.len());
                buf[..n].copy_from_slice(&queue[..n]);
                queue.drain(..n);
                Ok(n)
            }
            OpenKind::PipeWrite(_) => Err(Errno::EBADF),
        }
    }

    fn write(&mut self, handle: VfsHandle, data: &[u8]) -> Result<usize, Errno> {
        let file = self.open.get_mut(&handle).ok_or(Errno::EBADF)?;
        match &mut file.kind {
            OpenKind::File { path, pos, append } => {
                let Some(Node::File(contents)) = self.nodes.get_mut(path.as_str()) else {
                    return Err(Errno::ENOENT);
                };
                if *append {
                    *pos = contents.len() as u32;
                }
                let start = *pos as usize;
                if contents.len() < start + data.len() {
                    contents.resize(start + data.len(), 0);
                }
                contents[start..start + data.len()].copy_from_slice(data);
                *pos += data.len() as u32;
                Ok(data.len())
            }
            OpenKind::Dir { .. } => Err(Errno::EISDIR),
            OpenKind::PipeWrite(id) => {
                self.pipes.get_mut(id).ok_or(Errno::EPIPE)?.extend_from_slice(data);
                Ok(data.len())
            }
            OpenKind::PipeRead(_) => Err(Errno::EBADF),
        }
    }

    fn close(&mut self, handle: VfsHandle) -> Result<(), Errno> {
        let file = self.open.get_mut(&handle).ok_or(Errno::EBADF)?;
        file.refs -= 1;
        if file.refs == 0 {
            self.open.remove(&handle);
        }
        Ok(())
    }

    fn duplicate(&mut self, handle: VfsHandle) -> Result<(), Errno> {
        self.open.get_mut(&handle).ok_or(Errno::EBADF)?.refs += 1;
        Ok(())
    }

    fn lseek(&mut self, handle: VfsHandle, offset: i32, whence: Whence) -> Result<u32, Errno> {
        let file = self.open.get_mut(&handle).ok_or(Errno::EBADF)?;
        let OpenKind::File { path, pos, .. } = &mut file.kind else {
            return Err(Errno::ESPIPE);
        };
        let size = match self.nodes.get(path.as_str()) {
            Some(Node::File(data)) => data.len() as i64,
            _ => return Err(Errno::ENOENT),
        };
        let base = match whence {
            Whence::Set => 0,
            Whence::Cur => *pos as i64,
            Whence::End => size,
        };
        let target = base + offset as i64;
        if target < 0 || target > u32::MAX as i64 {
            return Err(Errno::EINVAL);
        }
        *pos = target as u32;
        Ok(*pos)
    }

    fn fstat(&mut self, handle: VfsHandle) -> Result<FileStat, Errno> {
        match &self.open.get(&handle).ok_or(Errno::EBADF)?.kind {
            OpenKind::File { path, .. } | OpenKind::Dir { path, .. } => {
                let path = path.clone();
                self.stat_of(&path)
            }
            OpenKind::PipeRead(_) | OpenKind::PipeWrite(_) => Ok(FileStat {
                mode: 0o010_600,
                ..FileStat::default()
            }),
        }
    }

    fn stat(&mut self, path: &str) -> Result<FileStat, Errno> {
        self.stat_of(path)
    }

    fn mkdir(&mut self, path: &str) -> Result<(), Errno> {
        if self.nodes.contains_key(path) {
            return Err(Errno::EEXIST);
        }
        self.require_parent_dir(path)?;
        self.nodes.insert(String::from(path), Node::Dir);
        Ok(())
    }

    fn readdir(&mut self, handle: VfsHandle) -> Result<Option<DirEntry>, Errno> {
        let (dir, cursor) = match &self.open.get(&handle).ok_or(Errno::EBADF)?.kind {
            OpenKind::Dir { path, cursor } => (path.clone(), *cursor),
            _ => return Err(Errno::ENOTDIR),
        };
        let Some(child) = self.children(&dir).into_iter().nth(cursor) else {
            return Ok(None);
        };
        let stat = self.stat_of(&child)?;
        if let Some(OpenFile {
            kind: OpenKind::Dir { cursor, .. },
            ..
        }) = self.open.get_mut(&handle)
        {
            *cursor += 1;
        }
        let name = child.rsplit('/').next().unwrap_or("").into();
        Ok(Some(DirEntry { name, stat }))
    }

    fn unlink(&mut self, path: &str) -> Result<(), Errno> {
        match self.nodes.get(path) {
            Some(Node::File(_)) => {
                self.nodes.remove(path);
                Ok(())
            }
            Some(Node::Dir) => Err(Errno::EISDIR),
            None => Err(Errno::ENOENT),
        }
    }

    fn rename(&mut self, from: &str, to: &str) -> Result<(), Errno> {
        if !self.nodes.contains_key(from) {
            return Err(Errno::ENOENT);
        }
        self.require_parent_dir(to)?;
        if let Some(node) = self.nodes.remove(from) {
            self.nodes.insert(String::from(to), node);
        }
        Ok(())
    }

    fn rmdir(&mut self, path: &str) -> Result<(), Errno> {
        match self.nodes.get(path) {
            Some(Node::Dir) if path == "/" => Err(Errno::EPERM),
            Some(Node::Dir) if !self.children(path).is_empty() => Err(Errno::EEXIST),
            Some(Node::Dir) => {
                self.nodes.remove(path);
                Ok(())
            }
            Some(Node::File(_)) => Err(Errno::ENOTDIR),
            None => Err(Errno::ENOENT),
        }
    }

    fn truncate(&mut self, path: &str, len: u32) -> Result<(), Errno> {
        match self.nodes.get_mut(path) {
            Some(Node::File(data)) => {
                data.resize(len as usize, 0);
                Ok(())
            }
            Some(Node::Dir) => Err(Errno::EISDIR),
            None => Err(Errno::ENOENT),
        }
    }

    fn ftruncate(&mut self, handle: VfsHandle, len: u32) -> Result<(), Errno> {
        let path = match &self.open.get(&handle).ok_or(Errno::EBADF)?.kind {
            OpenKind::File { path, .. } => path.clone(),
            _ => return Err(Errno::EINVAL),
        };
        self.truncate(&path, len)
    }

    fn fsync(&mut self, handle: VfsHandle) -> Result<(), Errno> {
        self.open.get(&handle).map(|_| ()).ok_or(Errno::EBADF)
    }

    fn pipe(&mut self) -> Result<(VfsHandle, VfsHandle), Errno> {
        let id = self.next_pipe;
        self.next_pipe += 1;
        self.pipes.insert(id, Vec::new());
        Ok((self.issue(OpenKind::PipeRead(id)), self.issue(OpenKind::PipeWrite(id))))
    }

    fn read_file(&mut self, path: &str, offset: u32, buf: &mut [u8]) -> Result<usize, Errno> {
        match self.nodes.get(path) {
            Some(Node::File(data)) => {
                let start = (offset as usize).min(data.len());
                let n = buf.len().min(data.len() - start);
                buf[..n].copy_from_slice(&data[start..start + n]);
                Ok(n)
            }
            Some(Node::Dir) => Err(Errno::EISDIR),
            None => Err(Errno::ENOENT),
        }
    }
}

// ---------------------------------------------------------------------------
// FlatLoader, ScriptedInput, FixedRtc
// ---------------------------------------------------------------------------

/// Loads a file verbatim at [`USER_BASE`] and enters at its first byte.
#[derive(Debug, Default)]
pub struct FlatLoader;

impl ProgramLoader for FlatLoader {
    fn load(
        &mut self,
        vfs: &mut dyn Vfs,
        path: &str,
        argv: &[String],
        space: &mut UserMapper<'_>,
    ) -> Result<LoadedImage, Errno> {
        let stat = vfs.stat(path)?;
        if stat.is_dir {
            return Err(Errno::EISDIR);
        }
        if stat.size == 0 {
            return Err(Errno::ENOEXEC);
        }
        let mut image = vec![0u8; stat.size as usize];
        let n = vfs.read_file(path, 0, &mut image)?;
        image.truncate(n);

        space.map_region(USER_BASE, image.len() as u32, true)?;
        space.write(USER_BASE, &image)?;
        let stack_pointer = space.push_arguments(space.stack_top(), argv)?;
        Ok(LoadedImage {
            entry: USER_BASE,
            stack_pointer,
            heap_break: page_align_up(USER_BASE + image.len() as u32),
        })
    }
}

/// Keyboard input fed by the test.
#[derive(Debug, Default)]
pub struct ScriptedInput {
    pending: Vec<u8>,
}

impl ScriptedInput {
    pub fn new(bytes: &[u8]) -> Self {
        Self {
            pending: bytes.to_vec(),
        }
    }
}

impl ConsoleInput for ScriptedInput {
    fn read(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        n
    }
}

/// Clock that reports whatever was last set.
#[derive(Debug, Clone, Copy)]
pub struct FixedRtc(pub DateTime);

impl Rtc for FixedRtc {
    fn now(&mut self) -> DateTime {
        self.0
    }

    fn set(&mut self, time: &DateTime) -> Result<(), Errno> {
        self.0 = *time;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Boot and task helpers
// ---------------------------------------------------------------------------

/// Distinct fake trampoline addresses so gate contents can be checked.
pub fn fake_handlers() -> HandlerTable {
    HandlerTable {
        exceptions: core::array::from_fn(|v| 0x0010_1000 + v as u32 * 0x10),
        irqs: core::array::from_fn(|line| 0x0010_2000 + line as u32 * 0x10),
        syscall: 0x0010_3000,
        default: 0x0010_3100,
    }
}

pub fn test_services() -> Services {
    let epoch = DateTime {
        year: 2024,
        month: 1,
        day: 1,
        ..DateTime::default()
    };
    Services::default()
        .with_vfs(MemVfs::new())
        .with_loader(FlatLoader)
        .with_rtc(FixedRtc(epoch))
        .with_input(ScriptedInput::default())
}

/// Boots a kernel on a [`MockMachine`] with [`TEST_RAM`] bytes of RAM.
pub fn boot(config: KernelConfig) -> Kernel<MockMachine> {
    boot_with(config, test_services())
}

pub fn boot_with(config: KernelConfig, services: Services) -> Kernel<MockMachine> {
    let memory = [MemoryRegion::new(0, TEST_RAM)];
    let reserved = [TEST_IMAGE];
    let info = BootInfo {
        memory: &memory,
        reserved: &reserved,
        handlers: fake_handlers(),
    };
    match Kernel::new(MockMachine::new(TEST_RAM as usize), config, info, services) {
        Ok(kernel) => kernel,
        Err(err) => panic!("test kernel failed to boot: {}", err),
    }
}

/// Spawns a user task with one code page, one data page at [`TEST_DATA`]
/// and a guarded stack below [`USER_STACK_TOP`].
pub fn spawn_test_task(kernel: &mut Kernel<MockMachine>, name: &str) -> Pid {
    let mut dir = match kernel.create_user_directory() {
        Ok(dir) => dir,
        Err(err) => panic!("user directory: {}", err),
    };
    let setup = map_test_space(kernel, &mut dir);
    if let Err(err) = setup {
        panic!("mapping test task: {}", err);
    }
    match kernel.spawn_user(name, USER_BASE, USER_STACK_TOP - 16, dir, TEST_DATA + 0x1000) {
        Ok(pid) => pid,
        Err(err) => panic!("spawn_user: {}", err),
    }
}

fn map_test_space(
    kernel: &mut Kernel<MockMachine>,
    dir: &mut PageDirectory,
) -> Result<(), crate::memory::MapError> {
    let Kernel { machine, pmm, .. } = kernel;
    dir.map_zeroed(machine, pmm, USER_BASE, PageFlags::USER_RO)?;
    dir.map_zeroed(machine, pmm, TEST_DATA, PageFlags::USER_RW)?;
    dir.map_guarded_stack(machine, pmm, USER_STACK_TOP, 4)?;
    Ok(())
}

/// Takes frames out of the kernel's pool until at most `keep` are free.
///
/// Hand the result back with [`refill_frames`].
pub fn drain_frames(kernel: &mut Kernel<MockMachine>, keep: u32) -> Vec<Frame> {
    let mut taken = Vec::new();
    while kernel.pmm.free_frames() > keep {
        match kernel.pmm.allocate() {
            Some(frame) => taken.push(frame),
            None => break,
        }
    }
    taken
}

pub fn refill_frames(kernel: &mut Kernel<MockMachine>, frames: Vec<Frame>) {
    kernel.pmm.release_all(frames);
}

/// Reads `len` bytes of task `pid`'s memory through its page tables.
pub fn peek(kernel: &Kernel<MockMachine>, pid: Pid, va: u32, len: usize) -> Result<Vec<u8>, Errno> {
    let space = kernel
        .tasks
        .by_pid(pid)
        .and_then(|t| t.space.as_ref())
        .ok_or(Errno::ESRCH)?;
    usercopy::read_user_bytes(&space.dir, &kernel.machine, va, len)
}

/// Writes into task `pid`'s memory through its page tables.
pub fn poke(kernel: &mut Kernel<MockMachine>, pid: Pid, va: u32, data: &[u8]) -> Result<(), Errno> {
    let slot = kernel.tasks.slot_of(pid).ok_or(Errno::ESRCH)?;
    let Kernel { tasks, machine, .. } = kernel;
    let space = tasks
        .get(slot)
        .and_then(|t| t.space.as_ref())
        .ok_or(Errno::ESRCH)?;
    space.dir.write_bytes(machine, va, data).map_err(Errno::from)
}

/// Writes a NUL-terminated string into task memory and returns its address.
pub fn poke_str(kernel: &mut Kernel<MockMachine>, pid: Pid, va: u32, s: &str) -> u32 {
    let mut bytes = s.as_bytes().to_vec();
    bytes.push(0);
    if let Err(errno) = poke(kernel, pid, va, &bytes) {
        panic!("poke_str at {:#x}: {}", va, errno);
    }
    va
}

// ---------------------------------------------------------------------------
// Trap frames
// ---------------------------------------------------------------------------

/// The boot context as the trampoline would capture it on the first timer IRQ.
pub fn idle_frame() -> TrapFrame {
    TrapFrame::kernel_entry(0x0010_0400, 0x0009_0000)
}

/// `from` interrupted by PIC line `line`.
pub fn irq(from: &TrapFrame, line: u8) -> TrapFrame {
    TrapFrame {
        int_no: IRQ_BASE + line as u32,
        err_code: 0,
        ..*from
    }
}

pub fn timer_irq(from: &TrapFrame) -> TrapFrame {
    irq(from, 0)
}

/// `from` executing `int 0x80` with `number` and up to five arguments.
pub fn syscall(from: &TrapFrame, number: SyscallId, args: &[u32]) -> TrapFrame {
    raw_syscall(from, number as u32, args)
}

pub fn raw_syscall(from: &TrapFrame, number: u32, args: &[u32]) -> TrapFrame {
    let arg = |i: usize| args.get(i).copied().unwrap_or(0);
    TrapFrame {
        eax: number,
        ebx: arg(0),
        ecx: arg(1),
        edx: arg(2),
        esi: arg(3),
        edi: arg(4),
        int_no: SYSCALL_VECTOR,
        err_code: 0,
        ..*from
    }
}

/// `from` raising CPU exception `vector` with `err_code`.
pub fn exception(from: &TrapFrame, vector: u32, err_code: u32) -> TrapFrame {
    debug_assert!(vector < EXCEPTION_COUNT);
    TrapFrame {
        int_no: vector,
        err_code,
        ..*from
    }
}

/// Whether `frame` would resume in ring 3.
pub fn is_user_frame(frame: &TrapFrame) -> bool {
    frame.cs == USER_CODE_SELECTOR as u32
}

/// Number of PIC lines, re-exported for tests that sweep every line.
pub const PIC_LINES: usize = IRQ_LINES;

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

/// Plays the trampoline: feeds the frame returned by one dispatch into the next.
pub struct Driver {
    pub kernel: Kernel<MockMachine>,
    /// Frame of whatever is executing right now.
    pub frame: TrapFrame,
}

impl Driver {
    pub fn new(config: KernelConfig) -> Self {
        Self::with_services(config, test_services())
    }

    pub fn with_services(config: KernelConfig, services: Services) -> Self {
        Self {
            kernel: boot_with(config, services),
            frame: idle_frame(),
        }
    }

    pub fn spawn(&mut self, name: &str) -> Pid {
        spawn_test_task(&mut self.kernel, name)
    }

    /// Delivers one timer tick and returns the pid now executing.
    pub fn tick(&mut self) -> Pid {
        self.frame = self.kernel.dispatch(timer_irq(&self.frame));
        self.kernel.current_pid()
    }

    /// Issues a syscall from the current frame and returns the pid now executing.
    pub fn syscall(&mut self, id: SyscallId, args: &[u32]) -> Pid {
        self.frame = self.kernel.dispatch(syscall(&self.frame, id, args));
        self.kernel.current_pid()
    }

    /// Issues a syscall that is expected to return to the caller and decodes EAX.
    pub fn call(&mut self, id: SyscallId, args: &[u32]) -> SyscallResult {
        let caller = self.kernel.current_pid();
        let now = self.syscall(id, args);
        assert_eq!(now, caller, "{:?} switched away from pid {}", id, caller);
        decode_result(self.frame.eax)
    }

    /// Ticks until `pid` executes; returns the number of ticks it took.
    pub fn run_until(&mut self, pid: Pid, limit: usize) -> usize {
        for n in 1..=limit {
            if self.tick() == pid {
                return n;
            }
        }
        panic!("pid {} not scheduled within {} ticks", pid, limit);
    }

    pub fn poke(&mut self, va: u32, data: &[u8]) {
        let pid = self.kernel.current_pid();
        if let Err(errno) = poke(&mut self.kernel, pid, va, data) {
            panic!("poke at {:#x}: {}", va, errno);
        }
    }

    pub fn poke_str(&mut self, va: u32, s: &str) -> u32 {
        let pid = self.kernel.current_pid();
        poke_str(&mut self.kernel, pid, va, s)
    }

    pub fn peek(&self, va: u32, len: usize) -> Vec<u8> {
        match peek(&self.kernel, self.kernel.current_pid(), va, len) {
            Ok(bytes) => bytes,
            Err(errno) => panic!("peek at {:#x}: {}", va, errno),
        }
    }
}
