//! The kernel state object.
//!
//! Every piece of mutable kernel state (frame pool, kernel page directory,
//! IDT, PIC masks, timer, IRQ registry, task table, collaborators) is a
//! field of [`Kernel`]. It is built once at boot by [`Kernel::new`], in that
//! order, and every trap is handed to it through [`Kernel::dispatch`].

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt;

use crate::arch::idt::{HandlerTable, Idt};
use crate::arch::pic::ChainedPics;
use crate::arch::pit::Timer;
use crate::arch::{Machine, PhysAddr, TrapFrame};
use crate::config::{ConfigError, KernelConfig};
use crate::interrupts::{IrqError, IrqHandler, IrqRegistry, TIMER_LINE};
use crate::memory::pmm::LOW_MEMORY_END;
use crate::memory::vmm::{PageDirectory, KERNEL_IDENTITY_END};
use crate::memory::{FrameAllocator, MapError, MemoryRegion};
use crate::scheduler::{KernelStack, Pid, StateCounts, Task, TaskInfo, TaskKind, TaskTable};
use crate::services::Services;
use crate::sync::without_interrupts;

/// Everything the boot code hands over besides the machine itself.
#[derive(Debug, Clone, Copy)]
pub struct BootInfo<'a> {
    /// Usable RAM reported by the bootloader.
    pub memory: &'a [MemoryRegion],
    /// Ranges that must never be handed out (kernel image, boot modules).
    pub reserved: &'a [MemoryRegion],
    /// Trampoline addresses for the IDT.
    pub handlers: HandlerTable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootError {
    Config(ConfigError),
    /// No usable RAM inside the identity window.
    NoMemory,
    Paging(MapError),
}

impl fmt::Display for BootError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(err) => write!(f, "invalid configuration: {}", err),
            Self::NoMemory => write!(f, "no usable memory below {:#x}", KERNEL_IDENTITY_END),
            Self::Paging(err) => write!(f, "kernel page directory: {}", err),
        }
    }
}

impl From<ConfigError> for BootError {
    fn from(err: ConfigError) -> Self {
        Self::Config(err)
    }
}

impl From<MapError> for BootError {
    fn from(err: MapError) -> Self {
        Self::Paging(err)
    }
}

pub struct Kernel<M: Machine> {
    pub(crate) machine: M,
    pub(crate) config: KernelConfig,
    pub(crate) pmm: FrameAllocator,
    pub(crate) kernel_dir: PageDirectory,
    pub(crate) idt: Box<Idt>,
    pub(crate) pics: ChainedPics,
    pub(crate) timer: Timer,
    pub(crate) irqs: IrqRegistry,
    pub(crate) tasks: TaskTable,
    pub(crate) services: Services,
    /// Kernel stacks of reaped tasks, freed at the next trap entry.
    pub(crate) retired_stacks: Vec<KernelStack>,
    /// Zombie slot whose waiter was woken while it was still current.
    pub(crate) reap_after_switch: Option<usize>,
}

impl<M: Machine> Kernel<M> {
    /// Brings up memory, paging, interrupts and the timer.
    ///
    /// Runs with interrupts disabled and leaves them disabled; the boot
    /// context becomes the idle task. Call [`Kernel::start`] to enable
    /// preemption.
    pub fn new(
        mut machine: M,
        config: KernelConfig,
        boot: BootInfo<'_>,
        services: Services,
    ) -> Result<Self, BootError> {
        config.validate()?;
        machine.disable_interrupts();

        let limit = boot
            .memory
            .iter()
            .map(|r| (r.base as u64 + r.len as u64).min(KERNEL_IDENTITY_END as u64))
            .max()
            .ok_or(BootError::NoMemory)?;
        let mut pmm = FrameAllocator::new(PhysAddr(limit as u32));
        for region in boot.memory {
            pmm.add_region(PhysAddr(region.base), region.len);
        }
        pmm.reserve_region(PhysAddr(0), LOW_MEMORY_END);
        for region in boot.reserved {
            pmm.reserve_region(PhysAddr(region.base), region.len);
        }
        if pmm.free_frames() == 0 {
            return Err(BootError::NoMemory);
        }
        log::info!(
            "pmm: {} of {} frames free",
            pmm.free_frames(),
            pmm.total_frames()
        );

        let kernel_dir = PageDirectory::new_kernel(&mut machine, &mut pmm, KERNEL_IDENTITY_END)?;
        kernel_dir.activate(&mut machine);
        log::info!("paging enabled");

        let idt = Box::new(Idt::from_handlers(&boot.handlers));
        machine.load_idt(&idt);

        let mut pics = ChainedPics::new();
        pics.init(&mut machine);

        let mut timer = Timer::new();
        let hz = timer.start(&mut machine, config.timer_hz);
        log::info!("interrupts: IDT loaded, PIC remapped, PIT at {} Hz", hz);

        let idle = Task::new(TaskKind::Kernel, "idle", None);
        let tasks = TaskTable::new(config.max_tasks, config.quantum_ticks, idle);

        Ok(Self {
            machine,
            config,
            pmm,
            kernel_dir,
            idt,
            pics,
            timer,
            irqs: IrqRegistry::new(),
            tasks,
            services,
            retired_stacks: Vec::new(),
            reap_after_switch: None,
        })
    }

    /// Marks the end of boot.
    ///
    /// Interrupts stay off. The caller enables them only after it has stopped
    /// borrowing the kernel, because the first timer IRQ re-enters it through
    /// the trap entry.
    pub fn start(&mut self) {
        log::info!(
            "scheduler ready with {} task(s), {} free frames",
            self.tasks.task_count(),
            self.pmm.free_frames()
        );
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn machine(&self) -> &M {
        &self.machine
    }

    pub fn machine_mut(&mut self) -> &mut M {
        &mut self.machine
    }

    pub fn frame_allocator(&self) -> &FrameAllocator {
        &self.pmm
    }

    pub fn idt(&self) -> &Idt {
        &self.idt
    }

    pub fn pics(&self) -> &ChainedPics {
        &self.pics
    }

    pub fn timer(&self) -> &Timer {
        &self.timer
    }

    pub fn ticks(&self) -> u64 {
        self.timer.ticks()
    }

    pub fn uptime_ms(&self) -> u64 {
        self.timer.uptime_ms()
    }

    pub fn services_mut(&mut self) -> &mut Services {
        &mut self.services
    }

    // ---------------------------------------------------------------------
    // IRQ registration
    // ---------------------------------------------------------------------

    /// Installs a driver callback on `line` and unmasks the line at the PIC.
    pub fn register_irq(&mut self, line: u8, handler: impl IrqHandler + 'static) -> Result<(), IrqError> {
        let Self {
            machine,
            irqs,
            pics,
            ..
        } = self;
        without_interrupts(machine, |m| {
            irqs.register(line, Box::new(handler))?;
            pics.unmask(m, line);
            Ok(())
        })?;
        log::info!("IRQ {} handler registered", line);
        Ok(())
    }

    pub fn irq_count(&self, line: u8) -> u64 {
        self.irqs.count(line)
    }

    pub fn irq_counts(&self) -> [u64; 16] {
        self.irqs.counts()
    }

    pub fn timer_ticks_seen(&self) -> u64 {
        self.irqs.count(TIMER_LINE)
    }

    // ---------------------------------------------------------------------
    // Paging interface
    // ---------------------------------------------------------------------

    pub fn kernel_directory(&self) -> &PageDirectory {
        &self.kernel_dir
    }

    /// A fresh user directory sharing the kernel mappings.
    pub fn create_user_directory(&mut self) -> Result<PageDirectory, MapError> {
        PageDirectory::new_user(&self.kernel_dir, &mut self.machine, &mut self.pmm)
    }

    /// Loads `dir` into CR3. Only meant for boot and loader code; task
    /// switches load directories on their own.
    pub fn switch_directory(&mut self, dir: &PageDirectory) {
        dir.activate(&mut self.machine);
    }

    /// Returns a directory that never became part of a task to the pool.
    pub fn destroy_directory(&mut self, dir: PageDirectory) {
        if self.machine.active_page_directory() == dir.root() {
            self.kernel_dir.activate(&mut self.machine);
        }
        dir.destroy(&mut self.pmm);
    }

    /// Loader-facing mapper over `dir`.
    pub fn user_mapper<'a>(&'a mut self, dir: &'a mut PageDirectory) -> crate::services::UserMapper<'a> {
        let stack_top = crate::memory::vmm::USER_STACK_TOP;
        crate::services::UserMapper::new(dir, &mut self.machine, &mut self.pmm, stack_top)
    }

    // ---------------------------------------------------------------------
    // Task introspection
    // ---------------------------------------------------------------------

    pub fn current_pid(&self) -> Pid {
        self.tasks.current_pid()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.task_count()
    }

    /// Snapshot of the `index`-th live task in table order.
    pub fn task_info(&self, index: usize) -> Option<TaskInfo> {
        self.tasks.nth(index).map(TaskInfo::from)
    }

    pub fn task_info_by_pid(&self, pid: Pid) -> Option<TaskInfo> {
        self.tasks.by_pid(pid).map(TaskInfo::from)
    }

    pub fn state_counts(&self) -> StateCounts {
        self.tasks.state_counts()
    }

    /// Address at which the trampoline must place `frame` before restoring it.
    pub fn resume_slot(&self, frame: &TrapFrame) -> u32 {
        let top = self
            .tasks
            .current()
            .and_then(Task::kernel_stack_top)
            .unwrap_or(0);
        frame.resume_slot(top)
    }

    /// Releases kernel stacks parked by earlier reaps.
    pub(crate) fn reclaim_retired_stacks(&mut self) {
        for stack in self.retired_stacks.drain(..) {
            stack.release(&mut self.pmm);
        }
    }
}
