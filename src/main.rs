//! VOS kernel image.
//!
//! Boot order:
//! 1. heap, serial logging
//! 2. GDT/TSS (inside `I386Machine::init`)
//! 3. frame pool, kernel directory, IDT, PIC, PIT (`Kernel::new`)
//! 4. first user program, then interrupts on
//!
//! After that the boot context is the idle task: it halts until the next
//! interrupt and never runs anything itself. Its first `sti; hlt` is where
//! interrupts come on.

#![no_std]
#![no_main]

extern crate alloc;

use alloc::string::String;
use core::panic::PanicInfo;

use spin::{Mutex, Once};

use vos_kernel::arch::i386::boot::{self, MultibootInfo, MULTIBOOT_BOOTLOADER_MAGIC};
use vos_kernel::arch::i386::{cpu, serial, stubs, I386Machine};
use vos_kernel::arch::idt::EXCEPTION_COUNT;
use vos_kernel::arch::TrapFrame;
use vos_kernel::config::DEFAULT_BACKTRACE_DEPTH;
use vos_kernel::interrupts::exceptions::kernel_fault;
use vos_kernel::kernel::BootInfo;
use vos_kernel::memory::heap;
use vos_kernel::services::Services;
use vos_kernel::{Kernel, KernelConfig};

/// Program started as the first user task.
const INIT_PATH: &str = "/bin/init";

static KERNEL: Once<Mutex<Kernel<I386Machine>>> = Once::new();

#[no_mangle]
pub extern "C" fn kernel_main(magic: u32, info_addr: u32) -> ! {
    heap::init();
    let config = KernelConfig::default();
    vos_kernel::logging::init(serial::log_sink, config.log_level);
    log::info!("VOS kernel starting");

    if magic != MULTIBOOT_BOOTLOADER_MAGIC {
        panic!("not loaded by a multiboot loader (magic {:#x})", magic);
    }
    // SAFETY: the magic check above confirms `ebx` carried the info pointer.
    let info = unsafe { MultibootInfo::read(info_addr) };
    let memory = info.memory_regions();
    let reserved = [boot::kernel_image()];
    log::info!(
        "memory: {} KiB low, {} KiB high, image {:#x}+{:#x}",
        info.mem_lower,
        info.mem_upper,
        reserved[0].base,
        reserved[0].len
    );

    let machine = I386Machine::init();
    let boot_info = BootInfo {
        memory: &memory,
        reserved: &reserved,
        handlers: stubs::handler_table(),
    };
    let mut kernel = match Kernel::new(machine, config, boot_info, Services::default()) {
        Ok(kernel) => kernel,
        Err(err) => panic!("boot failed: {}", err),
    };

    match kernel.spawn_path(INIT_PATH, &[String::from(INIT_PATH)]) {
        Ok(pid) => log::info!("started {} as pid {}", INIT_PATH, pid),
        Err(err) => log::warn!("no init program: {}", err),
    }
    log::info!("heap: {} KiB in use", heap::used() / 1024);

    kernel.start();
    KERNEL.call_once(|| Mutex::new(kernel));

    // The kernel lock is free from here on. `sti; hlt` turns interrupts on
    // for the first time, so the pending timer IRQ can take the lock.
    loop {
        cpu::wait_for_interrupt();
    }
}

/// Called by `vos_trap_common` with the frame it just pushed.
///
/// Returns where the frame to resume was written; the trampoline pops it
/// from there.
#[no_mangle]
pub extern "C" fn vos_trap_entry(frame: *mut TrapFrame) -> u32 {
    // SAFETY: the trampoline passes the address of a complete frame on the
    // current stack; ring-0 frames lack the two trailing words, which are
    // never read for them.
    let captured = unsafe { frame.as_ref().copied() };

    let Some(mut kernel) = KERNEL.get().and_then(|lock| lock.try_lock()) else {
        // Boot is not finished, or kernel code faulted while holding the
        // lock. Report from the CPU state alone.
        let mut machine = I386Machine::detached();
        match captured {
            Some(frame) if frame.int_no < EXCEPTION_COUNT => {
                kernel_fault(&mut machine, &frame, None, DEFAULT_BACKTRACE_DEPTH)
            }
            other => vos_kernel::panic::fatal(
                &mut machine,
                format_args!("trap {:?} while the kernel is unavailable", other.map(|f| f.int_no)),
            ),
        }
    };

    let next = kernel.enter(captured);
    let slot = kernel.resume_slot(&next);
    let bytes = next.to_bytes();
    // SAFETY: `slot` lies on the kernel stack of the task being resumed,
    // which is either not in use or holds this very frame above the Rust
    // stack of the current call.
    unsafe {
        core::ptr::copy_nonoverlapping(bytes.as_ptr(), slot as *mut u8, next.restore_len());
    }
    slot
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    let mut machine = I386Machine::detached();
    vos_kernel::panic::report_panic(&mut machine, info)
}
