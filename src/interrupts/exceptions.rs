//! CPU exception names and diagnostic dumps.

use alloc::vec::Vec;
use core::fmt::{self, Write};

use crate::arch::idt::{EXCEPTION_COUNT, EXCEPTION_PAGE_FAULT};
use crate::arch::{Machine, PhysAddr, TrapFrame};
use crate::logging::DiagnosticWriter;
use crate::memory::vmm::KERNEL_IDENTITY_END;
use crate::memory::PageFaultCode;

static EXCEPTION_NAMES: [&str; EXCEPTION_COUNT as usize] = [
    "Division By Zero",
    "Debug",
    "Non Maskable Interrupt",
    "Breakpoint",
    "Overflow",
    "Bound Range Exceeded",
    "Invalid Opcode",
    "Device Not Available",
    "Double Fault",
    "Coprocessor Segment Overrun",
    "Invalid TSS",
    "Segment Not Present",
    "Stack Segment Fault",
    "General Protection Fault",
    "Page Fault",
    "Reserved",
    "x87 Floating-Point Exception",
    "Alignment Check",
    "Machine Check",
    "SIMD Floating-Point Exception",
    "Virtualization Exception",
    "Control Protection Exception",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Hypervisor Injection Exception",
    "VMM Communication Exception",
    "Security Exception",
    "Reserved",
];

/// Exit code of a divide-error kill, kept distinct from `exit(0)`.
pub const DIVIDE_ERROR_EXIT_CODE: i32 = -256;

pub fn exception_name(vector: u32) -> &'static str {
    EXCEPTION_NAMES
        .get(vector as usize)
        .copied()
        .unwrap_or("Unknown Exception")
}

/// Exit code recorded for a user task killed by exception `vector`.
pub fn exit_code_for(vector: u32) -> i32 {
    if vector == 0 {
        DIVIDE_ERROR_EXIT_CODE
    } else {
        -(vector as i32)
    }
}

/// Return addresses collected by walking the saved-EBP chain.
///
/// Each frame is `[ebp] = caller ebp`, `[ebp + 4] = return address`. The walk
/// stops at a null or misaligned EBP, a chain that does not move strictly
/// upwards, an unreadable address, or after `depth` frames.
pub fn backtrace(ebp: u32, depth: usize, mut read_u32: impl FnMut(u32) -> Option<u32>) -> Vec<u32> {
    let mut frames = Vec::new();
    let mut ebp = ebp;
    while frames.len() < depth && ebp != 0 && ebp % 4 == 0 {
        let Some(ret_slot) = ebp.checked_add(4) else {
            break;
        };
        let (Some(next), Some(ret)) = (read_u32(ebp), read_u32(ret_slot)) else {
            break;
        };
        if ret == 0 {
            break;
        }
        frames.push(ret);
        if next <= ebp {
            break;
        }
        ebp = next;
    }
    frames
}

/// Writes the general, segment and control registers of `frame`.
pub fn write_registers(out: &mut impl Write, frame: &TrapFrame) -> fmt::Result {
    writeln!(
        out,
        "  int_no={:#04x} err={:#010x} eip={:#010x} cs={:#06x} eflags={:#010x}",
        frame.int_no, frame.err_code, frame.eip, frame.cs, frame.eflags
    )?;
    writeln!(
        out,
        "  eax={:#010x} ebx={:#010x} ecx={:#010x} edx={:#010x}",
        frame.eax, frame.ebx, frame.ecx, frame.edx
    )?;
    writeln!(
        out,
        "  esi={:#010x} edi={:#010x} ebp={:#010x} esp={:#010x}",
        frame.esi, frame.edi, frame.ebp, frame.esp
    )?;
    writeln!(
        out,
        "  ds={:#06x} es={:#06x} fs={:#06x} gs={:#06x}",
        frame.ds, frame.es, frame.fs, frame.gs
    )?;
    if frame.from_user() {
        writeln!(out, "  user esp={:#010x} ss={:#06x}", frame.useresp, frame.ss)?;
    }
    Ok(())
}

pub fn write_page_fault(out: &mut impl Write, code: PageFaultCode, address: u32) -> fmt::Result {
    writeln!(
        out,
        "  page fault at {:#010x}: present={} write={} user={} reserved={} ifetch={} ({})",
        address,
        code.contains(PageFaultCode::PRESENT) as u8,
        code.contains(PageFaultCode::WRITE) as u8,
        code.contains(PageFaultCode::USER) as u8,
        code.contains(PageFaultCode::RESERVED_WRITE) as u8,
        code.contains(PageFaultCode::INSTRUCTION_FETCH) as u8,
        code,
    )
}

pub fn write_backtrace(out: &mut impl Write, eip: u32, frames: &[u32]) -> fmt::Result {
    writeln!(out, "  backtrace:")?;
    writeln!(out, "    #0 {:#010x}", eip)?;
    for (depth, ret) in frames.iter().enumerate() {
        writeln!(out, "    #{} {:#010x}", depth + 1, ret)?;
    }
    Ok(())
}

/// Full diagnostic for an exception frame: header, registers, fault decode, backtrace.
///
/// `pid` is `None` when the faulting context is not known, i.e. the fault hit
/// while the kernel state was in use.
pub fn write_exception_report(
    out: &mut impl Write,
    frame: &TrapFrame,
    fault_address: u32,
    pid: Option<u32>,
    frames: &[u32],
) -> fmt::Result {
    let origin = if frame.from_user() { "user" } else { "kernel" };
    write!(
        out,
        "{} exception {} ({})",
        origin,
        frame.int_no,
        exception_name(frame.int_no)
    )?;
    match pid {
        Some(pid) => writeln!(out, " in pid {}", pid)?,
        None => writeln!(out, " inside the kernel")?,
    }
    write_registers(out, frame)?;
    if frame.int_no == EXCEPTION_PAGE_FAULT {
        write_page_fault(out, PageFaultCode::from_bits_truncate(frame.err_code), fault_address)?;
    }
    write_backtrace(out, frame.eip, frames)
}

/// Frame-pointer chain of kernel code, read through the identity window.
pub fn kernel_backtrace(mem: &(impl crate::arch::PhysicalMemory + ?Sized), ebp: u32, depth: usize) -> Vec<u32> {
    backtrace(ebp, depth, |addr| {
        let end = addr.checked_add(4)?;
        (end <= KERNEL_IDENTITY_END).then(|| mem.read_u32(PhysAddr(addr)))
    })
}

/// Kernel-mode exception: report to console and serial, then halt.
///
/// Only the machine is touched, so this also works for a fault taken while
/// the kernel object is locked by the code that faulted.
pub fn kernel_fault<M: Machine + ?Sized>(
    machine: &mut M,
    frame: &TrapFrame,
    pid: Option<u32>,
    depth: usize,
) -> ! {
    machine.disable_interrupts();
    let fault_address = if frame.int_no == EXCEPTION_PAGE_FAULT {
        machine.fault_address()
    } else {
        0
    };
    let frames = kernel_backtrace(&*machine, frame.ebp, depth);
    {
        let mut out = DiagnosticWriter::new(&mut *machine);
        let _ = write_exception_report(&mut out, frame, fault_address, pid, &frames);
    }
    crate::panic::fatal(
        machine,
        format_args!(
            "{} in kernel mode at eip={:#x}",
            exception_name(frame.int_no),
            frame.eip
        ),
    )
}
