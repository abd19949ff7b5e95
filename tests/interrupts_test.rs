//! Interrupt path integration tests: IDT layout, PIC programming, IRQ
//! routing and exception handling in both privilege levels.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use vos_kernel::arch::idt::{GATE_USER_INTERRUPT, IRQ_BASE, SYSCALL_VECTOR};
use vos_kernel::arch::pic::{PIC1_COMMAND, PIC1_DATA, PIC2_COMMAND, PIC2_DATA, PIC_EOI};
use vos_kernel::arch::{Machine, PhysAddr, PhysicalMemory, TrapFrame};
use vos_kernel::interrupts::exceptions::kernel_fault;
use vos_kernel::interrupts::KEYBOARD_LINE;
use vos_kernel::memory::vmm::USER_STACK_TOP;
use vos_kernel::scheduler::TaskState;
use vos_kernel::testing::{self, MockMachine};
use vos_kernel::{Kernel, KernelConfig};

fn boot() -> Kernel<MockMachine> {
    testing::boot(KernelConfig::default())
}

/// Boots, spawns one user task and lets the first tick switch to it.
fn boot_into_user() -> (Kernel<MockMachine>, u32, TrapFrame) {
    let mut kernel = boot();
    let pid = testing::spawn_test_task(&mut kernel, "victim");
    let frame = kernel.dispatch(testing::timer_irq(&testing::idle_frame()));
    assert_eq!(kernel.current_pid(), pid);
    (kernel, pid, frame)
}

/// Contract: every vector has a gate; only the syscall gate is reachable from ring 3.
/// Given: A kernel booted with distinct fake trampoline addresses.
/// When: The IDT is inspected.
/// Then: Exceptions, IRQs, syscall and default vectors point at their stubs.
/// Failure Impact: An `int 0x80` from user mode would raise #GP instead of a syscall.
#[test]
fn test_idt_gates_point_at_trampolines() {
    let kernel = boot();
    let handlers = testing::fake_handlers();
    let idt = kernel.idt();

    let pf = idt.entry(14).expect("vector 14");
    assert_eq!(pf.handler(), handlers.exceptions[14]);
    assert!(pf.present());
    assert_eq!(pf.dpl(), 0);

    let kbd = idt.entry(IRQ_BASE + KEYBOARD_LINE as u32).expect("irq 1");
    assert_eq!(kbd.handler(), handlers.irqs[1]);

    let sys = idt.entry(SYSCALL_VECTOR).expect("syscall");
    assert_eq!(sys.handler(), handlers.syscall);
    assert_eq!(sys.type_attr(), GATE_USER_INTERRUPT);
    assert_eq!(sys.dpl(), 3);

    assert_eq!(idt.entry(0x99).expect("unused").handler(), handlers.default);
    assert_eq!(kernel.machine().idt_loads, 1);
}

/// Contract: the PICs are remapped to 0x20/0x28 with timer and keyboard open.
/// Given: A freshly booted kernel.
/// When: The port writes recorded by the mock machine are inspected.
/// Then: ICW2 carries the new bases and the master mask opens lines 0..2.
/// Failure Impact: IRQs would arrive on exception vectors and look like CPU faults.
#[test]
fn test_pic_remap_sequence() {
    let kernel = boot();
    let machine = kernel.machine();
    assert_eq!(machine.writes_to(PIC1_DATA)[..4], [0x20, 0x04, 0x01, 0xF8]);
    assert_eq!(machine.writes_to(PIC2_DATA)[..4], [0x28, 0x02, 0x01, 0xFF]);
    assert_eq!(kernel.pics().masks(), (0xF8, 0xFF));
}

/// Contract: every IRQ is counted, handled and acknowledged.
/// Given: A handler registered on the keyboard line.
/// When: IRQ 1 and IRQ 12 are dispatched.
/// Then: The handler runs once, both lines are counted, and slave lines EOI both PICs.
/// Failure Impact: A missing EOI silences the line (and every lower-priority line) forever.
#[test]
fn test_irq_handler_and_eoi() {
    let mut kernel = boot();
    let seen = Arc::new(AtomicU32::new(0));
    let sink = seen.clone();
    kernel
        .register_irq(KEYBOARD_LINE, move |_: u8, _: &TrapFrame| {
            sink.fetch_add(1, Ordering::Relaxed);
        })
        .expect("register");

    let master_before = kernel.machine().writes_to(PIC1_COMMAND).len();
    let slave_before = kernel.machine().writes_to(PIC2_COMMAND).len();
    let idle = testing::idle_frame();

    let back = kernel.dispatch(testing::irq(&idle, KEYBOARD_LINE));
    assert_eq!(back.eip, idle.eip, "non-timer IRQ resumes the interrupted context");
    kernel.dispatch(testing::irq(&idle, 12));

    assert_eq!(seen.load(Ordering::Relaxed), 1);
    assert_eq!(kernel.irq_count(KEYBOARD_LINE), 1);
    assert_eq!(kernel.irq_count(12), 1);
    let master = kernel.machine().writes_to(PIC1_COMMAND);
    let slave = kernel.machine().writes_to(PIC2_COMMAND);
    assert_eq!(master.len(), master_before + 2);
    assert_eq!(slave.len(), slave_before + 1);
    assert_eq!(master.last(), Some(&PIC_EOI));
}

/// Contract: the timer advances the tick counter; its callback runs before scheduling.
/// Given: A booted kernel with only the idle task and a callback registered on IRQ 0.
/// When: Three timer IRQs are dispatched.
/// Then: The callback sees every tick, ticks advance by three and idle keeps running.
/// Failure Impact: Drivers hooked on the PIT would never run, or would steal the scheduler's clock.
#[test]
fn test_timer_ticks_with_only_idle() {
    let mut kernel = boot();
    let seen = Arc::new(AtomicU32::new(0));
    let sink = seen.clone();
    kernel
        .register_irq(0, move |line: u8, _: &TrapFrame| {
            assert_eq!(line, 0);
            sink.fetch_add(1, Ordering::Relaxed);
        })
        .expect("timer callback");

    let mut frame = testing::idle_frame();
    for _ in 0..3 {
        frame = kernel.dispatch(testing::timer_irq(&frame));
    }
    assert_eq!(seen.load(Ordering::Relaxed), 3);
    assert_eq!(kernel.irq_count(0), 3);
    assert_eq!(kernel.ticks(), 3);
    assert_eq!(kernel.timer_ticks_seen(), 3);
    assert_eq!(kernel.current_pid(), 1);
    assert_eq!(frame.eip, testing::idle_frame().eip);
    assert_eq!(kernel.uptime_ms(), 3);
}

/// Contract: a timer callback observes the interrupted task, then the tick may switch.
/// Given: One user task and a callback on IRQ 0 recording the frame's eip.
/// When: The first timer IRQ arrives while idle runs.
/// Then: The callback saw idle's frame and the dispatcher still switched to the task.
/// Failure Impact: A timer driver would see the wrong context or block preemption.
#[test]
fn test_timer_callback_runs_before_switch() {
    let mut kernel = boot();
    let seen_eip = Arc::new(AtomicU32::new(0));
    let sink = seen_eip.clone();
    kernel
        .register_irq(0, move |_: u8, frame: &TrapFrame| {
            sink.store(frame.eip, Ordering::Relaxed);
        })
        .expect("timer callback");
    let pid = testing::spawn_test_task(&mut kernel, "worker");

    let idle = testing::idle_frame();
    let next = kernel.dispatch(testing::timer_irq(&idle));
    assert_eq!(seen_eip.load(Ordering::Relaxed), idle.eip);
    assert_eq!(kernel.current_pid(), pid);
    assert!(testing::is_user_frame(&next));
}

/// Contract: finishing boot does not open the interrupt window.
/// Given: A booted kernel with the timer programmed and one task ready.
/// When: Boot is marked complete.
/// Then: Interrupts are still disabled, so no IRQ can re-enter the kernel while boot code holds it.
/// Failure Impact: The first timer tick would arrive while the kernel is still locked and halt the machine.
#[test]
fn test_start_leaves_interrupts_disabled() {
    let mut kernel = boot();
    testing::spawn_test_task(&mut kernel, "init");
    assert!(!kernel.machine().interrupts_enabled());

    kernel.start();
    assert!(!kernel.machine().interrupts_enabled());
    assert_eq!(kernel.ticks(), 0);
}

/// Contract: unknown vectors are logged and ignored.
/// Given: A booted kernel.
/// When: Vector 0x99 arrives.
/// Then: The interrupted frame is resumed unchanged.
/// Failure Impact: A stray interrupt would crash the kernel.
#[test]
fn test_spurious_vector_is_ignored() {
    let mut kernel = boot();
    let mut frame = testing::idle_frame();
    frame.int_no = 0x99;
    assert_eq!(kernel.dispatch(frame), frame);
}

/// Contract: a user page fault terminates only the faulting task.
/// Given: A user task that dereferences address 0.
/// When: Vector 14 arrives from ring 3 with CR2 = 0.
/// Then: The task becomes a zombie with code -14, a report is printed, and idle resumes.
/// Failure Impact: One buggy program would take the whole system down.
#[test]
fn test_user_page_fault_kills_task() {
    let (mut kernel, pid, frame) = boot_into_user();
    kernel.machine_mut().cr2 = 0;
    kernel.machine_mut().clear_output();

    let next = kernel.dispatch(testing::exception(&frame, 14, 0b100));
    assert_eq!(kernel.task_state(pid), Some(TaskState::Zombie { exit_code: -14 }));
    assert_eq!(kernel.current_pid(), 1);
    assert!(!next.from_user());

    let console = kernel.machine().console_text();
    assert!(console.contains("Page Fault"), "report: {}", console);
    assert!(console.contains(&format!("pid {}", pid)));
    assert!(kernel.machine().serial_text().contains("Page Fault"));
}

/// Contract: a division error exits with a code distinct from exit(0).
/// Given: A running user task.
/// When: Vector 0 arrives from ring 3.
/// Then: The task's exit code is -256.
/// Failure Impact: A parent could not tell a crash from a clean exit.
#[test]
fn test_divide_error_exit_code() {
    let (mut kernel, pid, frame) = boot_into_user();
    kernel.dispatch(testing::exception(&frame, 0, 0));
    assert_eq!(kernel.task_state(pid), Some(TaskState::Zombie { exit_code: -256 }));
}

/// Contract: faults on the stack guard page are reported as stack overflow.
/// Given: A user task whose stack guard page lies below its 4-page stack.
/// When: A page fault at the guard address arrives.
/// Then: The report names the guard page overflow and the task dies with -14.
/// Failure Impact: Runaway recursion would be indistinguishable from a wild pointer.
#[test]
fn test_guard_page_fault_mentions_overflow() {
    let (mut kernel, pid, frame) = boot_into_user();
    let guard = USER_STACK_TOP - 5 * 4096;
    kernel.machine_mut().cr2 = guard + 0x10;
    kernel.dispatch(testing::exception(&frame, 14, 0b110));
    assert!(kernel.machine().console_text().contains("stack overflow into guard page"));
    assert_eq!(kernel.task_state(pid), Some(TaskState::Zombie { exit_code: -14 }));
}

/// Contract: an exception in kernel mode halts the machine.
/// Given: A booted kernel running idle.
/// When: A general protection fault arrives with a ring-0 frame.
/// Then: The machine halts after printing the panic banner.
/// Failure Impact: The kernel would continue on corrupted state.
#[test]
#[should_panic(expected = "kernel halted")]
fn test_kernel_exception_is_fatal() {
    let mut kernel = boot();
    kernel.dispatch(testing::exception(&testing::idle_frame(), 13, 0));
}

/// Contract: a kernel-mode fault report reaches console and serial before halting.
/// Given: A booted kernel.
/// When: A kernel page fault is dispatched inside catch_unwind.
/// Then: Both sinks contain the exception name and the panic banner.
/// Failure Impact: Kernel crashes leave no diagnostics.
#[test]
fn test_kernel_exception_report() {
    let mut kernel = boot();
    kernel.machine_mut().cr2 = 0xDEAD_0000;
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        kernel.dispatch(testing::exception(&testing::idle_frame(), 14, 0b010));
    }));
    assert!(result.is_err());
    let console = kernel.machine().console_text();
    assert!(console.contains("kernel exception 14"));
    assert!(console.contains("KERNEL PANIC"));
    assert!(kernel.machine().serial_text().contains("0xdead0000"));
}

/// Contract: a missing trap frame is an invariant violation.
/// Given: A booted kernel.
/// When: The trampoline entry receives no frame.
/// Then: The machine halts.
/// Failure Impact: Dereferencing a null frame would resume garbage state.
#[test]
#[should_panic(expected = "kernel halted")]
fn test_null_frame_is_fatal() {
    let mut kernel = boot();
    kernel.enter(None);
}

/// Contract: a kernel fault is fully reported even when no kernel state is reachable.
/// Given: A bare machine (no kernel object), CR2 set, and a two-frame EBP chain in RAM.
/// When: A ring-0 page fault is reported from the CPU frame alone.
/// Then: Header, registers, fault decode and both return addresses reach console and serial before the halt.
/// Failure Impact: Faults inside syscall or paging code would die with no diagnostics.
#[test]
fn test_kernel_fault_report_without_kernel_state() {
    let mut machine = MockMachine::new(1 << 20);
    machine.cr2 = 0x0BAD_F00D;
    machine.write(PhysAddr(0x9000), &0x9100u32.to_le_bytes());
    machine.write(PhysAddr(0x9004), &0x0010_1234u32.to_le_bytes());
    machine.write(PhysAddr(0x9100), &0u32.to_le_bytes());
    machine.write(PhysAddr(0x9104), &0x0010_5678u32.to_le_bytes());

    let mut frame = TrapFrame::kernel_entry(0x0010_2000, 0x9800);
    frame.int_no = 14;
    frame.err_code = 0b010;
    frame.ebp = 0x9000;

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        kernel_fault(&mut machine, &frame, None, 16);
    }));
    let message = result.expect_err("halts");
    assert_eq!(message.downcast_ref::<&str>(), Some(&"kernel halted"));

    let console = machine.console_text();
    assert!(console.contains("kernel exception 14 (Page Fault) inside the kernel"), "{}", console);
    assert!(console.contains("eip=0x00102000"));
    assert!(console.contains("page fault at 0x0badf00d: present=0 write=1 user=0"));
    assert!(console.contains("#1 0x00101234"));
    assert!(console.contains("#2 0x00105678"));
    assert!(console.contains("KERNEL PANIC"));
    assert!(machine.serial_text().contains("0x0badf00d"));
}
